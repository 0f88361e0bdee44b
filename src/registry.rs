//! Subscription registry
//!
//! In-memory store of watch channels, indexed by channel id and by topic.
//! Every operation takes the registry lock once, so renewal scans and
//! inbound deliveries see either the old channel or its replacement,
//! never a half-updated record. With a `StateStore` attached, each
//! mutation snapshots the registry under the lock and saves it on the
//! blocking pool after the lock is released; a newer snapshot is never
//! overwritten by an older one.

use crate::error::{Result, WatchError};
use crate::state::{PersistedState, StateStore};
use crate::types::{ChannelState, ResourceKey, Topic, WatchChannel};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

#[derive(Default)]
struct RegistryInner {
    by_id: HashMap<String, WatchChannel>,
    /// Topic → id of the channel currently holding it
    by_topic: HashMap<Topic, String>,
    watermarks: BTreeMap<String, DateTime<Utc>>,
    /// Bumped on every persisted mutation
    version: u64,
}

impl RegistryInner {
    fn insert(&mut self, channel: WatchChannel) {
        self.by_topic.insert(channel.topic.clone(), channel.id.clone());
        self.by_id.insert(channel.id.clone(), channel);
    }

    fn take(&mut self, id: &str) -> Option<WatchChannel> {
        let channel = self.by_id.remove(id)?;
        if self.by_topic.get(&channel.topic).map(String::as_str) == Some(id) {
            self.by_topic.remove(&channel.topic);
        }
        Some(channel)
    }

    /// Live channel already holding `topic`, if any
    fn live_holder(&self, topic: &Topic) -> Option<&WatchChannel> {
        self.by_topic
            .get(topic)
            .and_then(|id| self.by_id.get(id))
            .filter(|c| c.state.is_live())
    }

    fn snapshot(&self) -> PersistedState {
        let mut channels: Vec<WatchChannel> = self.by_id.values().cloned().collect();
        channels.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        PersistedState {
            channels,
            watermarks: self.watermarks.clone(),
        }
    }
}

/// Snapshot waiting to be written, tagged with its registry version
type PendingSave = Option<(u64, PersistedState)>;

/// Registry of watch channels
pub struct ChannelRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    store: Option<Arc<dyn StateStore>>,
    /// Version of the newest snapshot written to the store
    saved: Arc<Mutex<u64>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    /// Empty registry without persistence
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner::default())),
            store: None,
            saved: Arc::new(Mutex::new(0)),
        }
    }

    /// Empty registry that saves every mutation to `store`
    ///
    /// Nothing is loaded here; the service decides which persisted
    /// channels to re-adopt.
    pub fn with_store(store: Arc<dyn StateStore>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner::default())),
            store: Some(store),
            saved: Arc::new(Mutex::new(0)),
        }
    }

    /// Load what a previous run persisted (empty without a store)
    pub fn load_persisted(&self) -> Result<PersistedState> {
        match &self.store {
            Some(store) => store.load(),
            None => Ok(PersistedState::default()),
        }
    }

    /// Snapshot to save once the write guard is dropped
    fn stage(&self, inner: &mut RegistryInner) -> PendingSave {
        if self.store.is_none() {
            return None;
        }
        inner.version += 1;
        Some((inner.version, inner.snapshot()))
    }

    /// Write a staged snapshot unless a newer one is already stored
    async fn persist(&self, pending: PendingSave) {
        let (Some(store), Some((version, state))) = (self.store.clone(), pending) else {
            return;
        };
        let saved = Arc::clone(&self.saved);

        let written = tokio::task::spawn_blocking(move || {
            let mut last = saved.lock().unwrap_or_else(|e| e.into_inner());
            if version <= *last {
                return Ok(());
            }
            store.save(&state)?;
            *last = version;
            Ok::<_, WatchError>(())
        })
        .await;

        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(version, error = %e, "Failed to persist channel registry"),
            Err(e) => tracing::error!(version, error = %e, "Registry save task failed"),
        }
    }

    /// Add a channel
    ///
    /// Rejected with `Conflict` when a live channel already holds the
    /// same topic, or when the id is already registered. A terminal
    /// channel holding the topic is displaced.
    pub async fn register(&self, channel: WatchChannel) -> Result<()> {
        let mut inner = self.inner.write().await;

        if inner.by_id.contains_key(&channel.id) {
            return Err(WatchError::Conflict {
                topic: channel.topic.to_string(),
                existing: channel.id.clone(),
            });
        }
        if let Some(existing) = inner.live_holder(&channel.topic) {
            return Err(WatchError::Conflict {
                topic: channel.topic.to_string(),
                existing: existing.id.clone(),
            });
        }
        if let Some(stale) = inner.by_topic.get(&channel.topic).cloned() {
            inner.take(&stale);
        }

        tracing::debug!(
            channel_id = %channel.id,
            topic = %channel.topic,
            state = %channel.state,
            "Channel registered"
        );
        inner.insert(channel);
        let pending = self.stage(&mut inner);
        drop(inner);
        self.persist(pending).await;
        Ok(())
    }

    /// Get a channel by id
    pub async fn lookup(&self, id: &str) -> Result<WatchChannel> {
        let inner = self.inner.read().await;
        inner
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| WatchError::NotFound(format!("channel {}", id)))
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.by_id.contains_key(id)
    }

    /// Channel currently holding `topic`, live or terminal
    pub async fn find_by_topic(&self, topic: &Topic) -> Option<WatchChannel> {
        let inner = self.inner.read().await;
        inner
            .by_topic
            .get(topic)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    /// Live channels whose lease ends before `t`, soonest first
    pub async fn list_expiring_before(&self, t: DateTime<Utc>) -> Vec<WatchChannel> {
        let inner = self.inner.read().await;
        let mut channels: Vec<WatchChannel> = inner
            .by_id
            .values()
            .filter(|c| c.state.is_live() && c.expires_at < t)
            .cloned()
            .collect();
        channels.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        channels
    }

    /// Remove a channel; returns it if it was registered
    pub async fn remove(&self, id: &str) -> Option<WatchChannel> {
        let mut inner = self.inner.write().await;
        let removed = inner.take(id);
        if removed.is_some() {
            tracing::debug!(channel_id = %id, "Channel removed");
            let pending = self.stage(&mut inner);
            drop(inner);
            self.persist(pending).await;
        }
        removed
    }

    /// Mutate a channel in place
    ///
    /// `id` and `topic` are restored after `f` runs; a channel's identity
    /// cannot change through an update.
    pub async fn update<F>(&self, id: &str, f: F) -> Result<WatchChannel>
    where
        F: FnOnce(&mut WatchChannel),
    {
        let mut inner = self.inner.write().await;
        let channel = inner
            .by_id
            .get_mut(id)
            .ok_or_else(|| WatchError::NotFound(format!("channel {}", id)))?;

        let (original_id, original_topic) = (channel.id.clone(), channel.topic.clone());
        f(channel);
        channel.id = original_id;
        channel.topic = original_topic;

        let updated = channel.clone();
        let pending = self.stage(&mut inner);
        drop(inner);
        self.persist(pending).await;
        Ok(updated)
    }

    /// Move a channel from `from` to `to`; false if it was not in `from`
    pub async fn transition(&self, id: &str, from: ChannelState, to: ChannelState) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let channel = inner
            .by_id
            .get_mut(id)
            .ok_or_else(|| WatchError::NotFound(format!("channel {}", id)))?;

        if channel.state != from {
            return Ok(false);
        }
        channel.state = to;
        tracing::debug!(channel_id = %id, from = %from, to = %to, "Channel state changed");
        let pending = self.stage(&mut inner);
        drop(inner);
        self.persist(pending).await;
        Ok(true)
    }

    /// Swap `old_id` for `replacement` in one step
    ///
    /// The replacement must watch the same topic. Deliveries racing the
    /// swap resolve against either the old channel or the new one.
    pub async fn replace(&self, old_id: &str, replacement: WatchChannel) -> Result<WatchChannel> {
        let mut inner = self.inner.write().await;

        let old_topic = inner
            .by_id
            .get(old_id)
            .map(|c| c.topic.clone())
            .ok_or_else(|| WatchError::NotFound(format!("channel {}", old_id)))?;
        if old_topic != replacement.topic {
            return Err(WatchError::Conflict {
                topic: replacement.topic.to_string(),
                existing: old_id.to_string(),
            });
        }
        if inner.by_id.contains_key(&replacement.id) {
            return Err(WatchError::Conflict {
                topic: replacement.topic.to_string(),
                existing: replacement.id.clone(),
            });
        }

        let old = inner
            .take(old_id)
            .ok_or_else(|| WatchError::NotFound(format!("channel {}", old_id)))?;
        tracing::debug!(
            old_channel_id = %old_id,
            channel_id = %replacement.id,
            topic = %replacement.topic,
            "Channel replaced"
        );
        inner.insert(replacement);
        let pending = self.stage(&mut inner);
        drop(inner);
        self.persist(pending).await;
        Ok(old)
    }

    /// Remove every Expired or Failed channel
    pub async fn gc_terminal(&self) -> Vec<WatchChannel> {
        let mut inner = self.inner.write().await;
        let ids: Vec<String> = inner
            .by_id
            .values()
            .filter(|c| c.state.is_terminal())
            .map(|c| c.id.clone())
            .collect();

        let removed: Vec<WatchChannel> = ids.iter().filter_map(|id| inner.take(id)).collect();
        if !removed.is_empty() {
            tracing::debug!(count = removed.len(), "Terminal channels collected");
            let pending = self.stage(&mut inner);
            drop(inner);
            self.persist(pending).await;
        }
        removed
    }

    /// All channels, oldest first
    pub async fn snapshot(&self) -> Vec<WatchChannel> {
        self.inner.read().await.snapshot().channels
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.by_id.is_empty()
    }

    /// Newest event time already backfilled for `resource`
    pub async fn watermark(&self, resource: &ResourceKey) -> Option<DateTime<Utc>> {
        self.inner
            .read()
            .await
            .watermarks
            .get(&resource.to_string())
            .copied()
    }

    /// Advance the backfill watermark; never moves it backwards
    pub async fn set_watermark(&self, resource: &ResourceKey, at: DateTime<Utc>) {
        let mut inner = self.inner.write().await;
        let entry = inner.watermarks.entry(resource.to_string()).or_insert(at);
        if at > *entry {
            *entry = at;
        }
        let pending = self.stage(&mut inner);
        drop(inner);
        self.persist(pending).await;
    }

    /// Seed watermarks from persisted state
    pub async fn restore_watermarks(&self, watermarks: BTreeMap<String, DateTime<Utc>>) {
        let mut inner = self.inner.write().await;
        inner.watermarks.extend(watermarks);
    }
}
