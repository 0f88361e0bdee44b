//! Channel lifecycle manager
//!
//! Creates one channel per watched topic, renews channels before their
//! lease runs out, and retires them. The provider has no in-place renewal,
//! so a renewal creates a replacement channel, swaps it into the registry,
//! then stops the old one.
//!
//! Every topic whose create or renewal exhausts its retries raises an
//! [`Alert`]; the alert stays until that topic next gets a live channel,
//! and [`ChannelManager::health`] reports `Failing` while any alert is
//! open.

use crate::clock::Clock;
use crate::error::{Result, WatchError};
use crate::provider::ReportsProvider;
use crate::registry::ChannelRegistry;
use crate::retry::{with_retry, RetryPolicy};
use crate::types::{
    ChannelHandle, ChannelRequest, ChannelState, ChannelSummary, EventFilter, ResourceKey, Topic,
    WatchChannel,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Lease and renewal settings
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Lease requested for every new channel
    pub lease: chrono::Duration,
    /// Channels expiring within this window are renewed by a scan
    pub renewal_window: chrono::Duration,
    /// Backoff for create calls
    pub retry: RetryPolicy,
    /// Timeout for each individual provider call
    pub call_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            lease: chrono::Duration::hours(5),
            renewal_window: chrono::Duration::minutes(30),
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Operator-visible failure of a topic
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    pub kind: &'static str,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every watched topic has a live channel
    Healthy,
    /// Renewal in backoff, or a topic is waiting for a channel
    Degraded,
    /// At least one topic exhausted its retries
    Failing,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub channels: Vec<ChannelSummary>,
    pub alerts: Vec<Alert>,
    pub missing_topics: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

/// One successful renewal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Renewal {
    pub topic: Topic,
    pub old_id: String,
    pub new_id: String,
}

/// What one renewal scan did
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// Terminal channels removed from the registry
    pub collected: Vec<String>,
    /// Active channels whose lease lapsed before a renewal
    pub expired: Vec<String>,
    pub renewed: Vec<Renewal>,
    /// Channels whose renewal exhausted its retries
    pub failed: Vec<String>,
    /// Watched topics that had no channel and got a new one
    pub recreated: Vec<String>,
}

impl ScanReport {
    pub fn is_idle(&self) -> bool {
        self.collected.is_empty()
            && self.expired.is_empty()
            && self.renewed.is_empty()
            && self.failed.is_empty()
            && self.recreated.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct TopicFailure {
    pub kind: &'static str,
    pub message: String,
}

impl TopicFailure {
    fn from_error(e: &WatchError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TopicOutcome {
    pub topic: Topic,
    pub result: std::result::Result<ChannelSummary, TopicFailure>,
}

/// Per-topic results of a batch of watch attempts
///
/// Attempts are independent; the caller decides whether failures are
/// fatal or mean running degraded on pull-mode backfill.
#[derive(Debug, Clone, Default)]
pub struct StartupReport {
    pub outcomes: Vec<TopicOutcome>,
}

impl StartupReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &ChannelSummary> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = (&Topic, &TopicFailure)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|f| (&o.topic, f)))
    }

    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    /// Any topic failed because credentials were rejected or missing
    pub fn authentication_failed(&self) -> bool {
        self.failed()
            .any(|(_, f)| f.kind == "authentication_unavailable")
    }
}

/// What was done with channels persisted by a previous run
#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    pub adopted: Vec<String>,
    /// Channels for topics no longer watched, stopped at the provider
    pub stopped: Vec<String>,
    /// Pending, terminal, or lapsed channels that were discarded
    pub dropped: Vec<String>,
}

/// Channel lifecycle manager
pub struct ChannelManager {
    provider: Arc<dyn ReportsProvider>,
    registry: Arc<ChannelRegistry>,
    clock: Arc<dyn Clock>,
    config: ManagerConfig,
    /// Topics that should always have a live channel
    desired: RwLock<BTreeSet<Topic>>,
    alerts: RwLock<BTreeMap<Topic, Alert>>,
}

impl ChannelManager {
    pub fn new(
        provider: Arc<dyn ReportsProvider>,
        registry: Arc<ChannelRegistry>,
        clock: Arc<dyn Clock>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            provider,
            registry,
            clock,
            config,
            desired: RwLock::new(BTreeSet::new()),
            alerts: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Topics the manager keeps watched
    pub async fn watched_topics(&self) -> Vec<Topic> {
        self.desired.read().await.iter().cloned().collect()
    }

    /// Return the live channel for a topic, creating one if needed
    ///
    /// An Active or Renewing channel is returned unchanged. A channel
    /// still Pending means another create is in flight and yields
    /// `Conflict`. Otherwise a fresh channel is registered as Pending and
    /// created at the provider; on failure it is recorded as Failed, an
    /// alert is raised, and the error is returned.
    pub async fn ensure_watch(
        &self,
        resource: ResourceKey,
        filter: EventFilter,
    ) -> Result<WatchChannel> {
        let topic = Topic::new(resource, filter);
        self.desired.write().await.insert(topic.clone());

        let now = self.clock.now();
        if let Some(existing) = self.registry.find_by_topic(&topic).await {
            match existing.state {
                ChannelState::Active if !existing.is_expired_at(now) => return Ok(existing),
                ChannelState::Renewing => return Ok(existing),
                ChannelState::Pending => {
                    return Err(WatchError::Conflict {
                        topic: topic.to_string(),
                        existing: existing.id,
                    })
                }
                _ => {
                    // A Failed renewal can leave the provider lease running
                    if !existing.is_expired_at(now) {
                        self.stop_remote(&existing).await;
                    }
                    self.registry.remove(&existing.id).await;
                }
            }
        }

        let channel = WatchChannel::pending(topic.clone(), now + self.config.lease, now);
        self.registry.register(channel.clone()).await?;

        match self.create_remote(&channel.request(), None).await {
            Ok(handle) => {
                let active = self.registry.update(&channel.id, |c| c.activate(handle)).await?;
                self.clear_alert(&topic).await;
                tracing::info!(
                    channel_id = %active.id,
                    topic = %topic,
                    expires_at = %active.expires_at,
                    "Watch channel active"
                );
                Ok(active)
            }
            Err(e) => {
                let message = e.to_string();
                self.registry
                    .update(&channel.id, |c| {
                        c.state = ChannelState::Failed;
                        c.last_error = Some(message);
                    })
                    .await?;
                self.raise_alert(&topic, Some(&channel.id), &e).await;
                tracing::error!(
                    channel_id = %channel.id,
                    topic = %topic,
                    error = %e,
                    "Failed to create watch channel"
                );
                Err(e)
            }
        }
    }

    /// Watch every topic, one supervised task per topic
    pub async fn ensure_topics(self: &Arc<Self>, topics: Vec<Topic>) -> StartupReport {
        let tasks: Vec<_> = topics
            .into_iter()
            .map(|topic| {
                let manager = Arc::clone(self);
                let t = topic.clone();
                let handle = tokio::spawn(async move {
                    manager.ensure_watch(t.resource, t.filter).await
                });
                (topic, handle)
            })
            .collect();

        let mut report = StartupReport::default();
        for (topic, handle) in tasks {
            let result = match handle.await {
                Ok(Ok(channel)) => Ok(channel.summary()),
                Ok(Err(e)) => Err(TopicFailure::from_error(&e)),
                Err(join_err) => {
                    tracing::error!(topic = %topic, error = %join_err, "Watch task aborted");
                    Err(TopicFailure {
                        kind: "task",
                        message: join_err.to_string(),
                    })
                }
            };
            report.outcomes.push(TopicOutcome { topic, result });
        }
        report
    }

    /// One renewal scan
    ///
    /// In order: collect terminal channels left by the previous scan,
    /// mark lapsed Active channels Expired, renew Active channels
    /// expiring within the renewal window, then create channels for
    /// watched topics that have none (or only an Expired one). Channels
    /// that fail renewal stay Failed until the next scan collects them.
    pub async fn renew_if_needed(&self, now: DateTime<Utc>) -> ScanReport {
        let mut report = ScanReport::default();

        for channel in self.registry.gc_terminal().await {
            if channel.state == ChannelState::Failed && !channel.is_expired_at(now) {
                self.stop_remote(&channel).await;
            }
            report.collected.push(channel.id);
        }

        for channel in self.registry.list_expiring_before(now).await {
            if channel.state != ChannelState::Active || !channel.is_expired_at(now) {
                continue;
            }
            if let Ok(true) = self
                .registry
                .transition(&channel.id, ChannelState::Active, ChannelState::Expired)
                .await
            {
                tracing::warn!(
                    channel_id = %channel.id,
                    topic = %channel.topic,
                    expired_at = %channel.expires_at,
                    "Channel lease lapsed without renewal"
                );
                let e = WatchError::ProviderUnavailable(format!(
                    "channel {} expired at {} before renewal",
                    channel.id, channel.expires_at
                ));
                self.raise_alert(&channel.topic, Some(&channel.id), &e).await;
                report.expired.push(channel.id);
            }
        }

        let due: Vec<WatchChannel> = self
            .registry
            .list_expiring_before(now + self.config.renewal_window)
            .await
            .into_iter()
            .filter(|c| c.state == ChannelState::Active)
            .collect();

        let results =
            futures::future::join_all(due.into_iter().map(|c| self.renew_channel(c, now))).await;
        for result in results {
            match result {
                Ok(Some(renewal)) => report.renewed.push(renewal),
                Ok(None) => {}
                Err(id) => report.failed.push(id),
            }
        }

        for topic in self.watched_topics().await {
            let holder = self.registry.find_by_topic(&topic).await;
            let needs_channel = match &holder {
                None => true,
                Some(c) => c.state == ChannelState::Expired,
            };
            if !needs_channel {
                continue;
            }
            match self.ensure_watch(topic.resource.clone(), topic.filter.clone()).await {
                Ok(channel) => report.recreated.push(channel.id),
                Err(e) => {
                    tracing::warn!(topic = %topic, error = %e, "Could not recreate missing channel");
                }
            }
        }

        if !report.is_idle() {
            tracing::info!(
                renewed = report.renewed.len(),
                failed = report.failed.len(),
                expired = report.expired.len(),
                recreated = report.recreated.len(),
                collected = report.collected.len(),
                "Renewal scan complete"
            );
        }
        report
    }

    /// Replace one channel; `Err(id)` when retries were exhausted
    async fn renew_channel(
        &self,
        old: WatchChannel,
        now: DateTime<Utc>,
    ) -> std::result::Result<Option<Renewal>, String> {
        match self
            .registry
            .transition(&old.id, ChannelState::Active, ChannelState::Renewing)
            .await
        {
            Ok(true) => {}
            _ => return Ok(None),
        }

        let mut replacement = WatchChannel::pending(old.topic.clone(), now + self.config.lease, now);
        let handle = match self.create_remote(&replacement.request(), Some(&old.id)).await {
            Ok(handle) => handle,
            Err(e) => {
                let message = e.to_string();
                let _ = self
                    .registry
                    .update(&old.id, |c| {
                        c.state = ChannelState::Failed;
                        c.last_error = Some(message);
                    })
                    .await;
                self.raise_alert(&old.topic, Some(&old.id), &e).await;
                tracing::error!(
                    channel_id = %old.id,
                    topic = %old.topic,
                    error = %e,
                    "Channel renewal failed, retries exhausted"
                );
                return Err(old.id);
            }
        };

        replacement.activate(handle);
        if let Err(e) = self.registry.replace(&old.id, replacement.clone()).await {
            // Old channel was unsubscribed while the replacement was created
            tracing::warn!(
                channel_id = %old.id,
                error = %e,
                "Channel gone before renewal completed, stopping replacement"
            );
            self.stop_remote(&replacement).await;
            return Ok(None);
        }

        self.stop_remote(&old).await;
        self.clear_alert(&old.topic).await;
        tracing::info!(
            old_channel_id = %old.id,
            channel_id = %replacement.id,
            topic = %old.topic,
            expires_at = %replacement.expires_at,
            "Channel renewed"
        );

        Ok(Some(Renewal {
            topic: old.topic,
            old_id: old.id,
            new_id: replacement.id,
        }))
    }

    /// Stop a channel at the provider (best effort) and forget it
    pub async fn unsubscribe(&self, id: &str) -> Result<()> {
        let channel = self.registry.lookup(id).await?;
        self.desired.write().await.remove(&channel.topic);

        self.stop_remote(&channel).await;
        self.registry.remove(id).await;
        self.clear_alert(&channel.topic).await;

        tracing::info!(channel_id = %id, topic = %channel.topic, "Unsubscribed");
        Ok(())
    }

    /// Re-adopt channels persisted by a previous run
    ///
    /// Live channels for topics in `configured` with an unexpired lease
    /// are registered as Active. Live channels for other topics are
    /// stopped. Everything else is discarded.
    pub async fn restore(
        &self,
        persisted: Vec<WatchChannel>,
        configured: &BTreeSet<Topic>,
    ) -> RestoreReport {
        let now = self.clock.now();
        let mut report = RestoreReport::default();

        for mut channel in persisted {
            let live = matches!(channel.state, ChannelState::Active | ChannelState::Renewing)
                && channel.handle.is_some()
                && !channel.is_expired_at(now);

            if !live {
                report.dropped.push(channel.id);
                continue;
            }
            if !configured.contains(&channel.topic) {
                self.stop_remote(&channel).await;
                tracing::info!(
                    channel_id = %channel.id,
                    topic = %channel.topic,
                    "Stopped channel for topic no longer watched"
                );
                report.stopped.push(channel.id);
                continue;
            }

            channel.state = ChannelState::Active;
            channel.renewal_attempts = 0;
            let topic = channel.topic.clone();
            let id = channel.id.clone();
            match self.registry.register(channel.clone()).await {
                Ok(()) => {
                    self.desired.write().await.insert(topic);
                    report.adopted.push(id);
                }
                Err(e) => {
                    tracing::warn!(channel_id = %id, error = %e, "Discarding persisted channel");
                    self.stop_remote(&channel).await;
                    report.dropped.push(id);
                }
            }
        }

        if !report.adopted.is_empty() || !report.stopped.is_empty() {
            tracing::info!(
                adopted = report.adopted.len(),
                stopped = report.stopped.len(),
                dropped = report.dropped.len(),
                "Persisted channels restored"
            );
        }
        report
    }

    /// Stop every live channel at the provider and empty the registry
    ///
    /// Returns the number of channels a stop was issued for.
    pub async fn shutdown_all(&self) -> usize {
        let now = self.clock.now();
        let channels = self.registry.snapshot().await;

        let to_stop: Vec<&WatchChannel> = channels
            .iter()
            .filter(|c| c.state.is_live() && c.handle.is_some() && !c.is_expired_at(now))
            .collect();
        let stopped = to_stop.len();
        futures::future::join_all(to_stop.into_iter().map(|c| self.stop_remote(c))).await;

        for channel in &channels {
            self.registry.remove(&channel.id).await;
        }
        tracing::info!(stopped, "All channels shut down");
        stopped
    }

    /// Operator-facing health signal
    pub async fn health(&self) -> HealthReport {
        let channels = self.registry.snapshot().await;
        let alerts: Vec<Alert> = self.alerts.read().await.values().cloned().collect();
        let desired = self.desired.read().await;

        let covered: BTreeSet<&Topic> = channels
            .iter()
            .filter(|c| matches!(c.state, ChannelState::Active | ChannelState::Renewing))
            .map(|c| &c.topic)
            .collect();
        let missing_topics: Vec<String> = desired
            .iter()
            .filter(|t| !covered.contains(t))
            .map(Topic::to_string)
            .collect();
        let in_backoff = channels
            .iter()
            .any(|c| c.state == ChannelState::Renewing && c.renewal_attempts > 0);

        let status = if !alerts.is_empty() {
            HealthStatus::Failing
        } else if in_backoff || !missing_topics.is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            status,
            channels: channels.iter().map(WatchChannel::summary).collect(),
            alerts,
            missing_topics,
            checked_at: self.clock.now(),
        }
    }

    /// Provider create call with per-call timeout and backoff
    ///
    /// With `renewing` set, each failed attempt is counted on that channel
    /// before the backoff sleep, so health reports the backoff.
    async fn create_remote(
        &self,
        request: &ChannelRequest,
        renewing: Option<&str>,
    ) -> Result<ChannelHandle> {
        let provider = &self.provider;
        let registry = &self.registry;
        let limit = self.config.call_timeout;

        let handle = with_retry(&self.config.retry, "create_channel", |attempt| async move {
            let result =
                call_with_timeout(limit, "create_channel", provider.create_channel(request)).await;
            if let (Some(id), Err(_)) = (renewing, &result) {
                if let Err(e) = registry.update(id, |c| c.renewal_attempts = attempt + 1).await {
                    tracing::debug!(channel_id = %id, error = %e, "Could not record renewal attempt");
                }
            }
            result
        })
        .await?;

        if handle.expires_at <= self.clock.now() {
            return Err(WatchError::Provider(format!(
                "provider granted channel {} an expiration in the past ({})",
                handle.channel_id, handle.expires_at
            )));
        }
        Ok(handle)
    }

    async fn stop_remote(&self, channel: &WatchChannel) {
        let Some(handle) = &channel.handle else {
            return;
        };
        let result = call_with_timeout(
            self.config.call_timeout,
            "stop_channel",
            self.provider.stop_channel(handle),
        )
        .await;
        if let Err(e) = result {
            tracing::warn!(
                channel_id = %channel.id,
                error = %e,
                "Failed to stop channel at provider"
            );
        }
    }

    async fn raise_alert(&self, topic: &Topic, channel_id: Option<&str>, e: &WatchError) {
        let alert = Alert {
            topic: topic.to_string(),
            channel_id: channel_id.map(str::to_string),
            kind: e.kind(),
            message: e.to_string(),
            raised_at: self.clock.now(),
        };
        self.alerts.write().await.insert(topic.clone(), alert);
    }

    async fn clear_alert(&self, topic: &Topic) {
        if self.alerts.write().await.remove(topic).is_some() {
            tracing::info!(topic = %topic, "Alert cleared");
        }
    }
}

async fn call_with_timeout<T, F>(limit: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| WatchError::Timeout(format!("{} exceeded {:?}", operation, limit)))?
}
