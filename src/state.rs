//! Registry state persistence
//!
//! Provides pluggable persistence for watch channels and backfill
//! watermarks so a restart can re-adopt live channels instead of
//! re-watching every topic. The registry auto-saves after each mutation
//! when a `StateStore` is configured.

use crate::error::{Result, WatchError};
use crate::types::{ResourceKey, WatchChannel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Everything that survives a restart
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default)]
    pub channels: Vec<WatchChannel>,

    /// Newest backfilled event time per resource (`user/app`)
    #[serde(default)]
    pub watermarks: BTreeMap<String, DateTime<Utc>>,
}

impl PersistedState {
    pub fn watermark(&self, resource: &ResourceKey) -> Option<DateTime<Utc>> {
        self.watermarks.get(&resource.to_string()).copied()
    }
}

/// Trait for persisting registry state
pub trait StateStore: Send + Sync {
    /// Replace the stored state
    fn save(&self, state: &PersistedState) -> Result<()>;

    /// Load the stored state (empty when nothing was saved yet)
    fn load(&self) -> Result<PersistedState>;
}

/// JSON file-based state store
///
/// Atomic writes via temp file + rename to prevent corruption.
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStateStore {
    fn save(&self, state: &PersistedState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        let tmp_path = self.path.with_extension("tmp");

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                WatchError::State(format!(
                    "Failed to create state directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        std::fs::write(&tmp_path, json).map_err(|e| {
            WatchError::State(format!(
                "Failed to write state file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            WatchError::State(format!(
                "Failed to rename state file {} to {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        tracing::debug!(
            path = %self.path.display(),
            channels = state.channels.len(),
            "State saved"
        );
        Ok(())
    }

    fn load(&self) -> Result<PersistedState> {
        if !self.path.exists() {
            return Ok(PersistedState::default());
        }

        let json = std::fs::read_to_string(&self.path).map_err(|e| {
            WatchError::State(format!(
                "Failed to read state file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let state: PersistedState = serde_json::from_str(&json).map_err(|e| {
            WatchError::State(format!(
                "Failed to parse state file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        tracing::debug!(
            path = %self.path.display(),
            channels = state.channels.len(),
            "State loaded"
        );
        Ok(state)
    }
}

/// In-memory state store for testing
#[derive(Default)]
pub struct MemoryStateStore {
    state: std::sync::RwLock<PersistedState>,
}

impl MemoryStateStore {
    /// Store pre-seeded with `state`, as if a previous run had saved it
    pub fn with_state(state: PersistedState) -> Self {
        Self {
            state: std::sync::RwLock::new(state),
        }
    }
}

impl StateStore for MemoryStateStore {
    fn save(&self, state: &PersistedState) -> Result<()> {
        let mut stored = self
            .state
            .write()
            .map_err(|e| WatchError::State(format!("Failed to acquire state lock: {}", e)))?;
        *stored = state.clone();
        Ok(())
    }

    fn load(&self) -> Result<PersistedState> {
        let stored = self
            .state
            .read()
            .map_err(|e| WatchError::State(format!("Failed to acquire state lock: {}", e)))?;
        Ok(stored.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelState, EventFilter, Topic};

    fn sample_state() -> PersistedState {
        let now = Utc::now();
        let topic = Topic::new(
            ResourceKey::new("all", "login"),
            EventFilter::of(["login_success"]),
        );
        let mut channel = WatchChannel::pending(topic, now + chrono::Duration::hours(5), now);
        channel.state = ChannelState::Active;

        let mut watermarks = BTreeMap::new();
        watermarks.insert("all/login".to_string(), now);

        PersistedState {
            channels: vec![channel],
            watermarks,
        }
    }

    #[test]
    fn test_memory_store_save_load() {
        let store = MemoryStateStore::default();
        let state = sample_state();

        store.save(&state).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded.channels.len(), 1);
        assert_eq!(loaded.channels[0].id, state.channels[0].id);
        assert_eq!(loaded.channels[0].state, ChannelState::Active);
        assert!(loaded.watermark(&ResourceKey::new("all", "login")).is_some());
    }

    #[test]
    fn test_memory_store_empty_load() {
        let store = MemoryStateStore::default();
        let loaded = store.load().unwrap();
        assert!(loaded.channels.is_empty());
        assert!(loaded.watermarks.is_empty());
    }

    #[test]
    fn test_file_store_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channels.json");
        let store = FileStateStore::new(&path);
        let state = sample_state();

        store.save(&state).unwrap();
        assert!(path.exists());

        let loaded = store.load().unwrap();
        assert_eq!(loaded.channels.len(), 1);
        assert_eq!(loaded.channels[0].shared_token, state.channels[0].shared_token);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"watermarks\""));
        assert!(content.contains("all/login"));
    }

    #[test]
    fn test_file_store_load_nonexistent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("missing.json"));
        let loaded = store.load().unwrap();
        assert!(loaded.channels.is_empty());
    }

    #[test]
    fn test_file_store_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deep/channels.json");
        let store = FileStateStore::new(&path);
        store.save(&PersistedState::default()).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_file_store_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channels.json");
        let store = FileStateStore::new(&path);

        store.save(&sample_state()).unwrap();
        store.save(&sample_state()).unwrap();
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channels.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = FileStateStore::new(&path).load().unwrap_err();
        assert!(matches!(err, WatchError::State(_)));
    }
}
