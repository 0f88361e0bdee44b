//! Windowed delivery dedup
//!
//! Remembers recently seen `(channel id, nonce)` pairs for a bounded
//! window. Entries older than the window are pruned on every check, and
//! the oldest entries are evicted once `max_entries` is reached, so memory
//! stays bounded under a delivery flood.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

type Key = (String, String);

#[derive(Default)]
struct DedupInner {
    seen: HashMap<Key, DateTime<Utc>>,
    /// Insertion order, oldest first
    order: VecDeque<(Key, DateTime<Utc>)>,
}

/// Recently seen deliveries
pub struct DedupCache {
    window: Duration,
    max_entries: usize,
    inner: Mutex<DedupInner>,
}

impl DedupCache {
    pub fn new(window: Duration, max_entries: usize) -> Self {
        Self {
            window,
            max_entries: max_entries.max(1),
            inner: Mutex::new(DedupInner::default()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a delivery; true the first time it is seen within the window
    pub fn first_sight(&self, channel_id: &str, nonce: &str, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        self.prune(&mut inner, now);

        let key = (channel_id.to_string(), nonce.to_string());
        if inner.seen.contains_key(&key) {
            return false;
        }

        while inner.seen.len() >= self.max_entries {
            match inner.order.pop_front() {
                Some((old, at)) => {
                    if inner.seen.get(&old) == Some(&at) {
                        inner.seen.remove(&old);
                    }
                }
                None => break,
            }
        }

        inner.seen.insert(key.clone(), now);
        inner.order.push_back((key, now));
        true
    }

    fn prune(&self, inner: &mut DedupInner, now: DateTime<Utc>) {
        while let Some((_, at)) = inner.order.front() {
            if *at + self.window > now {
                break;
            }
            if let Some((key, at)) = inner.order.pop_front() {
                if inner.seen.get(&key) == Some(&at) {
                    inner.seen.remove(&key);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
