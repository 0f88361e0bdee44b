//! Notification validator and dispatcher
//!
//! Every inbound delivery goes through [`Dispatcher::handle`]: registry
//! lookup, constant-time token check, windowed dedup, then hand-off to the
//! pluggable [`NotificationConsumer`]. The consumer runs in its own task
//! under a timeout; once a delivery is authenticated it is always
//! answered `Accepted`, whatever the consumer does.

use crate::clock::Clock;
use crate::dedup::DedupCache;
use crate::error::{Result, WatchError};
use crate::registry::ChannelRegistry;
use crate::token::tokens_match;
use crate::types::{
    ActivityEvent, NotificationEnvelope, ResourceKey, ResourceState, Topic,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// An authenticated, first-seen delivery
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub channel_id: String,
    pub topic: Topic,
    pub resource_state: ResourceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub received_at: DateTime<Utc>,
}

impl Delivery {
    /// The delivery only signals new activity; the consumer has to pull it
    pub fn needs_repull(&self) -> bool {
        self.payload.is_none() && self.resource_state != ResourceState::Sync
    }
}

/// Application logic receiving validated notifications
#[async_trait]
pub trait NotificationConsumer: Send + Sync {
    /// Handle one delivery; errors are logged, never returned to the provider
    async fn consume(&self, delivery: Delivery) -> Result<()>;

    /// Handle backfilled events for one resource, oldest first
    async fn on_backfill(&self, resource: &ResourceKey, events: Vec<ActivityEvent>) -> Result<()> {
        let _ = (resource, events);
        Ok(())
    }
}

/// Consumer that logs each delivery
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingConsumer;

#[async_trait]
impl NotificationConsumer for LoggingConsumer {
    async fn consume(&self, delivery: Delivery) -> Result<()> {
        tracing::info!(
            channel_id = %delivery.channel_id,
            topic = %delivery.topic,
            resource_state = ?delivery.resource_state,
            message_number = delivery.message_number.as_deref().unwrap_or("-"),
            payload = %delivery
                .payload
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_default(),
            "Notification received"
        );
        Ok(())
    }

    async fn on_backfill(&self, resource: &ResourceKey, events: Vec<ActivityEvent>) -> Result<()> {
        for event in &events {
            tracing::info!(
                resource = %resource,
                time = %event.time(),
                actor = event.actor.email.as_deref().unwrap_or("-"),
                events = ?event.events.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
                "Backfilled activity"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    UnknownChannel,
    AuthFailed,
}

/// Result of handling one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Forwarded to the consumer
    Accepted,
    /// Authenticated but already seen within the dedup window
    Duplicate,
    Rejected(RejectReason),
}

impl HandleOutcome {
    /// Accepted and duplicate deliveries both count as handled
    pub fn is_accepted(self) -> bool {
        matches!(self, HandleOutcome::Accepted | HandleOutcome::Duplicate)
    }

    /// `Ok` for handled deliveries, the matching error for rejections
    pub fn into_result(self, channel_id: &str) -> Result<()> {
        match self {
            HandleOutcome::Accepted | HandleOutcome::Duplicate => Ok(()),
            HandleOutcome::Rejected(RejectReason::UnknownChannel) => {
                Err(WatchError::UnknownChannel(channel_id.to_string()))
            }
            HandleOutcome::Rejected(RejectReason::AuthFailed) => {
                Err(WatchError::AuthFailed(channel_id.to_string()))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub dedup_window: chrono::Duration,
    pub dedup_capacity: usize,
    /// How long a delivery waits on the consumer before answering
    pub handler_timeout: Duration,
    /// Unknown-channel rejections within `drift_window` that signal drift
    pub drift_threshold: usize,
    pub drift_window: chrono::Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dedup_window: chrono::Duration::minutes(10),
            dedup_capacity: 10_000,
            handler_timeout: Duration::from_secs(5),
            drift_threshold: 20,
            drift_window: chrono::Duration::minutes(1),
        }
    }
}

/// Delivery counters since startup
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchStats {
    pub accepted: u64,
    pub duplicates: u64,
    pub unknown_channel: u64,
    pub auth_failed: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    duplicates: AtomicU64,
    unknown_channel: AtomicU64,
    auth_failed: AtomicU64,
}

/// Counts unknown-channel rejections in a sliding window
struct DriftDetector {
    threshold: usize,
    window: chrono::Duration,
    hits: Mutex<VecDeque<DateTime<Utc>>>,
}

impl DriftDetector {
    /// Record a rejection; true when the threshold is crossed
    fn record(&self, now: DateTime<Utc>) -> bool {
        if self.threshold == 0 {
            return false;
        }
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        while hits.front().is_some_and(|t| *t + self.window <= now) {
            hits.pop_front();
        }
        hits.push_back(now);
        if hits.len() >= self.threshold {
            hits.clear();
            true
        } else {
            false
        }
    }
}

/// Validates deliveries against the registry and forwards them
pub struct Dispatcher {
    registry: Arc<ChannelRegistry>,
    consumer: Arc<dyn NotificationConsumer>,
    clock: Arc<dyn Clock>,
    dedup: DedupCache,
    drift: DriftDetector,
    drift_signal: Arc<Notify>,
    handler_timeout: Duration,
    counters: Counters,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        consumer: Arc<dyn NotificationConsumer>,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            registry,
            consumer,
            clock,
            dedup: DedupCache::new(config.dedup_window, config.dedup_capacity),
            drift: DriftDetector {
                threshold: config.drift_threshold,
                window: config.drift_window,
                hits: Mutex::new(VecDeque::new()),
            },
            drift_signal: Arc::new(Notify::new()),
            handler_timeout: config.handler_timeout,
            counters: Counters::default(),
        }
    }

    /// Notified when unknown-channel rejections suggest registry drift
    pub fn drift_signal(&self) -> Arc<Notify> {
        self.drift_signal.clone()
    }

    pub fn consumer(&self) -> &Arc<dyn NotificationConsumer> {
        &self.consumer
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            unknown_channel: self.counters.unknown_channel.load(Ordering::Relaxed),
            auth_failed: self.counters.auth_failed.load(Ordering::Relaxed),
        }
    }

    /// Decide what to do with one delivery
    pub async fn handle(&self, envelope: NotificationEnvelope) -> HandleOutcome {
        let now = self.clock.now();

        let channel = match self.registry.lookup(&envelope.channel_id).await {
            Ok(channel) => channel,
            Err(_) => {
                self.counters.unknown_channel.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    channel_id = %envelope.channel_id,
                    resource_state = ?envelope.resource_state,
                    "Delivery for unknown channel"
                );
                if self.drift.record(now) {
                    tracing::warn!("Unknown-channel deliveries crossed drift threshold");
                    self.drift_signal.notify_one();
                }
                return HandleOutcome::Rejected(RejectReason::UnknownChannel);
            }
        };

        let presented = envelope.token.as_deref().unwrap_or_default();
        if !tokens_match(&channel.shared_token, presented) {
            self.counters.auth_failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                target: "a3s_watch::security",
                channel_id = %channel.id,
                topic = %channel.topic,
                token_present = envelope.token.is_some(),
                "Delivery token mismatch"
            );
            return HandleOutcome::Rejected(RejectReason::AuthFailed);
        }

        let nonce = envelope.nonce();
        if !self.dedup.first_sight(&channel.id, &nonce, now) {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(channel_id = %channel.id, nonce = %nonce, "Duplicate delivery skipped");
            return HandleOutcome::Duplicate;
        }

        let delivery = Delivery {
            channel_id: channel.id,
            topic: channel.topic,
            resource_state: envelope.resource_state,
            message_number: envelope.message_number,
            resource_id: envelope.resource_id,
            payload: envelope.payload,
            received_at: now,
        };
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        self.forward(delivery).await;
        HandleOutcome::Accepted
    }

    async fn forward(&self, delivery: Delivery) {
        let consumer = self.consumer.clone();
        let channel_id = delivery.channel_id.clone();

        let task = tokio::spawn(async move {
            let channel_id = delivery.channel_id.clone();
            if let Err(e) = consumer.consume(delivery).await {
                tracing::warn!(channel_id = %channel_id, error = %e, "Notification consumer failed");
            }
        });

        match tokio::time::timeout(self.handler_timeout, task).await {
            Ok(Ok(())) => {}
            Ok(Err(join_err)) => {
                tracing::error!(channel_id = %channel_id, error = %join_err, "Notification consumer panicked");
            }
            Err(_) => {
                tracing::warn!(
                    channel_id = %channel_id,
                    timeout_ms = self.handler_timeout.as_millis() as u64,
                    "Notification consumer still running, continuing in background"
                );
            }
        }
    }
}
