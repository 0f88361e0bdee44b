//! Watch service
//!
//! Wires the registry, lifecycle manager, dispatcher and reader together
//! and owns the background renewal loop:
//!
//! 1. `start` re-adopts persisted channels, watches every configured
//!    topic in its own task, then backfills each watched resource so
//!    events from before the channels went live are not lost.
//! 2. `spawn_background` runs a renewal scan on every tick and a
//!    reconcile whenever the dispatcher signals unknown-channel drift.
//! 3. `shutdown` stops the loop and, unless configured otherwise, stops
//!    every channel at the provider.

use crate::clock::{Clock, SystemClock};
use crate::config::{BackfillSettings, WatchConfig};
use crate::dispatch::{Dispatcher, LoggingConsumer, NotificationConsumer};
use crate::error::{Result, WatchError};
use crate::manager::{ChannelManager, ScanReport, StartupReport};
use crate::provider::ReportsProvider;
use crate::reader::ActivityReader;
use crate::registry::ChannelRegistry;
use crate::state::{FileStateStore, StateStore};
use crate::types::{EventFilter, ResourceKey, Topic};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Builder for [`WatchService`]
pub struct ServiceBuilder {
    config: WatchConfig,
    provider: Arc<dyn ReportsProvider>,
    clock: Arc<dyn Clock>,
    consumer: Arc<dyn NotificationConsumer>,
    store: Option<Arc<dyn StateStore>>,
}

impl ServiceBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn consumer(mut self, consumer: Arc<dyn NotificationConsumer>) -> Self {
        self.consumer = consumer;
        self
    }

    /// Override the store derived from `state_path`
    pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<WatchService> {
        self.config.validate()?;

        let store = self.store.or_else(|| {
            self.config
                .state_path
                .as_ref()
                .map(|p| Arc::new(FileStateStore::new(p)) as Arc<dyn StateStore>)
        });
        let registry = Arc::new(match store {
            Some(store) => ChannelRegistry::with_store(store),
            None => ChannelRegistry::new(),
        });

        let manager = Arc::new(ChannelManager::new(
            self.provider.clone(),
            registry.clone(),
            self.clock.clone(),
            self.config.manager_config()?,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            self.consumer,
            self.clock.clone(),
            self.config.dispatcher_config()?,
        ));
        let reader = Arc::new(ActivityReader::new(
            self.provider,
            self.config.retry_policy(),
            self.config.backfill.max_results,
        ));

        let (shutdown_tx, _) = watch::channel(false);

        Ok(WatchService {
            topics: self.config.topics(),
            resources: self.config.resources(),
            scan_interval: self.config.renewal.scan_interval,
            backfill: self.config.backfill.clone(),
            stop_on_shutdown: self.config.stop_on_shutdown,
            registry,
            manager,
            dispatcher,
            reader,
            clock: self.clock,
            shutdown_tx,
        })
    }
}

/// Backfill results across all watched resources
#[derive(Debug, Clone, Default)]
pub struct BackfillSummary {
    pub resources: usize,
    pub events: usize,
    pub failed: Vec<String>,
}

/// The running watch system
pub struct WatchService {
    topics: Vec<Topic>,
    resources: Vec<(ResourceKey, EventFilter)>,
    scan_interval: Duration,
    backfill: BackfillSettings,
    stop_on_shutdown: bool,
    registry: Arc<ChannelRegistry>,
    manager: Arc<ChannelManager>,
    dispatcher: Arc<Dispatcher>,
    reader: Arc<ActivityReader>,
    clock: Arc<dyn Clock>,
    shutdown_tx: watch::Sender<bool>,
}

impl WatchService {
    /// Start building a service with the system clock and a logging consumer
    pub fn builder(config: WatchConfig, provider: Arc<dyn ReportsProvider>) -> ServiceBuilder {
        ServiceBuilder {
            config,
            provider,
            clock: Arc::new(SystemClock),
            consumer: Arc::new(LoggingConsumer),
            store: None,
        }
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<ChannelManager> {
        &self.manager
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn reader(&self) -> &Arc<ActivityReader> {
        &self.reader
    }

    /// Restore and watch every configured topic, then backfill
    ///
    /// Per-topic failures are reported, not returned; the caller decides
    /// whether to keep running degraded. Rejected credentials are fatal.
    pub async fn start(&self) -> Result<StartupReport> {
        let persisted = match self.registry.load_persisted() {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(error = %e, "Ignoring unreadable persisted state");
                Default::default()
            }
        };
        self.registry.restore_watermarks(persisted.watermarks).await;

        let configured: BTreeSet<Topic> = self.topics.iter().cloned().collect();
        self.manager.restore(persisted.channels, &configured).await;

        let report = self.manager.ensure_topics(self.topics.clone()).await;
        if self.backfill.enabled {
            self.backfill_all().await;
        }
        for (topic, failure) in report.failed() {
            tracing::warn!(
                topic = %topic,
                kind = failure.kind,
                error = %failure.message,
                "Topic not watched"
            );
        }
        tracing::info!(
            watched = report.succeeded().count(),
            failed = report.failed().count(),
            "Startup complete"
        );

        if report.authentication_failed() {
            return Err(WatchError::AuthenticationUnavailable(
                "provider rejected credentials while creating channels".to_string(),
            ));
        }
        Ok(report)
    }

    /// Backfill every watched resource from its watermark
    pub async fn backfill_all(&self) -> BackfillSummary {
        let mut summary = BackfillSummary::default();

        for (resource, filter) in &self.resources {
            summary.resources += 1;
            match self.backfill_resource(resource, filter).await {
                Ok(count) => summary.events += count,
                Err(e) => {
                    tracing::warn!(resource = %resource, error = %e, "Backfill failed");
                    summary.failed.push(resource.to_string());
                }
            }
        }

        tracing::info!(
            resources = summary.resources,
            events = summary.events,
            failed = summary.failed.len(),
            "Backfill complete"
        );
        summary
    }

    async fn backfill_resource(&self, resource: &ResourceKey, filter: &EventFilter) -> Result<usize> {
        let watermark = self.registry.watermark(resource).await;
        let backfill = self
            .reader
            .backfill(resource, filter, watermark, self.backfill.max_pages)
            .await?;
        if backfill.truncated {
            tracing::warn!(
                resource = %resource,
                pages = backfill.pages,
                "Backfill stopped at page limit, older events skipped"
            );
        }

        let count = backfill.events.len();
        if count > 0 {
            self.dispatcher
                .consumer()
                .on_backfill(resource, backfill.events)
                .await?;
        }
        if let Some(newest) = backfill.newest {
            self.registry.set_watermark(resource, newest).await;
        }
        Ok(count)
    }

    /// One renewal scan at the current time
    pub async fn scan(&self) -> ScanReport {
        self.manager.renew_if_needed(self.clock.now()).await
    }

    /// Re-list and re-watch after unknown-channel drift
    pub async fn reconcile(&self) -> StartupReport {
        tracing::warn!("Reconciling channels after unknown-channel deliveries");
        let report = self.manager.ensure_topics(self.topics.clone()).await;
        if self.backfill.enabled {
            self.backfill_all().await;
        }
        report
    }

    /// Run the renewal and drift loop until `shutdown` is called
    pub fn spawn_background(self: &Arc<Self>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let drift = self.dispatcher.drift_signal();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.scan_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick fires immediately; startup just did the work
            ticker.tick().await;

            tracing::info!(
                interval_secs = service.scan_interval.as_secs(),
                "Renewal loop started"
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        service.scan().await;
                    }
                    _ = drift.notified() => {
                        service.reconcile().await;
                    }
                    _ = shutdown_rx.changed() => {
                        break;
                    }
                }
            }
            tracing::info!("Renewal loop stopped");
        })
    }

    /// Stop the background loop and tear down channels
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if self.stop_on_shutdown {
            self.manager.shutdown_all().await;
        } else {
            tracing::info!(
                channels = self.registry.len().await,
                "Leaving channels running for the next start"
            );
        }
    }
}
