//! # a3s-watch
//!
//! Push-notification channel lifecycle for audit-log watch subscriptions.
//!
//! ## Overview
//!
//! The audit-log service pushes activity notifications to an HTTPS
//! endpoint, but only through short-lived "watch channels" that the
//! subscriber has to create, renew before expiry, and stop when done.
//! `a3s-watch` keeps one live channel per configured topic, authenticates
//! every delivery against the channel's shared token, and hands accepted
//! deliveries to a pluggable consumer. A pull-mode reader backfills
//! whatever was missed while no channel was live.
//!
//! ## Quick Start
//!
//! ```rust
//! use a3s_watch::provider::memory::MemoryProvider;
//! use a3s_watch::{WatchConfig, WatchService};
//! use std::sync::Arc;
//!
//! # async fn example() -> a3s_watch::Result<()> {
//! let config = WatchConfig::from_hcl(r#"
//! provider {
//!   webhook_address = "https://watch.example.com/google/workspace/notification"
//! }
//! topic "login" {
//!   application = "login"
//!   events      = ["login_success"]
//! }
//! "#)?;
//!
//! let service = Arc::new(
//!     WatchService::builder(config, Arc::new(MemoryProvider::default())).build()?,
//! );
//! let report = service.start().await?;
//! assert!(report.is_complete());
//!
//! let background = service.spawn_background();
//! service.shutdown().await;
//! background.await.ok();
//! # Ok(())
//! # }
//! ```
//!
//! ## Providers
//!
//! - **google**: Admin SDK Reports API (`watch`, `channels/stop`, `list`)
//! - **memory**: in-process fake with failure injection, for tests
//!
//! ## Architecture
//!
//! - **ReportsProvider** trait: create, stop and list against the service
//! - **ChannelRegistry**: channels by id and by topic, persisted on change
//! - **ChannelManager**: create, renew, stop, restore and health
//! - **Dispatcher**: token check, dedup, and consumer hand-off
//! - **ActivityReader**: lazy paginated reads and watermark backfill
//! - **WatchService**: wires the above and runs the renewal loop

pub mod clock;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod manager;
pub mod provider;
pub mod reader;
pub mod registry;
pub mod retry;
pub mod server;
pub mod service;
pub mod state;
pub mod token;
pub mod types;

// Re-export core types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::WatchConfig;
pub use dispatch::{
    Delivery, DispatchStats, Dispatcher, HandleOutcome, LoggingConsumer, NotificationConsumer,
    RejectReason,
};
pub use error::{Result, WatchError};
pub use manager::{ChannelManager, HealthReport, HealthStatus, ScanReport, StartupReport};
pub use provider::ReportsProvider;
pub use reader::{ActivityReader, Backfill};
pub use registry::ChannelRegistry;
pub use retry::RetryPolicy;
pub use service::WatchService;
pub use state::{FileStateStore, MemoryStateStore, PersistedState, StateStore};
pub use types::{
    ActivityEvent, ActivityPage, ChannelHandle, ChannelState, EventFilter, NotificationEnvelope,
    ResourceKey, ResourceState, Topic, WatchChannel,
};
