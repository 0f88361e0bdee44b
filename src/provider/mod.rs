//! Reports provider trait, the injected client for the audit-log service
//!
//! All provider backends (the Google Admin SDK Reports API, the in-memory
//! fake) implement `ReportsProvider`. The lifecycle manager and the event
//! reader only ever see this trait; credentials and HTTP details stay
//! inside the implementation.

use crate::error::Result;
use crate::types::{ActivityPage, ChannelHandle, ChannelRequest, EventFilter, ResourceKey};
use async_trait::async_trait;

pub mod google;
pub mod memory;

/// Core trait for audit-log provider clients
#[async_trait]
pub trait ReportsProvider: Send + Sync {
    /// Register a push channel for the request's topic
    ///
    /// The returned handle carries the expiration the provider actually
    /// granted, which may be earlier than requested.
    async fn create_channel(&self, request: &ChannelRequest) -> Result<ChannelHandle>;

    /// Stop a previously created channel
    async fn stop_channel(&self, handle: &ChannelHandle) -> Result<()>;

    /// Fetch one page of activities, most recent first
    async fn list_activities(
        &self,
        resource: &ResourceKey,
        filter: &EventFilter,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<ActivityPage>;

    /// Provider name (e.g., "google", "memory")
    fn name(&self) -> &str;
}
