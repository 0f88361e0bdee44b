//! Google Admin SDK Reports provider
//!
//! Implements `ReportsProvider` against the Reports API: `activities.watch`
//! for push channels, `channels.stop` to retire them, and
//! `activities.list` for pull-mode backfill.

mod client;
mod config;

pub use client::{GoogleClient, StaticToken, TokenSource};
pub use config::GoogleConfig;

use crate::error::Result;
use crate::provider::ReportsProvider;
use crate::types::{ActivityPage, ChannelHandle, ChannelRequest, EventFilter, ResourceKey};
use async_trait::async_trait;
use std::sync::Arc;

/// Reports API provider
///
/// Wraps `GoogleClient` and implements the `ReportsProvider` trait.
pub struct GoogleProvider {
    client: GoogleClient,
}

impl GoogleProvider {
    /// Build the provider from config and a bearer token source
    pub fn new(config: GoogleConfig, tokens: Arc<dyn TokenSource>) -> Result<Self> {
        let client = GoogleClient::new(config, tokens)?;
        Ok(Self { client })
    }

    /// Get the underlying client for advanced usage
    pub fn client(&self) -> &GoogleClient {
        &self.client
    }
}

#[async_trait]
impl ReportsProvider for GoogleProvider {
    async fn create_channel(&self, request: &ChannelRequest) -> Result<ChannelHandle> {
        self.client.watch(request).await
    }

    async fn stop_channel(&self, handle: &ChannelHandle) -> Result<()> {
        self.client.stop(handle).await
    }

    async fn list_activities(
        &self,
        resource: &ResourceKey,
        filter: &EventFilter,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<ActivityPage> {
        self.client
            .list(resource, filter, page_token, max_results)
            .await
    }

    fn name(&self) -> &str {
        "google"
    }
}
