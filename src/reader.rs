//! Audit event reader
//!
//! Pull-mode access to the activity log, independent of the push path
//! but sharing its provider. Pages arrive most recent first; streams are
//! lazy and can be restarted from any page token they yielded.

use crate::error::{Result, WatchError};
use crate::provider::ReportsProvider;
use crate::retry::{with_retry, RetryPolicy};
use crate::types::{ActivityEvent, ActivityPage, EventFilter, ResourceKey};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use std::sync::Arc;

/// Largest page the provider serves
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Result of one backfill pass
#[derive(Debug, Clone, Default)]
pub struct Backfill {
    /// Events newer than the watermark, oldest first
    pub events: Vec<ActivityEvent>,
    /// Newest event time seen; the next watermark
    pub newest: Option<DateTime<Utc>>,
    pub pages: usize,
    /// Stopped at `max_pages` before reaching the watermark or the end
    pub truncated: bool,
}

/// Paginating reader over the provider's list call
pub struct ActivityReader {
    provider: Arc<dyn ReportsProvider>,
    retry: RetryPolicy,
    page_size: u32,
}

impl ActivityReader {
    pub fn new(provider: Arc<dyn ReportsProvider>, retry: RetryPolicy, page_size: u32) -> Self {
        Self {
            provider,
            retry,
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Fetch one page, retrying transient failures
    pub async fn list_events(
        &self,
        resource: &ResourceKey,
        filter: &EventFilter,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<ActivityPage> {
        let max_results = max_results.clamp(1, MAX_PAGE_SIZE);
        let provider = &self.provider;
        with_retry(&self.retry, "list_activities", |_| async move {
            provider
                .list_activities(resource, filter, page_token, max_results)
                .await
        })
        .await
    }

    /// Lazy stream of pages starting at `start` (the first page when `None`)
    ///
    /// Ends after the page without a next token, or at the first error.
    pub fn pages(
        &self,
        resource: ResourceKey,
        filter: EventFilter,
        start: Option<String>,
    ) -> impl Stream<Item = Result<ActivityPage>> + '_ {
        stream::try_unfold(Some(start), move |cursor| {
            let resource = resource.clone();
            let filter = filter.clone();
            async move {
                let token = match cursor {
                    Some(token) => token,
                    None => return Ok(None),
                };
                self.list_events(&resource, &filter, token.as_deref(), self.page_size)
                    .await
                    .map(|page| {
                        let next = page.next_page_token.clone().map(Some);
                        Some((page, next))
                    })
            }
        })
    }

    /// Lazy stream of events across all pages, most recent first
    pub fn events(
        &self,
        resource: ResourceKey,
        filter: EventFilter,
    ) -> impl Stream<Item = Result<ActivityEvent>> + '_ {
        self.pages(resource, filter, None)
            .map_ok(|page| stream::iter(page.items.into_iter().map(Ok::<_, WatchError>)))
            .try_flatten()
    }

    /// Read everything newer than `watermark`, up to `max_pages` pages
    pub async fn backfill(
        &self,
        resource: &ResourceKey,
        filter: &EventFilter,
        watermark: Option<DateTime<Utc>>,
        max_pages: usize,
    ) -> Result<Backfill> {
        let mut result = Backfill::default();
        let mut pages = Box::pin(self.pages(resource.clone(), filter.clone(), None));
        let mut reached_watermark = false;
        let mut more_pages = false;

        while result.pages < max_pages {
            let Some(page) = pages.next().await else {
                break;
            };
            let page = page?;
            result.pages += 1;
            more_pages = page.next_page_token.is_some();

            for event in page.items {
                if watermark.is_some_and(|w| event.time() <= w) {
                    reached_watermark = true;
                    break;
                }
                if result.newest.map_or(true, |n| event.time() > n) {
                    result.newest = Some(event.time());
                }
                result.events.push(event);
            }
            if reached_watermark || !more_pages {
                break;
            }
        }

        result.truncated = !reached_watermark && more_pages;
        result.events.reverse();

        tracing::debug!(
            resource = %resource,
            events = result.events.len(),
            pages = result.pages,
            truncated = result.truncated,
            "Backfill read"
        );
        Ok(result)
    }
}
