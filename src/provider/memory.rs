//! In-memory reports provider
//!
//! Single-process stand-in for the audit-log service, used by tests and
//! local development. Channels live in a map, activities are served from
//! per-resource lists, and failures can be injected per operation.

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, WatchError};
use crate::provider::ReportsProvider;
use crate::types::{
    ActivityEvent, ActivityPage, ChannelHandle, ChannelRequest, EventFilter, ResourceKey, Topic,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Memory provider configuration
#[derive(Debug, Clone, Default)]
pub struct MemoryConfig {
    /// Longest lease the provider grants; longer requests are capped
    pub max_lease: Option<chrono::Duration>,

    /// Artificial latency for create calls
    pub create_delay: Option<Duration>,
}

/// Failure injected into the next provider call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Transient failure (`ProviderUnavailable`)
    Unavailable,
    /// Credential failure (`AuthenticationUnavailable`)
    Unauthorized,
    /// Permanent rejection (`Provider`)
    Rejected,
}

impl InjectedFailure {
    fn into_error(self, operation: &str) -> WatchError {
        match self {
            InjectedFailure::Unavailable => {
                WatchError::ProviderUnavailable(format!("{}: injected 503", operation))
            }
            InjectedFailure::Unauthorized => {
                WatchError::AuthenticationUnavailable(format!("{}: injected 401", operation))
            }
            InjectedFailure::Rejected => {
                WatchError::Provider(format!("{}: injected 400", operation))
            }
        }
    }
}

/// A channel the provider currently pushes to
#[derive(Debug, Clone)]
pub struct ProviderChannel {
    pub topic: Topic,
    pub token: String,
    pub handle: ChannelHandle,
}

#[derive(Default)]
struct MemoryState {
    channels: HashMap<String, ProviderChannel>,
    stopped: Vec<String>,
    /// Most recent first, per resource
    activities: HashMap<ResourceKey, Vec<ActivityEvent>>,
    create_failures: VecDeque<InjectedFailure>,
    stop_failures: VecDeque<InjectedFailure>,
    list_failures: VecDeque<InjectedFailure>,
    create_calls: usize,
    stop_calls: usize,
    list_calls: usize,
    next_resource: u64,
}

/// In-memory reports provider
pub struct MemoryProvider {
    config: MemoryConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<MemoryState>,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

impl MemoryProvider {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Measure granted leases against `clock`
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next `count` create calls
    pub fn fail_creates(&self, count: usize, failure: InjectedFailure) {
        let mut state = self.state();
        state.create_failures.extend(std::iter::repeat(failure).take(count));
    }

    /// Fail the next `count` stop calls
    pub fn fail_stops(&self, count: usize, failure: InjectedFailure) {
        let mut state = self.state();
        state.stop_failures.extend(std::iter::repeat(failure).take(count));
    }

    /// Fail the next `count` list calls
    pub fn fail_lists(&self, count: usize, failure: InjectedFailure) {
        let mut state = self.state();
        state.list_failures.extend(std::iter::repeat(failure).take(count));
    }

    /// Record an activity; it becomes the most recent for its resource
    pub fn push_activity(&self, resource: ResourceKey, event: ActivityEvent) {
        let mut state = self.state();
        let list = state.activities.entry(resource).or_default();
        list.push(event);
        list.sort_by(|a, b| b.time().cmp(&a.time()));
    }

    /// Channels the provider would currently push to
    pub fn live_channels(&self) -> Vec<ProviderChannel> {
        self.state().channels.values().cloned().collect()
    }

    pub fn is_live(&self, channel_id: &str) -> bool {
        self.state().channels.contains_key(channel_id)
    }

    /// Ids of channels stopped so far, in order
    pub fn stopped(&self) -> Vec<String> {
        self.state().stopped.clone()
    }

    pub fn create_calls(&self) -> usize {
        self.state().create_calls
    }

    pub fn stop_calls(&self) -> usize {
        self.state().stop_calls
    }

    pub fn list_calls(&self) -> usize {
        self.state().list_calls
    }
}

#[async_trait]
impl ReportsProvider for MemoryProvider {
    async fn create_channel(&self, request: &ChannelRequest) -> Result<ChannelHandle> {
        if let Some(delay) = self.config.create_delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.create_calls += 1;
        if let Some(failure) = state.create_failures.pop_front() {
            return Err(failure.into_error("create"));
        }
        if state.channels.contains_key(&request.id) {
            return Err(WatchError::Provider(format!(
                "create: channel id '{}' not unique",
                request.id
            )));
        }

        let expires_at = match self.config.max_lease {
            Some(max) => {
                let cap = self.clock.now() + max;
                request.expires_at.min(cap)
            }
            None => request.expires_at,
        };

        state.next_resource += 1;
        let handle = ChannelHandle {
            channel_id: request.id.clone(),
            resource_id: Some(format!("res-{}", state.next_resource)),
            resource_uri: Some(format!(
                "memory://activity/{}?eventName={}",
                request.topic.resource, request.topic.filter
            )),
            expires_at,
        };

        state.channels.insert(
            request.id.clone(),
            ProviderChannel {
                topic: request.topic.clone(),
                token: request.token.clone(),
                handle: handle.clone(),
            },
        );

        tracing::debug!(channel_id = %request.id, topic = %request.topic, "Memory channel created");
        Ok(handle)
    }

    async fn stop_channel(&self, handle: &ChannelHandle) -> Result<()> {
        let mut state = self.state();
        state.stop_calls += 1;
        if let Some(failure) = state.stop_failures.pop_front() {
            return Err(failure.into_error("stop"));
        }
        if state.channels.remove(&handle.channel_id).is_some() {
            state.stopped.push(handle.channel_id.clone());
        }
        Ok(())
    }

    async fn list_activities(
        &self,
        resource: &ResourceKey,
        filter: &EventFilter,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<ActivityPage> {
        let mut state = self.state();
        state.list_calls += 1;
        if let Some(failure) = state.list_failures.pop_front() {
            return Err(failure.into_error("list"));
        }

        let offset = match page_token {
            Some(token) => token.parse::<usize>().map_err(|_| {
                WatchError::Provider(format!("list: invalid page token '{}'", token))
            })?,
            None => 0,
        };

        let matching: Vec<&ActivityEvent> = state
            .activities
            .get(resource)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| filter.is_all() || e.events.iter().any(|d| filter.contains(&d.name)))
                    .collect()
            })
            .unwrap_or_default();

        let page_size = max_results.max(1) as usize;
        let items: Vec<ActivityEvent> = matching
            .iter()
            .skip(offset)
            .take(page_size)
            .map(|e| (*e).clone())
            .collect();
        let next = offset + items.len();
        let next_page_token = (next < matching.len()).then(|| next.to_string());

        Ok(ActivityPage {
            items,
            next_page_token,
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActivityId, Actor, EventDetail};
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    fn request(topic: Topic) -> ChannelRequest {
        ChannelRequest {
            id: crate::token::new_channel_id(),
            topic,
            token: "tok".to_string(),
            expires_at: Utc::now() + ChronoDuration::hours(5),
        }
    }

    fn login() -> Topic {
        Topic::new(ResourceKey::new("all", "login"), EventFilter::of(["login_success"]))
    }

    fn activity(minute: u32, name: &str) -> ActivityEvent {
        ActivityEvent {
            id: ActivityId {
                time: Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap(),
                unique_qualifier: Some(format!("q{}", minute)),
                application_name: Some("login".to_string()),
                customer_id: None,
            },
            actor: Actor::default(),
            ip_address: None,
            events: vec![EventDetail {
                name: name.to_string(),
                kind: None,
                parameters: vec![],
            }],
        }
    }

    #[tokio::test]
    async fn test_create_and_stop() {
        let provider = MemoryProvider::default();
        let req = request(login());
        let handle = provider.create_channel(&req).await.unwrap();

        assert_eq!(handle.channel_id, req.id);
        assert!(handle.resource_id.is_some());
        assert!(provider.is_live(&req.id));

        provider.stop_channel(&handle).await.unwrap();
        assert!(!provider.is_live(&req.id));
        assert_eq!(provider.stopped(), vec![req.id.clone()]);
        assert_eq!(provider.stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_channel_id_rejected() {
        let provider = MemoryProvider::default();
        let req = request(login());
        provider.create_channel(&req).await.unwrap();
        let err = provider.create_channel(&req).await.unwrap_err();
        assert!(matches!(err, WatchError::Provider(_)));
    }

    #[tokio::test]
    async fn test_max_lease_caps_expiration() {
        let provider = MemoryProvider::new(MemoryConfig {
            max_lease: Some(ChronoDuration::hours(1)),
            ..Default::default()
        });
        let req = request(login());
        let handle = provider.create_channel(&req).await.unwrap();
        assert!(handle.expires_at < req.expires_at);
        assert!(handle.expires_at <= Utc::now() + ChronoDuration::hours(1));
    }

    #[tokio::test]
    async fn test_max_lease_follows_injected_clock() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let clock = Arc::new(crate::clock::ManualClock::new(start));
        let provider = MemoryProvider::new(MemoryConfig {
            max_lease: Some(ChronoDuration::hours(1)),
            ..Default::default()
        })
        .with_clock(clock.clone());

        let mut req = request(login());
        req.expires_at = start + ChronoDuration::hours(5);
        let handle = provider.create_channel(&req).await.unwrap();
        assert_eq!(handle.expires_at, start + ChronoDuration::hours(1));

        clock.advance(ChronoDuration::minutes(30));
        let mut req = request(login());
        req.expires_at = start + ChronoDuration::hours(5);
        let handle = provider.create_channel(&req).await.unwrap();
        assert_eq!(
            handle.expires_at,
            start + ChronoDuration::hours(1) + ChronoDuration::minutes(30)
        );
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let provider = MemoryProvider::default();
        provider.fail_creates(1, InjectedFailure::Unavailable);
        provider.fail_creates(1, InjectedFailure::Unauthorized);

        let req = request(login());
        assert!(matches!(
            provider.create_channel(&req).await,
            Err(WatchError::ProviderUnavailable(_))
        ));
        assert!(matches!(
            provider.create_channel(&req).await,
            Err(WatchError::AuthenticationUnavailable(_))
        ));
        assert!(provider.create_channel(&req).await.is_ok());
        assert_eq!(provider.create_calls(), 3);
    }

    #[tokio::test]
    async fn test_list_paginates_most_recent_first() {
        let provider = MemoryProvider::default();
        let key = ResourceKey::new("all", "login");
        for minute in 0..5 {
            provider.push_activity(key.clone(), activity(minute, "login_success"));
        }
        provider.push_activity(key.clone(), activity(30, "logout"));

        let filter = EventFilter::of(["login_success"]);
        let first = provider.list_activities(&key, &filter, None, 2).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.items[0].id.unique_qualifier.as_deref(), Some("q4"));
        assert_eq!(first.next_page_token.as_deref(), Some("2"));

        let last = provider.list_activities(&key, &filter, Some("4"), 2).await.unwrap();
        assert_eq!(last.items.len(), 1);
        assert!(last.next_page_token.is_none());

        let all = provider
            .list_activities(&key, &EventFilter::all(), None, 100)
            .await
            .unwrap();
        assert_eq!(all.items.len(), 6);
        assert_eq!(all.items[0].events[0].name, "logout");
    }

    #[tokio::test]
    async fn test_list_unknown_resource_is_empty() {
        let provider = MemoryProvider::default();
        let page = provider
            .list_activities(&ResourceKey::new("all", "drive"), &EventFilter::all(), None, 10)
            .await
            .unwrap();
        assert!(page.items.is_empty());
        assert!(page.next_page_token.is_none());
    }
}
