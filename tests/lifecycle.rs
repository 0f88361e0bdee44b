//! Channel lifecycle integration tests
//!
//! Drives the registry, manager and dispatcher together against the
//! in-memory provider and a manual clock: idempotent watches, delivery
//! authentication, dedup, renewal, and restart recovery.

use a3s_watch::dispatch::DispatcherConfig;
use a3s_watch::manager::ManagerConfig;
use a3s_watch::provider::memory::{InjectedFailure, MemoryProvider};
use a3s_watch::{
    ChannelManager, ChannelRegistry, ChannelState, Clock, Delivery, Dispatcher, EventFilter,
    FileStateStore, HandleOutcome, ManualClock, NotificationConsumer, NotificationEnvelope,
    RejectReason, ResourceKey, RetryPolicy, Topic, WatchChannel, WatchError,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Duration;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Recorder {
    deliveries: Mutex<Vec<Delivery>>,
}

impl Recorder {
    fn count(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }
}

#[async_trait]
impl NotificationConsumer for Recorder {
    async fn consume(&self, delivery: Delivery) -> a3s_watch::Result<()> {
        self.deliveries.lock().unwrap().push(delivery);
        Ok(())
    }
}

struct Harness {
    provider: Arc<MemoryProvider>,
    clock: Arc<ManualClock>,
    registry: Arc<ChannelRegistry>,
    manager: Arc<ChannelManager>,
    dispatcher: Dispatcher,
    consumer: Arc<Recorder>,
}

fn harness_with(registry: ChannelRegistry, provider: Arc<MemoryProvider>) -> Harness {
    let clock = Arc::new(ManualClock::default());
    let registry = Arc::new(registry);
    let consumer = Arc::new(Recorder::default());
    let manager = Arc::new(ChannelManager::new(
        provider.clone(),
        registry.clone(),
        clock.clone(),
        ManagerConfig {
            retry: RetryPolicy::none(),
            ..Default::default()
        },
    ));
    let dispatcher = Dispatcher::new(
        registry.clone(),
        consumer.clone(),
        clock.clone(),
        DispatcherConfig::default(),
    );
    Harness {
        provider,
        clock,
        registry,
        manager,
        dispatcher,
        consumer,
    }
}

fn harness() -> Harness {
    harness_with(ChannelRegistry::new(), Arc::new(MemoryProvider::default()))
}

fn login() -> (ResourceKey, EventFilter) {
    (
        ResourceKey::new("all", "login"),
        EventFilter::of(["login_success"]),
    )
}

fn envelope(channel_id: &str, token: &str, message_number: &str, body: &'static str) -> NotificationEnvelope {
    NotificationEnvelope::from_headers(
        [
            ("X-Goog-Channel-ID", channel_id),
            ("X-Goog-Channel-Token", token),
            ("X-Goog-Resource-State", "login_success"),
            ("X-Goog-Message-Number", message_number),
        ],
        Bytes::from_static(body.as_bytes()),
    )
    .unwrap()
}

// ─── Idempotence & Conflicts ─────────────────────────────────────

#[tokio::test]
async fn test_ensure_watch_twice_returns_same_channel() {
    let h = harness();
    let (key, filter) = login();

    let first = h.manager.ensure_watch(key.clone(), filter.clone()).await.unwrap();
    let second = h.manager.ensure_watch(key, filter).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(h.provider.create_calls(), 1);
    assert_eq!(h.provider.live_channels().len(), 1);
}

#[tokio::test]
async fn test_register_same_topic_while_active_conflicts() {
    let h = harness();
    let (key, filter) = login();
    let active = h.manager.ensure_watch(key.clone(), filter.clone()).await.unwrap();

    let now = h.clock.now();
    let duplicate = WatchChannel::pending(Topic::new(key, filter), now + Duration::hours(5), now);
    let err = h.registry.register(duplicate).await.unwrap_err();

    match err {
        WatchError::Conflict { existing, .. } => assert_eq!(existing, active.id),
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(h.registry.len().await, 1);
}

#[tokio::test]
async fn test_topics_are_watched_independently() {
    let h = harness();
    h.provider.fail_creates(1, InjectedFailure::Rejected);

    let topics = vec![
        Topic::new(ResourceKey::new("all", "login"), EventFilter::of(["login_success"])),
        Topic::new(ResourceKey::new("all", "admin"), EventFilter::all()),
        Topic::new(ResourceKey::new("all", "drive"), EventFilter::all()),
    ];
    let report = h.manager.ensure_topics(topics).await;

    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(report.succeeded().count(), 2);
    assert_eq!(report.failed().count(), 1);
    assert!(!report.authentication_failed());
    assert_eq!(h.provider.live_channels().len(), 2);
}

// ─── Delivery Validation ─────────────────────────────────────────

#[tokio::test]
async fn test_token_mismatch_is_always_auth_failed() {
    let h = harness();
    let (key, filter) = login();
    let channel = h.manager.ensure_watch(key, filter).await.unwrap();

    let bodies = ["", "{}", r#"{"kind":"admin#reports#activity","id":{"time":"2024-05-01T10:00:00Z"}}"#];
    for (n, body) in bodies.into_iter().enumerate() {
        let outcome = h
            .dispatcher
            .handle(envelope(&channel.id, "not-the-token", &n.to_string(), body))
            .await;
        assert_eq!(outcome, HandleOutcome::Rejected(RejectReason::AuthFailed));
    }
    assert_eq!(h.consumer.count(), 0);
}

#[tokio::test]
async fn test_unknown_channel_never_reaches_consumer() {
    let h = harness();
    let (key, filter) = login();
    let channel = h.manager.ensure_watch(key, filter).await.unwrap();

    let outcome = h
        .dispatcher
        .handle(envelope("wch-never-registered", &channel.shared_token, "1", "{}"))
        .await;

    assert_eq!(outcome, HandleOutcome::Rejected(RejectReason::UnknownChannel));
    assert_eq!(h.consumer.count(), 0);
    assert_eq!(h.dispatcher.stats().unknown_channel, 1);
}

#[tokio::test]
async fn test_duplicate_nonce_consumed_once_within_window() {
    let h = harness();
    let (key, filter) = login();
    let channel = h.manager.ensure_watch(key, filter).await.unwrap();
    let token = channel.shared_token.as_str();

    let first = h.dispatcher.handle(envelope(&channel.id, token, "42", "{}")).await;
    let second = h.dispatcher.handle(envelope(&channel.id, token, "42", "{}")).await;
    assert_eq!(first, HandleOutcome::Accepted);
    assert_eq!(second, HandleOutcome::Duplicate);
    assert_eq!(h.consumer.count(), 1);

    // Past the ten minute window the nonce is new again
    h.clock.advance(Duration::minutes(11));
    let third = h.dispatcher.handle(envelope(&channel.id, token, "42", "{}")).await;
    assert_eq!(third, HandleOutcome::Accepted);
    assert_eq!(h.consumer.count(), 2);
}

// ─── Renewal ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_channel_inside_window_is_replaced() {
    let h = harness();
    let (key, filter) = login();
    let old = h.manager.ensure_watch(key, filter).await.unwrap();

    // Ten minutes left on a five hour lease
    h.clock.advance(Duration::hours(4) + Duration::minutes(50));
    let report = h.manager.renew_if_needed(h.clock.now()).await;

    assert_eq!(report.renewed.len(), 1);
    let renewal = &report.renewed[0];
    assert_eq!(renewal.old_id, old.id);
    assert!(!h.registry.contains(&old.id).await);
    assert!(h.registry.contains(&renewal.new_id).await);
    assert!(!h.provider.is_live(&old.id));
    assert!(h.provider.stopped().contains(&old.id));

    let outcome = h
        .dispatcher
        .handle(envelope(&old.id, &old.shared_token, "7", "{}"))
        .await;
    assert_eq!(outcome, HandleOutcome::Rejected(RejectReason::UnknownChannel));
}

#[tokio::test]
async fn test_login_watch_renewal_scenario() {
    let h = harness();
    let (key, filter) = login();
    let start = h.clock.now();

    let old = h.manager.ensure_watch(key.clone(), filter.clone()).await.unwrap();
    assert_eq!(old.expires_at, start + Duration::hours(5));
    assert_eq!(old.topic.resource.to_string(), "all/login");

    // Scan at +4h40m falls inside the 30 minute window
    h.clock.set(start + Duration::hours(4) + Duration::minutes(40));
    let report = h.manager.renew_if_needed(h.clock.now()).await;
    assert_eq!(report.renewed.len(), 1);
    let new_id = report.renewed[0].new_id.clone();

    // A delivery at +4h50m on the old id, with the old valid token, is dead
    h.clock.set(start + Duration::hours(4) + Duration::minutes(50));
    let outcome = h
        .dispatcher
        .handle(envelope(&old.id, &old.shared_token, "100", "{}"))
        .await;
    assert_eq!(outcome, HandleOutcome::Rejected(RejectReason::UnknownChannel));
    assert_eq!(h.consumer.count(), 0);

    let current = h.manager.ensure_watch(key, filter).await.unwrap();
    assert_eq!(current.id, new_id);
    assert_eq!(current.state, ChannelState::Active);
    let outcome = h
        .dispatcher
        .handle(envelope(&current.id, &current.shared_token, "101", "{}"))
        .await;
    assert_eq!(outcome, HandleOutcome::Accepted);
    assert_eq!(h.consumer.count(), 1);
}

#[tokio::test]
async fn test_lapsed_channel_is_recreated_in_same_scan() {
    let h = harness();
    let (key, filter) = login();
    let old = h.manager.ensure_watch(key, filter).await.unwrap();

    h.clock.advance(Duration::hours(6));
    let report = h.manager.renew_if_needed(h.clock.now()).await;

    assert_eq!(report.expired, vec![old.id.clone()]);
    assert_eq!(report.recreated.len(), 1);
    assert!(!h.registry.contains(&old.id).await);
    let fresh = h.registry.lookup(&report.recreated[0]).await.unwrap();
    assert_eq!(fresh.state, ChannelState::Active);
}

#[tokio::test]
async fn test_failed_renewal_recovers_on_next_scan() {
    let h = harness();
    let (key, filter) = login();
    let old = h.manager.ensure_watch(key, filter).await.unwrap();

    h.clock.advance(Duration::hours(4) + Duration::minutes(45));
    h.provider.fail_creates(1, InjectedFailure::Rejected);
    let report = h.manager.renew_if_needed(h.clock.now()).await;
    assert_eq!(report.failed, vec![old.id.clone()]);
    assert_eq!(
        h.registry.lookup(&old.id).await.unwrap().state,
        ChannelState::Failed
    );
    assert_eq!(h.manager.health().await.status, a3s_watch::HealthStatus::Failing);

    h.clock.advance(Duration::minutes(1));
    let report = h.manager.renew_if_needed(h.clock.now()).await;
    assert_eq!(report.collected, vec![old.id.clone()]);
    assert_eq!(report.recreated.len(), 1);
    assert!(!h.provider.is_live(&old.id));
    assert_eq!(h.manager.health().await.status, a3s_watch::HealthStatus::Healthy);
}

// ─── Restart ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_restart_adopts_persisted_channel() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("channels.json");
    let provider = Arc::new(MemoryProvider::default());
    let (key, filter) = login();

    let first = harness_with(
        ChannelRegistry::with_store(Arc::new(FileStateStore::new(&path))),
        provider.clone(),
    );
    let original = first.manager.ensure_watch(key.clone(), filter.clone()).await.unwrap();
    drop(first);

    let second = harness_with(
        ChannelRegistry::with_store(Arc::new(FileStateStore::new(&path))),
        provider.clone(),
    );
    let persisted = second.registry.load_persisted().unwrap();
    let configured: BTreeSet<Topic> = [Topic::new(key.clone(), filter.clone())].into();
    let restored = second.manager.restore(persisted.channels, &configured).await;
    assert_eq!(restored.adopted, vec![original.id.clone()]);

    let again = second.manager.ensure_watch(key, filter).await.unwrap();
    assert_eq!(again.id, original.id);
    assert_eq!(provider.create_calls(), 1);

    // The adopted channel still authenticates with its persisted token
    let outcome = second
        .dispatcher
        .handle(envelope(&again.id, &original.shared_token, "1", "{}"))
        .await;
    assert_eq!(outcome, HandleOutcome::Accepted);
}

#[tokio::test]
async fn test_restart_stops_channels_for_removed_topics() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("channels.json");
    let provider = Arc::new(MemoryProvider::default());
    let (key, filter) = login();

    let first = harness_with(
        ChannelRegistry::with_store(Arc::new(FileStateStore::new(&path))),
        provider.clone(),
    );
    let original = first.manager.ensure_watch(key, filter).await.unwrap();

    let second = harness_with(
        ChannelRegistry::with_store(Arc::new(FileStateStore::new(&path))),
        provider.clone(),
    );
    let persisted = second.registry.load_persisted().unwrap();
    let restored = second.manager.restore(persisted.channels, &BTreeSet::new()).await;

    assert_eq!(restored.stopped, vec![original.id.clone()]);
    assert!(!provider.is_live(&original.id));
    assert!(second.registry.is_empty().await);
}
