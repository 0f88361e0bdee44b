//! HTTP surface
//!
//! | Route                  | Method | Description                          |
//! |------------------------|--------|--------------------------------------|
//! | `<webhook_path>`       | POST   | Provider push deliveries             |
//! | `/health`              | GET    | Channel health, `503` when failing   |
//!
//! Delivery responses: `200` for accepted, duplicate and unknown-channel
//! deliveries (identical bodies), `400` for malformed envelopes, `403`
//! for token mismatches, `429` once a source address has too many token
//! mismatches in the configured window.

use crate::config::ServerSettings;
use crate::dispatch::{DispatchStats, Dispatcher};
use crate::error::WatchError;
use crate::manager::{ChannelManager, HealthReport, HealthStatus};
use crate::service::WatchService;
use crate::types::NotificationEnvelope;
use axum::{
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

/// `Server` header value on every response
pub const SERVER_HEADER: &str = concat!("a3s-watch/", env!("CARGO_PKG_VERSION"));

/// Tracked sources before idle entries are swept
const LIMITER_SWEEP_AT: usize = 10_000;

/// Per-source throttle for token mismatches
pub struct AuthFailureLimiter {
    limit: u32,
    window: Duration,
    failures: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl AuthFailureLimiter {
    /// `limit = 0` disables throttling
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn prune(queue: &mut VecDeque<Instant>, window: Duration, now: Instant) {
        while queue.front().is_some_and(|t| now.duration_since(*t) >= window) {
            queue.pop_front();
        }
    }

    pub fn is_blocked(&self, source: IpAddr, now: Instant) -> bool {
        if self.limit == 0 {
            return false;
        }
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        match failures.get_mut(&source) {
            Some(queue) => {
                Self::prune(queue, self.window, now);
                queue.len() >= self.limit as usize
            }
            None => false,
        }
    }

    pub fn record_failure(&self, source: IpAddr, now: Instant) {
        if self.limit == 0 {
            return;
        }
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        if failures.len() >= LIMITER_SWEEP_AT {
            let window = self.window;
            failures.retain(|_, queue| {
                Self::prune(queue, window, now);
                !queue.is_empty()
            });
        }
        let queue = failures.entry(source).or_default();
        Self::prune(queue, self.window, now);
        queue.push_back(now);
    }
}

/// Shared state of the HTTP handlers
#[derive(Clone)]
pub struct ServerState {
    pub dispatcher: Arc<Dispatcher>,
    pub manager: Arc<ChannelManager>,
    pub limiter: Arc<AuthFailureLimiter>,
}

impl ServerState {
    pub fn new(service: &WatchService, settings: &ServerSettings) -> Self {
        Self {
            dispatcher: service.dispatcher().clone(),
            manager: service.manager().clone(),
            limiter: Arc::new(AuthFailureLimiter::new(
                settings.auth_failure_limit,
                settings.auth_failure_window,
            )),
        }
    }
}

/// Build the router serving the webhook and health routes
pub fn build_router(state: ServerState, webhook_path: &str) -> Router {
    Router::new()
        .route(webhook_path, post(receive_notification))
        .route("/health", get(health))
        .with_state(state)
        .layer(SetResponseHeaderLayer::overriding(
            header::SERVER,
            HeaderValue::from_static(SERVER_HEADER),
        ))
        .layer(TraceLayer::new_for_http())
}

fn error_response(status: StatusCode, err: &WatchError) -> Response {
    (
        status,
        Json(serde_json::json!({"error": {"code": err.kind(), "message": err.to_string()}})),
    )
        .into_response()
}

/// Body of every handled delivery, so callers cannot tell the cases apart
fn ok_response() -> Response {
    (StatusCode::OK, "OK").into_response()
}

async fn receive_notification(
    State(state): State<ServerState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let source = connect.map(|ConnectInfo(addr)| addr.ip());
    let now = Instant::now();

    if let Some(ip) = source {
        if state.limiter.is_blocked(ip, now) {
            tracing::warn!(target: "a3s_watch::security", source = %ip, "Delivery source throttled");
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(serde_json::json!({"error": {
                    "code": "too_many_requests",
                    "message": "Too many failed deliveries"
                }})),
            )
                .into_response();
        }
    }

    let pairs = headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)));
    let envelope = match NotificationEnvelope::from_headers(pairs, body) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::debug!(error = %e, "Malformed delivery");
            return error_response(StatusCode::BAD_REQUEST, &e);
        }
    };

    let channel_id = envelope.channel_id.clone();
    match state.dispatcher.handle(envelope).await.into_result(&channel_id) {
        Ok(()) | Err(WatchError::UnknownChannel(_)) => ok_response(),
        Err(e) => {
            if let Some(ip) = source {
                state.limiter.record_failure(ip, now);
            }
            error_response(StatusCode::FORBIDDEN, &e)
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthBody {
    #[serde(flatten)]
    report: HealthReport,
    deliveries: DispatchStats,
    version: &'static str,
}

async fn health(State(state): State<ServerState>) -> impl IntoResponse {
    let report = state.manager.health().await;
    let status = if report.status == HealthStatus::Failing {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        status,
        Json(HealthBody {
            report,
            deliveries: state.dispatcher.stats(),
            version: env!("CARGO_PKG_VERSION"),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::WatchConfig;
    use crate::provider::memory::{InjectedFailure, MemoryProvider};
    use crate::types::WatchChannel;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    const CONFIG: &str = r#"
provider {
  webhook_address = "https://watch.example.com/google/workspace/notification"
}
server {
  auth_failure_limit = 2
}
renewal {
  max_attempts = 1
}
backfill {
  enabled = false
}
topic "login" {
  application = "login"
  events      = ["login_success"]
}
"#;

    async fn started(provider: Arc<MemoryProvider>) -> (Router, Arc<WatchService>, Option<WatchChannel>) {
        let config = WatchConfig::from_hcl(CONFIG).unwrap();
        let service = Arc::new(
            WatchService::builder(config.clone(), provider)
                .clock(Arc::new(ManualClock::default()))
                .build()
                .unwrap(),
        );
        let _ = service.start().await;
        let channel = service.registry().snapshot().await.into_iter().next();
        let router = build_router(
            ServerState::new(&service, &config.server),
            &config.server.webhook_path,
        );
        (router, service, channel)
    }

    fn delivery(channel_id: &str, token: &str, from: Option<SocketAddr>) -> Request<Body> {
        let mut req = Request::builder()
            .method("POST")
            .uri("/google/workspace/notification")
            .header("X-Goog-Channel-ID", channel_id)
            .header("X-Goog-Channel-Token", token)
            .header("X-Goog-Resource-State", "login_success")
            .header("X-Goog-Message-Number", "1")
            .body(Body::from(r#"{"kind":"admin#reports#activity"}"#))
            .unwrap();
        if let Some(addr) = from {
            req.extensions_mut().insert(ConnectInfo(addr));
        }
        req
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_valid_delivery_returns_ok_with_server_header() {
        let (router, _service, channel) = started(Arc::new(MemoryProvider::default())).await;
        let channel = channel.unwrap();

        let response = router
            .oneshot(delivery(&channel.id, &channel.shared_token, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::SERVER).unwrap(),
            SERVER_HEADER
        );
        assert_eq!(body_text(response).await, "OK");
    }

    #[tokio::test]
    async fn test_unknown_channel_is_indistinguishable_from_accepted() {
        let (router, _service, channel) = started(Arc::new(MemoryProvider::default())).await;
        let channel = channel.unwrap();

        let known = router
            .clone()
            .oneshot(delivery(&channel.id, &channel.shared_token, None))
            .await
            .unwrap();
        let unknown = router
            .oneshot(delivery("wch-stale", &channel.shared_token, None))
            .await
            .unwrap();

        assert_eq!(known.status(), unknown.status());
        assert_eq!(body_text(known).await, body_text(unknown).await);
    }

    #[tokio::test]
    async fn test_bad_token_is_forbidden() {
        let (router, service, channel) = started(Arc::new(MemoryProvider::default())).await;
        let channel = channel.unwrap();

        let response = router
            .oneshot(delivery(&channel.id, "guess", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_text(response).await;
        assert!(!body.contains(&channel.shared_token));
        assert_eq!(service.dispatcher().stats().auth_failed, 1);
    }

    #[tokio::test]
    async fn test_malformed_envelope_is_bad_request() {
        let (router, _service, _) = started(Arc::new(MemoryProvider::default())).await;
        let req = Request::builder()
            .method("POST")
            .uri("/google/workspace/notification")
            .header("X-Goog-Resource-State", "exists")
            .body(Body::empty())
            .unwrap();

        let response = router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(response).await.contains("malformed_envelope"));
    }

    #[tokio::test]
    async fn test_repeated_auth_failures_are_throttled() {
        let (router, _service, channel) = started(Arc::new(MemoryProvider::default())).await;
        let channel = channel.unwrap();
        let attacker: SocketAddr = "203.0.113.7:40000".parse().unwrap();
        let other: SocketAddr = "198.51.100.1:40000".parse().unwrap();

        for _ in 0..2 {
            let response = router
                .clone()
                .oneshot(delivery(&channel.id, "guess", Some(attacker)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
        }

        // Even a valid token is refused while the source is throttled
        let response = router
            .clone()
            .oneshot(delivery(&channel.id, &channel.shared_token, Some(attacker)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = router
            .oneshot(delivery(&channel.id, &channel.shared_token, Some(other)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_reports_failing_as_503() {
        let provider = Arc::new(MemoryProvider::default());
        provider.fail_creates(1, InjectedFailure::Rejected);
        let (router, _service, _) = started(provider).await;

        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value =
            serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["status"], "failing");
        assert_eq!(body["alerts"][0]["kind"], "provider");
    }

    #[tokio::test]
    async fn test_health_ok_when_watching() {
        let (router, _service, _) = started(Arc::new(MemoryProvider::default())).await;
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value =
            serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["channels"].as_array().unwrap().len(), 1);
        assert!(body["channels"][0].get("sharedToken").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_limiter_window_expires() {
        let limiter = AuthFailureLimiter::new(1, Duration::from_secs(60));
        let ip: IpAddr = "203.0.113.7".parse().unwrap();

        limiter.record_failure(ip, Instant::now());
        assert!(limiter.is_blocked(ip, Instant::now()));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!limiter.is_blocked(ip, Instant::now()));
    }
}
