//! Google Reports API client: watch, stop and list calls

use super::config::GoogleConfig;
use crate::error::{Result, WatchError};
use crate::types::{ActivityPage, ChannelHandle, ChannelRequest, EventFilter, ResourceKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Source of OAuth bearer tokens for the Reports API
///
/// Credential acquisition and rotation live outside this crate; the
/// client only asks for a currently valid token before each call.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

/// A fixed, externally issued access token
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> Result<String> {
        if self.0.trim().is_empty() {
            return Err(WatchError::AuthenticationUnavailable(
                "access token is empty".to_string(),
            ));
        }
        Ok(self.0.clone())
    }
}

/// Body of a `watch` call
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WatchBody<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    address: &'a str,
    token: &'a str,
    /// Epoch milliseconds, encoded as a string (int64 in the API)
    expiration: String,
    payload: bool,
}

/// Body of a `channels/stop` call
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StopBody<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource_id: Option<&'a str>,
}

/// Channel resource returned by `watch`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelResponse {
    id: String,
    #[serde(default)]
    resource_id: Option<String>,
    #[serde(default)]
    resource_uri: Option<String>,
    #[serde(default)]
    expiration: Option<String>,
}

/// Low-level Reports API client
pub struct GoogleClient {
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    config: Arc<GoogleConfig>,
}

impl GoogleClient {
    /// Build the HTTP client
    pub fn new(config: GoogleConfig, tokens: Arc<dyn TokenSource>) -> Result<Self> {
        Url::parse(&config.base_url).map_err(|e| {
            WatchError::Config(format!("invalid provider base_url '{}': {}", config.base_url, e))
        })?;

        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| {
                WatchError::AuthenticationUnavailable(format!("failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            http,
            tokens,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &GoogleConfig {
        &self.config
    }

    /// `POST .../activity/users/{userKey}/applications/{app}/watch`
    pub async fn watch(&self, request: &ChannelRequest) -> Result<ChannelHandle> {
        if self.config.webhook_address.trim().is_empty() {
            return Err(WatchError::Config(
                "provider webhook_address must be set to create channels".to_string(),
            ));
        }
        let mut url = activity_url(&self.config.base_url, &request.topic.resource)?;
        url.path_segments_mut()
            .map_err(|_| WatchError::Config("provider base_url cannot be a base".to_string()))?
            .push("watch");
        if let Some(names) = request.topic.filter.to_query() {
            url.query_pairs_mut().append_pair("eventName", &names);
        }

        let body = WatchBody {
            id: &request.id,
            kind: "web_hook",
            address: &self.config.webhook_address,
            token: &request.token,
            expiration: request.expires_at.timestamp_millis().to_string(),
            payload: true,
        };

        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("watch", e))?;
        let response = check_status("watch", response).await?;

        let channel: ChannelResponse = response
            .json()
            .await
            .map_err(|e| WatchError::Provider(format!("failed to parse watch response: {}", e)))?;

        let expires_at = channel
            .expiration
            .as_deref()
            .and_then(parse_expiration)
            .unwrap_or(request.expires_at);

        tracing::debug!(
            channel_id = %channel.id,
            topic = %request.topic,
            expires_at = %expires_at,
            "Reports watch channel created"
        );

        Ok(ChannelHandle {
            channel_id: channel.id,
            resource_id: channel.resource_id,
            resource_uri: channel.resource_uri,
            expires_at,
        })
    }

    /// `POST .../reports/v1/channels/stop`
    pub async fn stop(&self, handle: &ChannelHandle) -> Result<()> {
        let mut url = base_url(&self.config.base_url)?;
        url.path_segments_mut()
            .map_err(|_| WatchError::Config("provider base_url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(["admin", "reports", "v1", "channels", "stop"]);

        let body = StopBody {
            id: &handle.channel_id,
            resource_id: handle.resource_id.as_deref(),
        };

        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("stop", e))?;

        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!(channel_id = %handle.channel_id, "Channel already gone at provider");
            return Ok(());
        }
        check_status("stop", response).await?;
        Ok(())
    }

    /// `GET .../activity/users/{userKey}/applications/{app}`
    pub async fn list(
        &self,
        resource: &ResourceKey,
        filter: &EventFilter,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<ActivityPage> {
        let mut url = activity_url(&self.config.base_url, resource)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("maxResults", &max_results.to_string());
            if let Some(token) = page_token {
                query.append_pair("pageToken", token);
            }
            if let Some(names) = filter.to_query() {
                query.append_pair("eventName", &names);
            }
        }

        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| transport_error("list", e))?;
        let response = check_status("list", response).await?;

        response
            .json()
            .await
            .map_err(|e| WatchError::Provider(format!("failed to parse activity page: {}", e)))
    }
}

fn base_url(base: &str) -> Result<Url> {
    Url::parse(base)
        .map_err(|e| WatchError::Config(format!("invalid provider base_url '{}': {}", base, e)))
}

/// `{base}/admin/reports/v1/activity/users/{userKey}/applications/{app}`
fn activity_url(base: &str, resource: &ResourceKey) -> Result<Url> {
    let mut url = base_url(base)?;
    url.path_segments_mut()
        .map_err(|_| WatchError::Config("provider base_url cannot be a base".to_string()))?
        .pop_if_empty()
        .extend([
            "admin",
            "reports",
            "v1",
            "activity",
            "users",
            resource.user_key.as_str(),
            "applications",
            resource.application.as_str(),
        ]);
    Ok(url)
}

fn parse_expiration(value: &str) -> Option<DateTime<Utc>> {
    value
        .trim()
        .parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
}

fn transport_error(operation: &str, e: reqwest::Error) -> WatchError {
    if e.is_timeout() {
        WatchError::Timeout(format!("{}: {}", operation, e))
    } else {
        WatchError::ProviderUnavailable(format!("{}: {}", operation, e))
    }
}

/// Map an HTTP status to the error kind the lifecycle manager acts on
fn classify_status(operation: &str, status: StatusCode, body: &str) -> WatchError {
    let detail = format!("{} returned {}: {}", operation, status, body.trim());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            WatchError::AuthenticationUnavailable(detail)
        }
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            WatchError::ProviderUnavailable(detail)
        }
        s if s.is_server_error() => WatchError::ProviderUnavailable(detail),
        _ => WatchError::Provider(detail),
    }
}

async fn check_status(operation: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(operation, status, &body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_url_encodes_segments() {
        let url = activity_url(
            "https://admin.googleapis.com",
            &ResourceKey::new("[email]", "user_accounts"),
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://admin.googleapis.com/admin/reports/v1/activity/users/[email]/applications/user_accounts"
        );

        let url = activity_url("http://127.0.0.1:9000/", &ResourceKey::new("all", "a b")).unwrap();
        assert!(url.as_str().ends_with("/users/all/applications/a%20b"));
    }

    #[test]
    fn test_parse_expiration() {
        let parsed = parse_expiration("1700000000000").unwrap();
        assert_eq!(parsed.timestamp(), 1_700_000_000);
        assert!(parse_expiration("soon").is_none());
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status("watch", StatusCode::UNAUTHORIZED, ""),
            WatchError::AuthenticationUnavailable(_)
        ));
        assert!(matches!(
            classify_status("watch", StatusCode::TOO_MANY_REQUESTS, "quota"),
            WatchError::ProviderUnavailable(_)
        ));
        assert!(matches!(
            classify_status("watch", StatusCode::BAD_GATEWAY, ""),
            WatchError::ProviderUnavailable(_)
        ));
        assert!(matches!(
            classify_status("watch", StatusCode::BAD_REQUEST, "bad eventName"),
            WatchError::Provider(_)
        ));
    }

    #[test]
    fn test_watch_body_shape() {
        let body = WatchBody {
            id: "wch-1",
            kind: "web_hook",
            address: "https://hooks.example.com",
            token: "tok",
            expiration: "1700000000000".to_string(),
            payload: true,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["type"], "web_hook");
        assert_eq!(json["expiration"], "1700000000000");
        assert_eq!(json["payload"], true);
    }

    #[tokio::test]
    async fn test_static_token_rejects_empty() {
        assert!(StaticToken::new("abc").access_token().await.is_ok());
        assert!(matches!(
            StaticToken::new("  ").access_token().await,
            Err(WatchError::AuthenticationUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_watch_requires_webhook_address() {
        // Listing works without a webhook; creating channels does not
        let client =
            GoogleClient::new(GoogleConfig::default(), Arc::new(StaticToken::new("t"))).unwrap();
        let request = ChannelRequest {
            id: "wch-1".to_string(),
            topic: crate::types::Topic::new(ResourceKey::new("all", "login"), EventFilter::all()),
            token: "tok".to_string(),
            expires_at: Utc::now(),
        };
        assert!(matches!(client.watch(&request).await, Err(WatchError::Config(_))));
    }

    #[test]
    fn test_client_rejects_bad_base_url() {
        let config = GoogleConfig::new("https://hooks.example.com").with_base_url("not a url");
        let result = GoogleClient::new(config, Arc::new(StaticToken::new("t")));
        assert!(matches!(result, Err(WatchError::Config(_))));
    }
}
