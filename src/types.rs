//! Core watch types for the a3s-watch system
//!
//! All types use camelCase JSON serialization for wire and state-file
//! compatibility.

use crate::error::{Result, WatchError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// The (actor domain, application) pair a channel watches
///
/// `user_key` is a user email, profile id, or `"all"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceKey {
    pub user_key: String,
    pub application: String,
}

impl ResourceKey {
    pub fn new(user_key: impl Into<String>, application: impl Into<String>) -> Self {
        Self {
            user_key: user_key.into(),
            application: application.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_key, self.application)
    }
}

/// Set of event names a channel is restricted to
///
/// An empty filter means every event of the application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventFilter(BTreeSet<String>);

impl EventFilter {
    /// Filter matching every event
    pub fn all() -> Self {
        Self(BTreeSet::new())
    }

    /// Filter restricted to the given event names (blank names are ignored)
    pub fn of<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            names
                .into_iter()
                .map(Into::into)
                .filter(|n: &String| !n.trim().is_empty())
                .collect(),
        )
    }

    pub fn is_all(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.is_empty() || self.0.contains(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Comma-joined names, as the provider's `eventName` parameter expects
    pub fn to_query(&self) -> Option<String> {
        if self.0.is_empty() {
            None
        } else {
            Some(self.0.iter().cloned().collect::<Vec<_>>().join(","))
        }
    }
}

impl fmt::Display for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("*")
        } else {
            write!(f, "{}", self.0.iter().cloned().collect::<Vec<_>>().join(","))
        }
    }
}

/// A watched topic: at most one live channel exists per topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    pub resource: ResourceKey,
    #[serde(default)]
    pub filter: EventFilter,
}

impl Topic {
    pub fn new(resource: ResourceKey, filter: EventFilter) -> Self {
        Self { resource, filter }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.resource, self.filter)
    }
}

/// Lifecycle state of a watch channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelState {
    /// Create call issued, provider has not confirmed yet
    Pending,
    /// Provider confirmed; deliveries expected until `expires_at`
    Active,
    /// Replacement channel is being created
    Renewing,
    /// Lease lapsed with no successful renewal
    Expired,
    /// Registration or renewal failed and retries are exhausted
    Failed,
}

impl ChannelState {
    /// Expired and Failed channels wait for garbage collection
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Expired | ChannelState::Failed)
    }

    pub fn is_live(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Pending => "pending",
            ChannelState::Active => "active",
            ChannelState::Renewing => "renewing",
            ChannelState::Expired => "expired",
            ChannelState::Failed => "failed",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-side identity of a created channel, needed to stop it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelHandle {
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_uri: Option<String>,
    /// Expiration granted by the provider (may be earlier than requested)
    pub expires_at: DateTime<Utc>,
}

/// Parameters of a create-channel call
#[derive(Clone)]
pub struct ChannelRequest {
    pub id: String,
    pub topic: Topic,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for ChannelRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRequest")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// One push subscription tracked by the registry
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchChannel {
    /// Locally generated, immutable once assigned
    pub id: String,
    pub topic: Topic,
    /// Echoed back by the provider on every delivery
    pub shared_token: String,
    pub expires_at: DateTime<Utc>,
    pub state: ChannelState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<ChannelHandle>,
    pub created_at: DateTime<Utc>,
    /// Renewal attempts made for this channel so far
    #[serde(default)]
    pub renewal_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl WatchChannel {
    /// Build a pending channel with a fresh id and shared token
    pub fn pending(topic: Topic, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: crate::token::new_channel_id(),
            topic,
            shared_token: crate::token::new_shared_token(),
            expires_at,
            state: ChannelState::Pending,
            handle: None,
            created_at: now,
            renewal_attempts: 0,
            last_error: None,
        }
    }

    /// The create-channel request for this channel
    pub fn request(&self) -> ChannelRequest {
        ChannelRequest {
            id: self.id.clone(),
            topic: self.topic.clone(),
            token: self.shared_token.clone(),
            expires_at: self.expires_at,
        }
    }

    /// Mark the channel confirmed by the provider
    pub fn activate(&mut self, handle: ChannelHandle) {
        self.expires_at = handle.expires_at;
        self.handle = Some(handle);
        self.state = ChannelState::Active;
        self.last_error = None;
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Token-free view for health output
    pub fn summary(&self) -> ChannelSummary {
        ChannelSummary {
            id: self.id.clone(),
            topic: self.topic.to_string(),
            state: self.state,
            expires_at: self.expires_at,
            renewal_attempts: self.renewal_attempts,
            last_error: self.last_error.clone(),
        }
    }
}

impl fmt::Debug for WatchChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchChannel")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("shared_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("state", &self.state)
            .field("handle", &self.handle)
            .field("renewal_attempts", &self.renewal_attempts)
            .field("last_error", &self.last_error)
            .finish()
    }
}

/// Public view of a channel without its secret
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSummary {
    pub id: String,
    pub topic: String,
    pub state: ChannelState,
    pub expires_at: DateTime<Utc>,
    pub renewal_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Resource state reported with a delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceState {
    /// First message after a channel is created
    Sync,
    /// A matching activity happened
    Exists,
    NotExists,
    Other(String),
}

impl ResourceState {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "sync" => ResourceState::Sync,
            "exists" => ResourceState::Exists,
            "not_exists" => ResourceState::NotExists,
            other => ResourceState::Other(other.to_string()),
        }
    }
}

/// Header names of a provider push delivery
pub mod headers {
    pub const CHANNEL_ID: &str = "x-goog-channel-id";
    pub const CHANNEL_TOKEN: &str = "x-goog-channel-token";
    pub const CHANNEL_EXPIRATION: &str = "x-goog-channel-expiration";
    pub const RESOURCE_STATE: &str = "x-goog-resource-state";
    pub const RESOURCE_ID: &str = "x-goog-resource-id";
    pub const MESSAGE_NUMBER: &str = "x-goog-message-number";
}

/// A received delivery, validated and dropped within one request
#[derive(Clone)]
pub struct NotificationEnvelope {
    /// Claimed channel id
    pub channel_id: String,
    /// Claimed shared token
    pub token: Option<String>,
    pub resource_state: ResourceState,
    /// Provider message number, used as the dedup nonce when present
    pub message_number: Option<String>,
    pub resource_id: Option<String>,
    pub channel_expiration: Option<String>,
    /// Parsed JSON body (`None` when the delivery carried no payload)
    pub payload: Option<serde_json::Value>,
    pub body: Bytes,
}

impl NotificationEnvelope {
    /// Parse a delivery from its headers (any case) and raw body
    pub fn from_headers<'a, I>(pairs: I, body: Bytes) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut channel_id = None;
        let mut token = None;
        let mut resource_state = None;
        let mut message_number = None;
        let mut resource_id = None;
        let mut channel_expiration = None;

        for (name, value) in pairs {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match name.to_ascii_lowercase().as_str() {
                headers::CHANNEL_ID => channel_id = Some(value.to_string()),
                headers::CHANNEL_TOKEN => token = Some(value.to_string()),
                headers::RESOURCE_STATE => resource_state = Some(ResourceState::parse(value)),
                headers::MESSAGE_NUMBER => message_number = Some(value.to_string()),
                headers::RESOURCE_ID => resource_id = Some(value.to_string()),
                headers::CHANNEL_EXPIRATION => channel_expiration = Some(value.to_string()),
                _ => {}
            }
        }

        let channel_id = channel_id.ok_or_else(|| {
            WatchError::MalformedEnvelope(format!("missing {}", headers::CHANNEL_ID))
        })?;
        let resource_state = resource_state.ok_or_else(|| {
            WatchError::MalformedEnvelope(format!("missing {}", headers::RESOURCE_STATE))
        })?;

        let payload = if body.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            Some(serde_json::from_slice(&body).map_err(|e| {
                WatchError::MalformedEnvelope(format!("body is not JSON: {}", e))
            })?)
        };

        Ok(Self {
            channel_id,
            token,
            resource_state,
            message_number,
            resource_id,
            channel_expiration,
            payload,
            body,
        })
    }

    /// Dedup nonce: the message number, or a hash of the body
    pub fn nonce(&self) -> String {
        match &self.message_number {
            Some(n) => n.clone(),
            None => format!("sha256:{}", crate::token::content_hash(&self.body)),
        }
    }
}

impl fmt::Debug for NotificationEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationEnvelope")
            .field("channel_id", &self.channel_id)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("resource_state", &self.resource_state)
            .field("message_number", &self.message_number)
            .field("resource_id", &self.resource_id)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Identity of one activity record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityId {
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_qualifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
}

/// Who performed an activity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_type: Option<String>,
}

/// One named event inside an activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDetail {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<serde_json::Value>,
}

/// One audit activity returned by the pull API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub id: ActivityId,
    #[serde(default)]
    pub actor: Actor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub events: Vec<EventDetail>,
}

impl ActivityEvent {
    pub fn time(&self) -> DateTime<Utc> {
        self.id.time
    }
}

/// One page of the pull API, most recent first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPage {
    #[serde(default)]
    pub items: Vec<ActivityEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}
