//! Error types for a3s-watch

use thiserror::Error;

/// Errors that can occur in the watch system
#[derive(Debug, Error)]
pub enum WatchError {
    /// Credential or client setup failed; the process should not serve
    #[error("Authentication unavailable: {0}")]
    AuthenticationUnavailable(String),

    /// Transient network, quota, or server-side failure at the provider
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Provider rejected the request and retrying will not help
    #[error("Provider error: {0}")]
    Provider(String),

    /// A live channel already exists for this topic
    #[error("Channel conflict for topic '{topic}': channel {existing} is still live")]
    Conflict { topic: String, existing: String },

    /// Delivery token did not match the channel's shared token
    #[error("Delivery authentication failed for channel {0}")]
    AuthFailed(String),

    /// Delivery names a channel that is not in the registry
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    /// Delivery could not be parsed
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Channel or topic not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistence failure
    #[error("State error: {0}")]
    State(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WatchError {
    /// Whether the backoff loop should try the operation again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WatchError::ProviderUnavailable(_) | WatchError::Timeout(_)
        )
    }

    /// Stable kind label for logs and health reports
    pub fn kind(&self) -> &'static str {
        match self {
            WatchError::AuthenticationUnavailable(_) => "authentication_unavailable",
            WatchError::ProviderUnavailable(_) => "provider_unavailable",
            WatchError::Provider(_) => "provider",
            WatchError::Conflict { .. } => "conflict",
            WatchError::AuthFailed(_) => "auth_failed",
            WatchError::UnknownChannel(_) => "unknown_channel",
            WatchError::MalformedEnvelope(_) => "malformed_envelope",
            WatchError::NotFound(_) => "not_found",
            WatchError::Timeout(_) => "timeout",
            WatchError::Config(_) => "config",
            WatchError::State(_) => "state",
            WatchError::Serialization(_) => "serialization",
        }
    }
}

/// Result type alias for watch operations
pub type Result<T> = std::result::Result<T, WatchError>;
