//! Google Admin SDK Reports provider configuration

use serde::{Deserialize, Serialize};

/// Connection settings for the Reports API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GoogleConfig {
    /// API root, overridable for tests and proxies
    pub base_url: String,

    /// Public HTTPS address the provider pushes deliveries to
    pub webhook_address: String,

    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,

    /// User-Agent sent with every request
    pub user_agent: String,
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            base_url: "https://admin.googleapis.com".to_string(),
            webhook_address: String::new(),
            request_timeout_secs: 30,
            user_agent: format!("a3s-watch/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl GoogleConfig {
    /// Config pushing to `webhook_address` with defaults elsewhere
    pub fn new(webhook_address: impl Into<String>) -> Self {
        Self {
            webhook_address: webhook_address.into(),
            ..Default::default()
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GoogleConfig::default();
        assert_eq!(config.base_url, "https://admin.googleapis.com");
        assert_eq!(config.request_timeout_secs, 30);
        assert!(config.user_agent.starts_with("a3s-watch/"));
        assert!(config.webhook_address.is_empty());
    }

    #[test]
    fn test_builder() {
        let config = GoogleConfig::new("https://hooks.example.com/notify")
            .with_base_url("http://127.0.0.1:9000");
        assert_eq!(config.webhook_address, "https://hooks.example.com/notify");
        assert_eq!(config.base_url, "http://127.0.0.1:9000");
    }
}
