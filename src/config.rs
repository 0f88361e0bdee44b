//! HCL configuration
//!
//! ```hcl
//! lease      = "5h"
//! state_path = "/var/lib/a3s-watch/channels.json"
//!
//! provider {
//!   webhook_address = "https://watch.example.com/google/workspace/notification"
//! }
//!
//! topic "login" {
//!   user_key    = "all"
//!   application = "login"
//!   events      = ["login_success", "login_verification"]
//! }
//! ```
//!
//! Every block other than `topic` is optional. Secrets (the provider
//! access token) never live in this file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::dispatch::DispatcherConfig;
use crate::error::{Result, WatchError};
use crate::manager::ManagerConfig;
use crate::provider::google::GoogleConfig;
use crate::retry::RetryPolicy;
use crate::types::{EventFilter, ResourceKey, Topic};

#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    /// Lease requested for each channel
    #[serde(default = "default_lease", with = "duration_serde")]
    pub lease: Duration,
    /// Where channels and watermarks are persisted; in memory when unset
    #[serde(default)]
    pub state_path: Option<PathBuf>,
    /// Stop every channel at the provider on graceful shutdown
    #[serde(default = "default_true")]
    pub stop_on_shutdown: bool,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub renewal: RenewalSettings,
    #[serde(default)]
    pub delivery: DeliverySettings,
    #[serde(default)]
    pub backfill: BackfillSettings,
    #[serde(default)]
    pub topic: IndexMap<String, TopicDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,
    /// Auth failures per source address before it is throttled
    #[serde(default = "default_auth_failure_limit")]
    pub auth_failure_limit: u32,
    #[serde(default = "default_minute", with = "duration_serde")]
    pub auth_failure_window: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            webhook_path: default_webhook_path(),
            auth_failure_limit: default_auth_failure_limit(),
            auth_failure_window: default_minute(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Public address the provider pushes deliveries to
    #[serde(default)]
    pub webhook_address: String,
    #[serde(default = "default_call_timeout", with = "duration_serde")]
    pub request_timeout: Duration,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            webhook_address: String::new(),
            request_timeout: default_call_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenewalSettings {
    #[serde(default = "default_window", with = "duration_serde")]
    pub window: Duration,
    #[serde(default = "default_scan_interval", with = "duration_serde")]
    pub scan_interval: Duration,
    #[serde(default = "default_call_timeout", with = "duration_serde")]
    pub call_timeout: Duration,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay", with = "duration_serde")]
    pub base_delay: Duration,
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,
}

impl Default for RenewalSettings {
    fn default() -> Self {
        Self {
            window: default_window(),
            scan_interval: default_scan_interval(),
            call_timeout: default_call_timeout(),
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliverySettings {
    #[serde(default = "default_dedup_window", with = "duration_serde")]
    pub dedup_window: Duration,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    #[serde(default = "default_handler_timeout", with = "duration_serde")]
    pub handler_timeout: Duration,
    /// Unknown-channel deliveries within `drift_window` that trigger a reconcile
    #[serde(default = "default_drift_threshold")]
    pub drift_threshold: usize,
    #[serde(default = "default_minute", with = "duration_serde")]
    pub drift_window: Duration,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            dedup_window: default_dedup_window(),
            dedup_capacity: default_dedup_capacity(),
            handler_timeout: default_handler_timeout(),
            drift_threshold: default_drift_threshold(),
            drift_window: default_minute(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackfillSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_results: default_max_results(),
            max_pages: default_max_pages(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopicDef {
    #[serde(default = "default_user_key")]
    pub user_key: String,
    pub application: String,
    /// Event names; empty watches every event of the application
    #[serde(default)]
    pub events: Vec<String>,
    /// One channel per event name instead of one for the whole set
    #[serde(default = "default_true")]
    pub per_event: bool,
}

fn default_true() -> bool {
    true
}
fn default_lease() -> Duration {
    Duration::from_secs(5 * 3600)
}
fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_webhook_path() -> String {
    "/google/workspace/notification".into()
}
fn default_auth_failure_limit() -> u32 {
    10
}
fn default_minute() -> Duration {
    Duration::from_secs(60)
}
fn default_base_url() -> String {
    GoogleConfig::default().base_url
}
fn default_call_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_window() -> Duration {
    Duration::from_secs(30 * 60)
}
fn default_scan_interval() -> Duration {
    Duration::from_secs(5 * 60)
}
fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}
fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}
fn default_dedup_window() -> Duration {
    Duration::from_secs(10 * 60)
}
fn default_dedup_capacity() -> usize {
    10_000
}
fn default_handler_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_drift_threshold() -> usize {
    20
}
fn default_max_results() -> u32 {
    100
}
fn default_max_pages() -> usize {
    10
}
fn default_user_key() -> String {
    "all".into()
}

mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(d)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let (value, unit): (&str, u64) = if let Some(v) = s.strip_suffix("ms") {
            return v
                .trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string());
        } else if let Some(v) = s.strip_suffix('s') {
            (v, 1)
        } else if let Some(v) = s.strip_suffix('m') {
            (v, 60)
        } else if let Some(v) = s.strip_suffix('h') {
            (v, 3600)
        } else {
            return Err(format!(
                "unknown duration format: '{s}' (use '500ms', '30s', '5m' or '5h')"
            ));
        };
        value
            .trim()
            .parse::<u64>()
            .map(|n| Duration::from_secs(n.saturating_mul(unit)))
            .map_err(|e| e.to_string())
    }
}

fn to_chrono(d: Duration, field: &str) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d)
        .map_err(|_| WatchError::Config(format!("{field} is out of range")))
}

impl WatchConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let src = std::fs::read_to_string(path)
            .map_err(|e| WatchError::Config(format!("cannot read {}: {e}", path.display())))?;
        let cfg: WatchConfig = hcl::from_str(&src).map_err(|e| {
            WatchError::Config(format!("parse error in {}: {e}", path.display()))
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse and validate HCL source
    pub fn from_hcl(src: &str) -> Result<Self> {
        let cfg: WatchConfig =
            hcl::from_str(src).map_err(|e| WatchError::Config(format!("parse error: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.topic.is_empty() {
            return Err(WatchError::Config("at least one topic block is required".into()));
        }
        for (name, def) in &self.topic {
            if def.application.trim().is_empty() {
                return Err(WatchError::Config(format!("topic '{name}' has no application")));
            }
            if def.user_key.trim().is_empty() {
                return Err(WatchError::Config(format!("topic '{name}' has an empty user_key")));
            }
        }

        if self.lease.is_zero() {
            return Err(WatchError::Config("lease must be greater than zero".into()));
        }
        if self.renewal.window.is_zero() || self.renewal.window >= self.lease {
            return Err(WatchError::Config(format!(
                "renewal.window ({:?}) must be positive and shorter than lease ({:?})",
                self.renewal.window, self.lease
            )));
        }
        // A channel entering the window must be scanned before it lapses
        let margin = self.lease - self.renewal.window;
        if self.renewal.scan_interval.is_zero() || self.renewal.scan_interval >= margin {
            return Err(WatchError::Config(format!(
                "renewal.scan_interval ({:?}) must be positive and shorter than lease minus window ({:?})",
                self.renewal.scan_interval, margin
            )));
        }
        if self.renewal.max_attempts == 0 {
            return Err(WatchError::Config("renewal.max_attempts must be at least 1".into()));
        }

        let address = self.provider.webhook_address.trim();
        if address.is_empty() {
            return Err(WatchError::Config("provider.webhook_address must be set".into()));
        }
        reqwest::Url::parse(address).map_err(|e| {
            WatchError::Config(format!("provider.webhook_address '{address}' is not a URL: {e}"))
        })?;

        if !self.server.webhook_path.starts_with('/') {
            return Err(WatchError::Config(format!(
                "server.webhook_path '{}' must start with '/'",
                self.server.webhook_path
            )));
        }
        if self.delivery.handler_timeout.is_zero() {
            return Err(WatchError::Config("delivery.handler_timeout must be positive".into()));
        }
        if self.delivery.dedup_window.is_zero() {
            return Err(WatchError::Config("delivery.dedup_window must be positive".into()));
        }
        if !(1..=crate::reader::MAX_PAGE_SIZE).contains(&self.backfill.max_results) {
            return Err(WatchError::Config(format!(
                "backfill.max_results must be between 1 and {}",
                crate::reader::MAX_PAGE_SIZE
            )));
        }
        to_chrono(self.lease, "lease")?;
        Ok(())
    }

    /// Expand topic blocks into watch topics, dropping duplicates
    pub fn topics(&self) -> Vec<Topic> {
        let mut seen = HashSet::new();
        let mut topics = Vec::new();

        for def in self.topic.values() {
            let resource = ResourceKey::new(def.user_key.trim(), def.application.trim());
            let filters: Vec<EventFilter> = if def.per_event && !def.events.is_empty() {
                def.events
                    .iter()
                    .map(|e| EventFilter::of([e.trim()]))
                    .filter(|f| !f.is_all())
                    .collect()
            } else {
                vec![EventFilter::of(def.events.iter().map(|e| e.trim()))]
            };

            for filter in filters {
                let topic = Topic::new(resource.clone(), filter);
                if seen.insert(topic.clone()) {
                    topics.push(topic);
                }
            }
        }
        topics
    }

    /// Distinct resources across all topics, with the union of their filters
    pub fn resources(&self) -> Vec<(ResourceKey, EventFilter)> {
        let mut merged: IndexMap<ResourceKey, Option<Vec<String>>> = IndexMap::new();
        for topic in self.topics() {
            let entry = merged
                .entry(topic.resource.clone())
                .or_insert_with(|| Some(Vec::new()));
            if topic.filter.is_all() {
                *entry = None;
            } else if let Some(names) = entry.as_mut() {
                names.extend(topic.filter.names().map(str::to_string));
            }
        }
        merged
            .into_iter()
            .map(|(resource, names)| {
                let filter = names.map(EventFilter::of).unwrap_or_else(EventFilter::all);
                (resource, filter)
            })
            .collect()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.renewal.max_attempts,
            base_delay_ms: self.renewal.base_delay.as_millis() as u64,
            max_delay_ms: self.renewal.max_delay.as_millis() as u64,
        }
    }

    pub fn manager_config(&self) -> Result<ManagerConfig> {
        Ok(ManagerConfig {
            lease: to_chrono(self.lease, "lease")?,
            renewal_window: to_chrono(self.renewal.window, "renewal.window")?,
            retry: self.retry_policy(),
            call_timeout: self.renewal.call_timeout,
        })
    }

    pub fn dispatcher_config(&self) -> Result<DispatcherConfig> {
        Ok(DispatcherConfig {
            dedup_window: to_chrono(self.delivery.dedup_window, "delivery.dedup_window")?,
            dedup_capacity: self.delivery.dedup_capacity,
            handler_timeout: self.delivery.handler_timeout,
            drift_threshold: self.delivery.drift_threshold,
            drift_window: to_chrono(self.delivery.drift_window, "delivery.drift_window")?,
        })
    }

    pub fn google_config(&self) -> GoogleConfig {
        GoogleConfig {
            base_url: self.provider.base_url.clone(),
            webhook_address: self.provider.webhook_address.clone(),
            request_timeout_secs: self.provider.request_timeout.as_secs().max(1),
            ..Default::default()
        }
    }
}
