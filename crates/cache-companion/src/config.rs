//! # Companion Configuration
//!
//! Settings for one cache node's bus companion. Validated once at startup;
//! an invalid configuration never reaches the bus.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `CACHE_COMPANION_CONNECTION_STRING` | (required) | Bus connection string |
//! | `CACHE_COMPANION_TOPIC` | `cache-sync` | Shared topic name |
//! | `CACHE_COMPANION_NODE_ID` | (required) | This node's id and subscription name |
//! | `CACHE_COMPANION_REQUEST_TIMEOUT_MS` | `5000` | Per-peer request timeout |
//! | `CACHE_COMPANION_CHUNK_SIZE_BYTES` | `204800` | Maximum body size per message |

use crate::chunking::DEFAULT_CHUNK_SIZE;
use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use shared_bus::{SubscriptionOptions, TopicOptions};
use std::time::Duration;

/// Lowest accepted per-request timeout.
pub const MIN_REQUEST_TIMEOUT_MS: u64 = 1_000;

/// Longest node id accepted as a subscription name.
pub const MAX_NODE_ID_LEN: usize = 50;

const ENV_PREFIX: &str = "CACHE_COMPANION_";

/// Companion configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    /// Bus connection string.
    pub connection_string: String,

    /// Topic shared by all nodes.
    pub topic_name: String,

    /// This node's identity; also its subscription name.
    pub node_id: String,

    /// Per-peer request timeout in milliseconds.
    pub request_timeout_ms: u64,

    /// Maximum body size of a single response chunk.
    pub chunk_size_bytes: usize,

    /// Bounded wait of one receive call in milliseconds.
    pub receive_wait_ms: u64,

    /// Interval of the pending-response sweep in seconds.
    pub sweep_interval_secs: u64,

    /// Topic is deleted by the broker after this long without traffic.
    pub topic_auto_delete_idle_secs: u64,

    /// Default message time-to-live in seconds.
    pub message_ttl_secs: u64,

    /// Peek-lock duration in seconds.
    pub lock_duration_secs: u64,

    /// Deliveries before the broker dead-letters a message.
    pub max_delivery_count: u32,

    /// Attempts per provisioning step.
    pub retry_max_attempts: u32,

    /// First provisioning retry delay in milliseconds.
    pub retry_initial_backoff_ms: u64,

    /// Largest provisioning retry delay in milliseconds.
    pub retry_max_backoff_ms: u64,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            topic_name: "cache-sync".to_string(),
            node_id: String::new(),
            request_timeout_ms: 5_000,
            chunk_size_bytes: DEFAULT_CHUNK_SIZE,
            receive_wait_ms: 10_000,
            sweep_interval_secs: 60,
            topic_auto_delete_idle_secs: 24 * 60 * 60,
            message_ttl_secs: 60,
            lock_duration_secs: 5,
            max_delivery_count: 3,
            retry_max_attempts: 5,
            retry_initial_backoff_ms: 100,
            retry_max_backoff_ms: 5_000,
        }
    }
}

impl CompanionConfig {
    /// Create a config with the required fields and defaults elsewhere.
    pub fn new(
        connection_string: impl Into<String>,
        topic_name: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            connection_string: connection_string.into(),
            topic_name: topic_name.into(),
            node_id: node_id.into(),
            ..Self::default()
        }
    }

    /// Create a config for testing (short waits and backoffs).
    pub fn for_testing(node_id: impl Into<String>) -> Self {
        Self {
            connection_string: "memory://test".to_string(),
            node_id: node_id.into(),
            request_timeout_ms: MIN_REQUEST_TIMEOUT_MS,
            receive_wait_ms: 200,
            sweep_interval_secs: 60,
            retry_initial_backoff_ms: 10,
            retry_max_backoff_ms: 100,
            ..Self::default()
        }
    }

    /// Load from `CACHE_COMPANION_*` environment variables.
    ///
    /// Unset variables keep their defaults. The result is not validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(format!("{ENV_PREFIX}{name}")).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        fn parse<T: std::str::FromStr>(name: &str, raw: String) -> Result<T, ConfigError> {
            raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                var: format!("{ENV_PREFIX}{name}"),
                value: raw,
            })
        }

        let mut config = Self::default();
        if let Some(v) = lookup("CONNECTION_STRING") {
            config.connection_string = v;
        }
        if let Some(v) = lookup("TOPIC") {
            config.topic_name = v;
        }
        if let Some(v) = lookup("NODE_ID") {
            config.node_id = v;
        }
        if let Some(v) = lookup("REQUEST_TIMEOUT_MS") {
            config.request_timeout_ms = parse("REQUEST_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("CHUNK_SIZE_BYTES") {
            config.chunk_size_bytes = parse("CHUNK_SIZE_BYTES", v)?;
        }
        Ok(config)
    }

    /// Check the configuration before connecting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection_string.trim().is_empty() {
            return Err(ConfigError::EmptyConnectionString);
        }
        if self.topic_name.trim().is_empty() {
            return Err(ConfigError::EmptyTopicName);
        }
        if !is_valid_node_id(&self.node_id) {
            return Err(ConfigError::InvalidNodeId(self.node_id.clone()));
        }
        if self.request_timeout_ms < MIN_REQUEST_TIMEOUT_MS {
            return Err(ConfigError::RequestTimeoutTooShort {
                got_ms: self.request_timeout_ms,
                min_ms: MIN_REQUEST_TIMEOUT_MS,
            });
        }
        if self.chunk_size_bytes == 0 {
            return Err(ConfigError::MustBePositive("chunk_size_bytes"));
        }
        if self.receive_wait_ms == 0 {
            return Err(ConfigError::MustBePositive("receive_wait_ms"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::MustBePositive("sweep_interval_secs"));
        }
        if self.max_delivery_count == 0 {
            return Err(ConfigError::MustBePositive("max_delivery_count"));
        }
        if self.retry_max_attempts == 0 {
            return Err(ConfigError::MustBePositive("retry_max_attempts"));
        }
        Ok(())
    }

    /// Per-peer request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Bounded wait of one receive call.
    pub fn receive_wait(&self) -> Duration {
        Duration::from_millis(self.receive_wait_ms)
    }

    /// Interval (and maximum entry age) of the pending-response sweep.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Provisioning retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
        }
    }

    /// Desired topic properties.
    pub fn topic_options(&self) -> TopicOptions {
        TopicOptions {
            name: self.topic_name.clone(),
            auto_delete_on_idle: Duration::from_secs(self.topic_auto_delete_idle_secs),
            default_message_ttl: Duration::from_secs(self.message_ttl_secs),
            enable_batched_operations: true,
        }
    }

    /// Desired properties of this node's subscription.
    pub fn subscription_options(&self) -> SubscriptionOptions {
        SubscriptionOptions {
            topic_name: self.topic_name.clone(),
            name: self.node_id.clone(),
            lock_duration: Duration::from_secs(self.lock_duration_secs),
            dead_lettering_on_expiration: false,
            max_delivery_count: self.max_delivery_count,
            enable_batched_operations: true,
        }
    }
}

fn is_valid_node_id(node_id: &str) -> bool {
    !node_id.is_empty()
        && node_id.len() <= MAX_NODE_ID_LEN
        && node_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = CompanionConfig::default();
        assert_eq!(config.chunk_size_bytes, 200 * 1024);
        assert_eq!(config.receive_wait(), Duration::from_secs(10));
        assert_eq!(config.sweep_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_testing_config_is_valid() {
        assert!(CompanionConfig::for_testing("node-a").validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_connection_string() {
        let config = CompanionConfig::new("", "cache-sync", "node-a");
        assert_eq!(config.validate(), Err(ConfigError::EmptyConnectionString));
    }

    #[test]
    fn test_rejects_bad_node_ids() {
        for bad in ["", "has space", "slash/node", &"x".repeat(51)] {
            let config = CompanionConfig::new("memory://", "cache-sync", bad);
            assert!(matches!(config.validate(), Err(ConfigError::InvalidNodeId(_))));
        }
    }

    #[test]
    fn test_rejects_short_timeout() {
        let mut config = CompanionConfig::for_testing("node-a");
        config.request_timeout_ms = 999;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RequestTimeoutTooShort { got_ms: 999, .. })
        ));
    }

    #[test]
    fn test_rejects_zero_chunk_size() {
        let mut config = CompanionConfig::for_testing("node-a");
        config.chunk_size_bytes = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::MustBePositive("chunk_size_bytes"))
        );
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("CONNECTION_STRING", "memory://local"),
            ("NODE_ID", "node-7"),
            ("REQUEST_TIMEOUT_MS", "2500"),
        ]
        .into_iter()
        .collect();

        let config =
            CompanionConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string())).unwrap();
        assert_eq!(config.connection_string, "memory://local");
        assert_eq!(config.node_id, "node-7");
        assert_eq!(config.request_timeout(), Duration::from_millis(2500));
        assert_eq!(config.topic_name, "cache-sync");
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let result = CompanionConfig::from_lookup(|name| {
            (name == "CHUNK_SIZE_BYTES").then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_subscription_named_after_node() {
        let config = CompanionConfig::for_testing("node-a");
        let options = config.subscription_options();
        assert_eq!(options.name, "node-a");
        assert!(!options.dead_lettering_on_expiration);
        assert_eq!(options.max_delivery_count, 3);
    }
}
