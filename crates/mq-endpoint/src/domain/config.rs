//! Endpoint configuration with validation.
//!
//! The configuration is an immutable snapshot: it is handed to the
//! [`EndpointBuilder`](crate::EndpointBuilder) and only readable afterwards.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default time a correlated request waits for its reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Default property used to route replies on an externally shared reply queue.
pub const DEFAULT_CORRELATION_PROPERTY: &str = "MqRequestorToken";

/// Main endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Destination name, used when no explicit destination or resolver is given
    pub destination_name: Option<String>,
    /// Publish/subscribe (topic) instead of point-to-point (queue)
    pub pub_sub_domain: bool,
    /// Message selector applied by consumers
    pub selector: Option<String>,
    /// Time a correlated request waits for its reply
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Where replies to correlated requests are sent
    pub reply_to: ReplyToPolicy,
    /// Listener worker bounds
    pub concurrency: ConcurrencyBounds,
    /// How consumed messages are acknowledged
    pub acknowledgement_mode: AcknowledgementMode,
    /// Listener poll period
    #[serde(with = "humantime_serde")]
    pub receive_timeout: Duration,
    /// Messages a listener worker handles before it is recycled (0 = unlimited)
    pub max_messages_per_task: u32,
    /// Consecutive empty polls before a surplus worker retires
    pub idle_task_execution_limit: u32,
    /// Period of the pending-request purge task
    #[serde(with = "humantime_serde")]
    pub request_map_purge_interval: Duration,
    /// Extra time past its deadline before the purge task evicts an entry
    #[serde(with = "humantime_serde")]
    pub purge_grace: Duration,
    /// Ignore reply-to addresses: producers send in-only, consumers never reply
    pub disable_reply_to: bool,
    /// Property carrying the requestor token on an externally shared reply queue
    pub correlation_property: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            destination_name: None,
            pub_sub_domain: false,
            selector: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reply_to: ReplyToPolicy::default(),
            concurrency: ConcurrencyBounds::default(),
            acknowledgement_mode: AcknowledgementMode::default(),
            receive_timeout: Duration::from_secs(1),
            max_messages_per_task: 0,
            idle_task_execution_limit: 1,
            request_map_purge_interval: Duration::from_secs(1),
            purge_grace: Duration::from_secs(1),
            disable_reply_to: false,
            correlation_property: DEFAULT_CORRELATION_PROPERTY.to_string(),
        }
    }
}

impl EndpointConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "request_timeout cannot be 0".into(),
            ));
        }

        if self.receive_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "receive_timeout cannot be 0".into(),
            ));
        }

        if self.request_map_purge_interval.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "request_map_purge_interval cannot be 0".into(),
            ));
        }

        if self.concurrency.max == 0 {
            return Err(ConfigError::InvalidConcurrency(
                "max concurrency cannot be 0".into(),
            ));
        }

        if self.concurrency.min > self.concurrency.max {
            return Err(ConfigError::InvalidConcurrency(format!(
                "min ({}) exceeds max ({})",
                self.concurrency.min, self.concurrency.max
            )));
        }

        if self.idle_task_execution_limit == 0 {
            return Err(ConfigError::Invalid(
                "idle_task_execution_limit cannot be 0".into(),
            ));
        }

        if let ReplyToPolicy::Shared { destination, .. } = &self.reply_to {
            if destination.trim().is_empty() {
                return Err(ConfigError::InvalidReplyTo(
                    "shared reply destination name is empty".into(),
                ));
            }
        }

        if self.correlation_property.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "correlation_property cannot be empty".into(),
            ));
        }

        Ok(())
    }

    /// Request timeout in milliseconds
    pub fn request_timeout_ms(&self) -> u64 {
        self.request_timeout.as_millis() as u64
    }
}

/// Reply channel used by correlated requests.
///
/// The choice is explicit; the requestor never switches between policies on
/// its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplyToPolicy {
    /// One durable queue for every request of the endpoint.
    ///
    /// When `externally_shared`, other requestors read the same queue: the
    /// reply listener then selects on the endpoint's correlation property.
    Shared {
        destination: String,
        #[serde(default)]
        externally_shared: bool,
    },
    /// One temporary queue per requestor, deleted when it stops.
    SharedTemporary,
    /// A fresh temporary queue per request, deleted when the request ends.
    PerRequestTemporary,
}

impl Default for ReplyToPolicy {
    fn default() -> Self {
        Self::SharedTemporary
    }
}

/// Listener worker bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyBounds {
    /// Workers kept alive while the consumer runs
    pub min: usize,
    /// Upper limit under backlog
    pub max: usize,
}

impl ConcurrencyBounds {
    pub fn new(min: usize, max: usize) -> Self {
        Self { min, max }
    }

    /// Exactly one worker.
    pub fn single() -> Self {
        Self { min: 1, max: 1 }
    }
}

impl Default for ConcurrencyBounds {
    fn default() -> Self {
        Self::single()
    }
}

/// How consumed messages are acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcknowledgementMode {
    /// Acknowledge after successful processing; failures are redelivered.
    #[default]
    Auto,
    /// Acknowledge on receipt; failed messages are not redelivered.
    DupsOk,
}

/// Configuration errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid timeout value
    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),
    /// Invalid worker bounds
    #[error("invalid concurrency: {0}")]
    InvalidConcurrency(String),
    /// Invalid reply-to policy
    #[error("invalid reply-to policy: {0}")]
    InvalidReplyTo(String),
    /// General configuration error
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = EndpointConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reply_to, ReplyToPolicy::SharedTemporary);
        assert_eq!(config.request_timeout_ms(), 20_000);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = EndpointConfig {
            request_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTimeout(_))));
    }

    #[test]
    fn test_min_above_max_rejected() {
        let config = EndpointConfig {
            concurrency: ConcurrencyBounds::new(4, 2),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConcurrency(_))
        ));
    }

    #[test]
    fn test_zero_max_rejected() {
        let config = EndpointConfig {
            concurrency: ConcurrencyBounds::new(0, 0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_shared_destination_rejected() {
        let config = EndpointConfig {
            reply_to: ReplyToPolicy::Shared {
                destination: " ".into(),
                externally_shared: false,
            },
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidReplyTo(_))));
    }

    #[test]
    fn test_deserialize_with_humantime() {
        let json = r#"{
            "destination_name": "orders",
            "request_timeout": "250ms",
            "reply_to": { "kind": "shared", "destination": "replies", "externally_shared": true },
            "concurrency": { "min": 1, "max": 3 },
            "acknowledgement_mode": "dups_ok"
        }"#;
        let config: EndpointConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.destination_name.as_deref(), Some("orders"));
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(
            config.reply_to,
            ReplyToPolicy::Shared {
                destination: "replies".into(),
                externally_shared: true
            }
        );
        assert_eq!(config.concurrency, ConcurrencyBounds::new(1, 3));
        assert_eq!(config.acknowledgement_mode, AcknowledgementMode::DupsOk);
        // Unspecified fields keep their defaults
        assert_eq!(config.receive_timeout, Duration::from_secs(1));
        assert_eq!(config.correlation_property, DEFAULT_CORRELATION_PROPERTY);
    }

    #[test]
    fn test_serialize_round_trip() {
        let config = EndpointConfig {
            reply_to: ReplyToPolicy::PerRequestTemporary,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: EndpointConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.reply_to, ReplyToPolicy::PerRequestTemporary);
        assert_eq!(parsed.request_timeout, config.request_timeout);
    }
}
