//! Messaging configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::bus::ReconnectPolicy;
use crate::utils::retry::{DEFAULT_BASE_INTERVAL, DEFAULT_MAX_RETRIES};

/// Broker connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Reconnect schedule after a connection loss.
    pub reconnect: ReconnectConfig,
    /// Unconfirmed publishes allowed before `publish` reports backpressure.
    pub max_in_flight: usize,
    /// Exchange used for entities without a configured route.
    pub default_exchange: Option<String>,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            reconnect: ReconnectConfig::default(),
            max_in_flight: 256,
            default_exchange: None,
        }
    }
}

/// Linear reconnect backoff: attempt `n` waits `n × base_interval_ms`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_retries: usize,
    pub base_interval_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_interval_ms: DEFAULT_BASE_INTERVAL.as_millis() as u64,
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_retries: self.max_retries,
            base_interval: Duration::from_millis(self.base_interval_ms),
        }
    }
}
