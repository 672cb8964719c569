//! Tunables for the connection layer.
//!
//! Both structs deserialize from JSON with every field optional, so the
//! bootstrap layer only needs to spell out what it overrides.

use serde::Deserialize;
use std::time::Duration;

/// Connection manager configuration. Durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// First reconnection delay
    pub base_delay_ms: u64,
    /// Upper bound for the exponential part of the delay
    pub max_delay_ms: u64,
    /// Failed attempts tolerated before the breaker opens
    pub max_attempts: u32,
    /// Time the breaker stays open before a half-open trial is allowed
    pub circuit_reset_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub ping_timeout_ms: u64,
    /// Hard bound on opening one sub-channel
    pub connect_timeout_ms: u64,
    pub credential_check_interval_ms: u64,
    /// Refresh when the credential expires sooner than this
    pub credential_refresh_threshold_ms: u64,
    /// Buffered frames per sub-channel subscriber
    pub channel_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 10,
            circuit_reset_timeout_ms: 60_000,
            health_check_interval_ms: 30_000,
            ping_timeout_ms: 10_000,
            connect_timeout_ms: 20_000,
            credential_check_interval_ms: 60_000,
            credential_refresh_threshold_ms: 300_000,
            channel_capacity: 256,
        }
    }
}

impl ConnectionConfig {
    /// Parse from a JSON document, filling unspecified fields with defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn circuit_reset_timeout(&self) -> Duration {
        Duration::from_millis(self.circuit_reset_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn credential_check_interval(&self) -> Duration {
        Duration::from_millis(self.credential_check_interval_ms)
    }

    pub fn credential_refresh_threshold(&self) -> Duration {
        Duration::from_millis(self.credential_refresh_threshold_ms)
    }
}

/// WebSocket transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Endpoint of the sync authority, e.g. `ws://127.0.0.1:9090/sync`
    pub url: String,
    /// Inbound frames buffered per sub-channel
    pub inbound_capacity: usize,
    /// Outbound frames buffered per sub-channel
    pub outbound_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            inbound_capacity: 256,
            outbound_capacity: 256,
        }
    }
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = ConnectionConfig::default();
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.circuit_reset_timeout(), Duration::from_secs(60));
        assert_eq!(config.health_check_interval(), Duration::from_secs(30));
        assert_eq!(config.ping_timeout(), Duration::from_secs(10));
        assert_eq!(config.connect_timeout(), Duration::from_secs(20));
        assert_eq!(config.credential_check_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ConnectionConfig::from_json(r#"{ "max_attempts": 3, "base_delay_ms": 250 }"#)
            .unwrap();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.base_delay_ms, 250);
        assert_eq!(config.max_delay_ms, 30_000);
    }

    #[test]
    fn test_transport_config_url() {
        let config = TransportConfig::new("ws://example.test/sync");
        assert_eq!(config.url, "ws://example.test/sync");
        assert_eq!(config.inbound_capacity, 256);
    }
}
