//! Client configuration
//!
//! Options accepted by [`TorClient::new`](crate::TorClient::new). The struct
//! deserializes from a plain JS object via `serde-wasm-bindgen`; unspecified
//! fields take the defaults below.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TorError};

/// Configuration for a snowtor client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TorClientConfig {
    /// WebSocket URL of the pluggable-transport bridge. Required.
    pub bridge_url: String,

    /// Deadline for the bridge WebSocket to reach OPEN.
    pub connection_timeout_ms: u32,

    /// Deadline for the link handshake to reach `Handshaked`.
    pub circuit_timeout_ms: u32,

    /// Deadline for a single EXTEND2/EXTENDED2 round trip.
    pub extend_timeout_ms: u32,

    /// Target circuit pool size. 0 disables pre-creation.
    pub circuit_buffer: usize,

    /// Milliseconds from allocation to forced disposal of a host-bound
    /// circuit. `None` disables lifetime expiry.
    pub max_circuit_lifetime_ms: Option<u64>,
}

impl Default for TorClientConfig {
    fn default() -> Self {
        Self {
            bridge_url: String::new(),
            connection_timeout_ms: 15_000,
            circuit_timeout_ms: 90_000,
            extend_timeout_ms: 10_000,
            circuit_buffer: 2,
            max_circuit_lifetime_ms: Some(600_000),
        }
    }
}

impl TorClientConfig {
    /// Configuration with only the bridge URL set, everything else default.
    pub fn with_bridge(bridge_url: impl Into<String>) -> Self {
        Self {
            bridge_url: bridge_url.into(),
            ..Self::default()
        }
    }

    /// Validate fields that cannot be checked by serde alone.
    pub fn validate(&self) -> Result<()> {
        if self.bridge_url.is_empty() {
            return Err(TorError::InvalidUrl("bridge_url is required".into()));
        }
        if !self.bridge_url.starts_with("ws://") && !self.bridge_url.starts_with("wss://") {
            return Err(TorError::InvalidUrl(format!(
                "bridge_url must be a ws:// or wss:// URL, got {}",
                self.bridge_url
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = TorClientConfig::default();
        assert_eq!(config.connection_timeout_ms, 15_000);
        assert_eq!(config.circuit_timeout_ms, 90_000);
        assert_eq!(config.circuit_buffer, 2);
        assert_eq!(config.max_circuit_lifetime_ms, Some(600_000));
    }

    #[test]
    fn rejects_non_websocket_bridge() {
        let config = TorClientConfig::with_bridge("https://bridge.example");
        assert!(config.validate().is_err());

        let config = TorClientConfig::with_bridge("wss://bridge.example/snowflake");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_bridge_url_is_rejected() {
        assert!(TorClientConfig::default().validate().is_err());
    }
}
