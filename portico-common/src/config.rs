//! Configuration types shared by the broker and the client agent

use crate::error::{Result, TunnelError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resource limits configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum control frame size in bytes (default: 16MB)
    pub max_frame_bytes: u64,
    /// Maximum concurrent control connections
    pub max_connections: usize,
    /// Maximum concurrent public HTTP connections
    pub max_http_connections: usize,
    /// Maximum public request body forwarded through a tunnel
    pub max_request_body: usize,
    /// Maximum local response body relayed back
    pub max_response_body: usize,
    /// Maximum number of headers on a forwarded request or response
    pub max_headers: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 16 * 1024 * 1024,
            max_connections: 1000,
            max_http_connections: 10_000,
            max_request_body: 10 * 1024 * 1024,
            max_response_body: 10 * 1024 * 1024,
            max_headers: 100,
        }
    }
}

/// Reconnection policy for the client agent.
///
/// The default is a fixed 5 second delay: `factor` 1.0 and no jitter. Set
/// `factor` above 1.0 for exponential backoff capped at `reconnect_max`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Base delay for reconnection backoff
    pub reconnect_base: Duration,
    /// Maximum delay for reconnection backoff
    pub reconnect_max: Duration,
    /// Multiplier applied per failed attempt
    pub factor: f64,
    /// Jitter factor (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            reconnect_base: Duration::from_secs(5),
            reconnect_max: Duration::from_secs(60),
            factor: 1.0,
            jitter_factor: 0.0,
        }
    }
}

/// Relay pipeline timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Hard bound on the forward step
    pub forward_timeout: Duration,
    /// Run the liveness probe before forwarding
    pub probe_enabled: bool,
    /// Bound on the liveness probe
    pub probe_timeout: Duration,
    /// Host dialed for tunnels created through the admin API
    pub static_upstream_host: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            forward_timeout: Duration::from_secs(10),
            probe_enabled: true,
            probe_timeout: Duration::from_secs(3),
            static_upstream_host: crate::constants::DEFAULT_STATIC_UPSTREAM_HOST.to_string(),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.forward_timeout.is_zero() {
            return Err(TunnelError::Config("forward_timeout must be non-zero".into()));
        }
        if self.probe_enabled && self.probe_timeout.is_zero() {
            return Err(TunnelError::Config("probe_timeout must be non-zero".into()));
        }
        if self.static_upstream_host.is_empty() {
            return Err(TunnelError::Config(
                "static_upstream_host is required".into(),
            ));
        }
        Ok(())
    }
}
