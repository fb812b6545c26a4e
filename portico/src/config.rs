//! Configuration types for the Portico broker and client agent.
//!
//! Use [`ServerBuilder`](crate::ServerBuilder) and
//! [`ClientBuilder`](crate::ClientBuilder) for ergonomic construction.

use portico_common::constants::{
    DEFAULT_CONTROL_PORT, DEFAULT_HTTP_PORT, DEFAULT_LOCAL_HOST,
};
use portico_common::{LimitsConfig, RelayConfig, ResilienceConfig, Result, TunnelError};
use portico_core::auth::validate_token_format;
use portico_core::registry::validate_port;
use portico_protocol::constants::{HANDSHAKE_TIMEOUT_SECS, HEARTBEAT_INTERVAL_SECS, MAX_TOKEN_LEN};
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the broker.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address of the control channel listener
    pub control_bind: SocketAddr,

    /// Address of the public relay listener
    pub http_bind: SocketAddr,

    /// Address of the admin API; `None` disables it
    pub admin_bind: Option<SocketAddr>,

    /// Token clients must present in `hello`; `None` accepts any client
    pub auth_token: Option<String>,

    /// Bearer token for the admin API
    pub admin_token: Option<String>,

    /// How long a new connection may take to send `hello`
    pub handshake_timeout: Duration,

    pub relay: RelayConfig,
    pub limits: LimitsConfig,
}

impl ServerConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.relay.validate()?;
        if self.admin_bind.is_some() && self.admin_token.is_none() {
            return Err(TunnelError::Config(
                "admin_token is required when the admin API is enabled".into(),
            ));
        }
        check_token("token", self.auth_token.as_deref())?;
        check_token("admin_token", self.admin_token.as_deref())?;
        if self.limits.max_connections == 0 || self.limits.max_http_connections == 0 {
            return Err(TunnelError::Config("connection limits must be non-zero".into()));
        }
        if self.handshake_timeout.is_zero() {
            return Err(TunnelError::Config("handshake_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

fn check_token(name: &str, token: Option<&str>) -> Result<()> {
    match token {
        Some(token) => validate_token_format(token, MAX_TOKEN_LEN)
            .map_err(|e| TunnelError::Config(format!("{name}: {e}"))),
        None => Ok(()),
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            control_bind: ([0, 0, 0, 0], DEFAULT_CONTROL_PORT).into(),
            http_bind: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            admin_bind: None,
            auth_token: None,
            admin_token: None,
            handshake_timeout: Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            relay: RelayConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

/// Configuration for the client agent.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker control channel address (host:port)
    pub server_addr: String,

    /// Token sent in `hello`
    pub auth_token: Option<String>,

    /// Host of the local service
    pub local_host: String,

    /// Port of the local service
    pub local_port: u32,

    /// Public port requested from the broker
    pub public_port: u32,

    /// Domain requested from the broker
    pub custom_domain: Option<String>,

    /// Keep reconnecting after a session ends
    pub auto_reconnect: bool,

    pub resilience: ResilienceConfig,

    pub heartbeat_interval: Duration,
}

impl ClientConfig {
    /// Validate the configuration.
    ///
    /// The public port is left to the broker to judge.
    pub fn validate(&self) -> Result<()> {
        if self.server_addr.is_empty() {
            return Err(TunnelError::Config("server_addr is required".into()));
        }
        if self.local_host.is_empty() {
            return Err(TunnelError::Config("local_host is required".into()));
        }
        validate_port(self.local_port)
            .map_err(|e| TunnelError::Config(format!("local_port: {e}")))?;
        check_token("token", self.auth_token.as_deref())?;
        if self.resilience.reconnect_base.is_zero() {
            return Err(TunnelError::Config("reconnect delay must be non-zero".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(TunnelError::Config("heartbeat_interval must be non-zero".into()));
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: String::new(),
            auth_token: None,
            local_host: DEFAULT_LOCAL_HOST.to_string(),
            local_port: 0,
            public_port: 0,
            custom_domain: None,
            auto_reconnect: true,
            resilience: ResilienceConfig::default(),
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
        }
    }
}
