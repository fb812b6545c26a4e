//! Common utilities and types for Portico

pub mod config;
pub mod constants;
pub mod error;

pub use config::{LimitsConfig, RelayConfig, ResilienceConfig};
pub use constants::{
    DEFAULT_ADMIN_BIND, DEFAULT_ADMIN_PORT, DEFAULT_CONTROL_BIND, DEFAULT_CONTROL_PORT,
    DEFAULT_HTTP_BIND, DEFAULT_HTTP_PORT, DEFAULT_LOCAL_HOST, DEFAULT_STATIC_UPSTREAM_HOST,
};
pub use error::{Result, TunnelError};
