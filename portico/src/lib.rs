//! # Portico
//!
//! A reverse-tunnel broker and client agent.
//!
//! A client behind NAT keeps one control connection open to the broker and
//! registers a mapping from a public port (or hostname) to one of its local
//! ports. Public HTTP requests reaching the broker are relayed down that
//! connection, executed against the local service by the client, and the
//! response is relayed back.
//!
//! ## Crates
//!
//! - `portico-common` - errors, configuration, defaults
//! - `portico-protocol` - control channel frames and codec
//! - `portico-core` - tunnel registry, control server, client session
//! - `portico-http` - public relay, local forwarder, admin API
//!
//! This crate wires them into an embeddable [`Server`] and [`Client`].

pub mod client;
pub mod config;
pub mod server;

pub use portico_common as common;
pub use portico_protocol as protocol;

pub use client::{Client, ClientBuilder};
pub use config::{ClientConfig, ServerConfig};
pub use server::{RunningServer, Server, ServerBuilder};

pub use common::{LimitsConfig, RelayConfig, ResilienceConfig, Result, TunnelError};
pub use portico_core::{Tunnel, TunnelInfo, TunnelRegistry};
pub use portico_http::RelayError;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::common::{Result, TunnelError};
    pub use crate::{Client, Server, TunnelInfo};
}
