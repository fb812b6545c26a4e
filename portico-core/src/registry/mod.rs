//! In-memory mapping from public identifiers to tunnels
//!
//! The registry owns every [`Tunnel`] and every live control connection
//! handle. Callers only ever see snapshots.

mod store;
mod tunnel;

pub use store::{BroadcastReport, Route, TunnelRegistry};
pub use tunnel::{Owner, Tunnel};

use portico_protocol::RegisterStatus;
use uuid::Uuid;

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("invalid port range: {0}")]
    InvalidPort(u32),

    #[error("port already in use: {0}")]
    PortInUse(u16),

    #[error("domain already in use: {0}")]
    DomainInUse(String),

    #[error("connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("tunnel already registered on connection {0}")]
    AlreadyRegistered(String),

    #[error("connection id already in use: {0}")]
    ConnectionIdTaken(String),

    #[error("tunnel not found: {0}")]
    NotFound(String),
}

impl RegistrationError {
    /// Status sent back in `register_result`, for errors a client can act on
    pub fn register_status(&self) -> Option<RegisterStatus> {
        match self {
            RegistrationError::InvalidPort(_) => Some(RegisterStatus::InvalidPort),
            RegistrationError::PortInUse(_) => Some(RegisterStatus::PortInUse),
            RegistrationError::DomainInUse(_) => Some(RegisterStatus::DomainInUse),
            RegistrationError::AlreadyRegistered(_) => Some(RegisterStatus::AlreadyRegistered),
            _ => None,
        }
    }

    pub(crate) fn tunnel_not_found(tunnel_id: Uuid) -> Self {
        RegistrationError::NotFound(format!("no tunnel with id {tunnel_id}"))
    }
}

/// Check that a port lies in 1..=65535
pub fn validate_port(port: u32) -> Result<u16, RegistrationError> {
    match u16::try_from(port) {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(RegistrationError::InvalidPort(port)),
    }
}
