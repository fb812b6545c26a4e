use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Who keeps a tunnel alive
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Owner {
    /// Registered over a control connection; dies with it
    Connection(String),
    /// Created through the admin API; the broker dials the local port itself
    Static,
}

/// One active exposure of a local port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tunnel {
    pub tunnel_id: Uuid,
    pub local_port: u16,
    pub public_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_domain: Option<String>,
    pub created_at: DateTime<Utc>,
    pub owner: Owner,
}

impl Tunnel {
    /// The owning connection id, if the tunnel belongs to a client
    pub fn connection_id(&self) -> Option<&str> {
        match &self.owner {
            Owner::Connection(id) => Some(id),
            Owner::Static => None,
        }
    }

    pub fn is_static(&self) -> bool {
        self.owner == Owner::Static
    }
}
