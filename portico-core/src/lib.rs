pub mod auth;
pub mod reconnect;
pub mod registry;
pub mod resource_limits;
pub mod transport;
pub mod tunnel;

// Re-export specific items for convenience
pub use registry::{BroadcastReport, Owner, RegistrationError, Route, Tunnel, TunnelRegistry};
pub use tunnel::client::{Registration, RequestExecutor, TunnelClient, TunnelInfo};
pub use tunnel::server::ControlServer;
pub use tunnel::session::ControlConnection;
