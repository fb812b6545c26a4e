pub mod client;
pub mod server;
pub mod session;

pub use client::{Registration, RequestExecutor, TunnelClient, TunnelInfo};
pub use server::ControlServer;
pub use session::{ControlConnection, Reply};
