//! Plain TCP transport for the control channel
//!
//! TLS is expected to terminate in front of the broker.

use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Disable Nagle; control frames are small and latency bound.
pub fn configure_socket(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY: {}", e);
    }
}

pub async fn connect(addr: &str) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    configure_socket(&stream);
    Ok(stream)
}

pub async fn accept(listener: &TcpListener) -> io::Result<(TcpStream, SocketAddr)> {
    let (stream, addr) = listener.accept().await?;
    configure_socket(&stream);
    Ok((stream, addr))
}
