#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Integration tests for Portico
//!
//! These tests run a real broker on loopback ports and drive it through the
//! client agent, raw control frames and public HTTP requests.

mod admin_test;
mod error_test;
mod multi_client_test;
mod protocol_test;
mod tunnel_test;

use portico::{Client, RunningServer, Server, ServerBuilder};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::sleep;

pub const TOKEN: &str = "test-secret-token";
pub const ADMIN_TOKEN: &str = "test-admin-token";

static NEXT_PORT: std::sync::atomic::AtomicU16 = std::sync::atomic::AtomicU16::new(30000);

pub fn get_free_port() -> u16 {
    use std::sync::atomic::Ordering;
    loop {
        let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);
        if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return port;
        }
    }
}

pub fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// Start a broker on ephemeral loopback ports with the client token set
pub async fn start_server(configure: impl FnOnce(ServerBuilder) -> ServerBuilder) -> RunningServer {
    let builder = Server::builder()
        .control_bind(loopback())
        .http_bind(loopback())
        .token(TOKEN);
    configure(builder)
        .build()
        .expect("Failed to build server")
        .start()
        .await
        .expect("Failed to start server")
}

/// Connect a client agent exposing `local_port` as `public_port`
pub async fn start_client(server: &RunningServer, local_port: u16, public_port: u16) -> Client {
    let mut client = Client::builder()
        .server_addr(server.control_addr().to_string())
        .token(TOKEN)
        .local_port(u32::from(local_port))
        .public_port(u32::from(public_port))
        .reconnect_delay(Duration::from_millis(100))
        .build()
        .expect("Failed to build client");
    client.start().await.expect("Client failed to register");
    client
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// A port nothing listens on
pub fn dead_port() -> u16 {
    get_free_port()
}

/// Start a local HTTP service that answers 201 with the request head as body
pub async fn start_echo_server() -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind(loopback())
        .await
        .expect("Failed to bind echo server");
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        loop {
            if let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut buf = [0u8; 4096];
                    loop {
                        let n = socket.read(&mut buf).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        head.extend_from_slice(&buf[..n]);
                        if head.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let body = String::from_utf8_lossy(&head).to_string();
                    let response = format!(
                        "HTTP/1.1 201 Created\r\n\
                         Content-Type: text/plain\r\n\
                         X-Local: yes\r\n\
                         Content-Length: {}\r\n\
                         Connection: close\r\n\
                         \r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        }
    });
    (port, handle)
}

/// Start a local HTTP service that reads the whole body and answers with its length
pub async fn start_sink_server() -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind(loopback())
        .await
        .expect("Failed to bind sink server");
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        loop {
            if let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut received = Vec::new();
                    let mut buf = [0u8; 16 * 1024];
                    let head_end = loop {
                        let n = socket.read(&mut buf).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        received.extend_from_slice(&buf[..n]);
                        if let Some(pos) = received.windows(4).position(|w| w == b"\r\n\r\n") {
                            break pos + 4;
                        }
                    };
                    let head = String::from_utf8_lossy(&received[..head_end]).to_lowercase();
                    let content_length = head
                        .lines()
                        .find_map(|line| line.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);

                    let mut body_len = received.len() - head_end;
                    while body_len < content_length {
                        let n = socket.read(&mut buf).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        body_len += n;
                    }

                    let body = body_len.to_string();
                    let response = format!(
                        "HTTP/1.1 200 OK\r\n\
                         Content-Type: text/plain\r\n\
                         Content-Length: {}\r\n\
                         Connection: close\r\n\
                         \r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        }
    });
    (port, handle)
}

/// Start a local service that accepts connections and never answers
pub async fn start_silent_server() -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind(loopback())
        .await
        .expect("Failed to bind silent server");
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    (port, handle)
}

/// Create a reqwest client configured for testing (no proxy, direct connection)
pub fn make_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(15))
        .build()
        .expect("Failed to build reqwest client")
}
