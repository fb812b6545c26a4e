use crate::relay::{Relay, RelayError, RelayRequest};
use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use portico_common::Result;
use portico_protocol::frame::{header_value_from_wire, header_value_to_wire, ResponseFrame};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Response headers owned by the public connection, not the local service
const HOP_BY_HOP_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "content-length",
];

/// Pause after a failed accept, e.g. when the process is out of descriptors
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Public HTTP/1.1 entry point of the relay
pub struct HttpIngress {
    addr: SocketAddr,
    relay: Arc<Relay>,
    connection_semaphore: Arc<Semaphore>,
}

impl HttpIngress {
    pub fn new(addr: SocketAddr, relay: Arc<Relay>) -> Self {
        Self::with_max_connections(
            addr,
            relay,
            portico_common::LimitsConfig::default().max_http_connections,
        )
    }

    pub fn with_max_connections(addr: SocketAddr, relay: Arc<Relay>, max: usize) -> Self {
        Self {
            addr,
            relay,
            connection_semaphore: Arc::new(Semaphore::new(max)),
        }
    }

    pub async fn start(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener).await
    }

    /// Accept loop on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!("HTTP ingress listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer_addr) = accept_retrying(|| listener.accept()).await;

            let Ok(permit) = self.connection_semaphore.clone().try_acquire_owned() else {
                warn!(
                    "Max connections reached, rejecting connection from {}",
                    peer_addr
                );
                drop(stream);
                continue;
            };

            let io = TokioIo::new(stream);
            let relay = self.relay.clone();

            tokio::spawn(async move {
                let _permit = permit;

                if let Err(err) = http1::Builder::new()
                    .serve_connection(
                        io,
                        service_fn(move |req| handle_request(req, relay.clone())),
                    )
                    .await
                {
                    debug!("Error serving connection from {}: {:?}", peer_addr, err);
                }
            });
        }
    }
}

/// Keep calling `accept` until it yields a connection; errors are logged
async fn accept_retrying<F, Fut, T>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                error!("Failed to accept public connection: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

async fn handle_request(
    req: Request<Incoming>,
    relay: Arc<Relay>,
) -> std::result::Result<Response<BoxBody>, hyper::Error> {
    let (parts, body) = req.into_parts();

    let host = parts
        .headers
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);
    let path = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), ToString::to_string);
    let headers = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                header_value_to_wire(value.as_bytes()),
            )
        })
        .collect();

    let body = match collect_body_with_limit(body, relay.max_request_body()).await {
        Ok(bytes) => bytes,
        Err(BodyLimitError::TooLarge) => {
            let err = RelayError::RequestTooLarge(format!(
                "body exceeds {} bytes",
                relay.max_request_body()
            ));
            return Ok(error_response(&err));
        }
        Err(BodyLimitError::Read) => {
            return Ok(full_response(
                StatusCode::BAD_REQUEST,
                "bad request: error reading request body",
            ));
        }
    };

    let request = RelayRequest {
        method: parts.method.to_string(),
        path,
        host,
        headers,
        body,
    };
    let method = request.method.clone();
    let path = request.path.clone();

    match relay.relay(request).await {
        Ok(response) => {
            debug!("{} {} -> {}", method, path, response.status);
            Ok(relay_response(response))
        }
        Err(err) => {
            match &err {
                RelayError::TunnelNotFound(_) => debug!("{} {}: {}", method, path, err),
                RelayError::InternalError(_) => error!("{} {}: {}", method, path, err),
                _ => warn!("{} {}: {}", method, path, err),
            }
            Ok(error_response(&err))
        }
    }
}

/// Build the public response from the local service's answer
fn relay_response(frame: ResponseFrame) -> Response<BoxBody> {
    let Ok(status) = StatusCode::from_u16(frame.status) else {
        let err = RelayError::InternalError(format!("invalid status code {}", frame.status));
        return error_response(&err);
    };

    let mut builder = Response::builder().status(status);
    for (name, value) in &frame.headers {
        if HOP_BY_HOP_RESPONSE_HEADERS
            .iter()
            .any(|h| name.eq_ignore_ascii_case(h))
        {
            continue;
        }
        let raw = header_value_from_wire(value).unwrap_or_else(|| value.as_bytes().to_vec());
        builder = builder.header(name.as_str(), raw);
    }
    builder.body(full_body(frame.body)).unwrap_or_else(|e| {
        error_response(&RelayError::InternalError(format!(
            "invalid response from local service: {e}"
        )))
    })
}

/// Plain text error body `<reason>: <detail>` with the error's status
pub fn error_response(err: &RelayError) -> Response<BoxBody> {
    full_response(err.status(), &err.to_string())
}

/// Parse and normalize a Host header value for routing.
/// Handles IPv6 addresses, port stripping, and case normalization.
pub(crate) fn parse_and_normalize_host(host: &str) -> std::result::Result<String, &'static str> {
    if host.is_empty() {
        return Err("Empty Host header");
    }

    let host = host.trim();

    // [::1]:8080 -> ::1
    let normalized = if host.starts_with('[') {
        if let Some(bracket_end) = host.find(']') {
            &host[1..bracket_end]
        } else {
            return Err("Invalid IPv6 Host header format");
        }
    } else if host.matches(':').count() > 1 {
        // IPv6 without brackets
        host
    } else {
        host.split(':').next().unwrap_or(host)
    };

    let normalized = normalized.to_lowercase();
    let normalized = normalized.strip_suffix('.').unwrap_or(&normalized);

    if normalized.is_empty() {
        return Err("Empty host after normalization");
    }

    Ok(normalized.to_string())
}

/// Why a body could not be collected
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BodyLimitError {
    #[error("body too large")]
    TooLarge,
    #[error("error reading body")]
    Read,
}

/// Collect a body, giving up as soon as it exceeds `max_size`
pub(crate) async fn collect_body_with_limit(
    mut body: Incoming,
    max_size: usize,
) -> std::result::Result<Bytes, BodyLimitError> {
    let mut collected = Vec::new();

    while let Some(frame_result) = body.frame().await {
        let Ok(frame) = frame_result else {
            return Err(BodyLimitError::Read);
        };

        if let Some(data) = frame.data_ref() {
            if collected.len() + data.len() > max_size {
                return Err(BodyLimitError::TooLarge);
            }
            collected.extend_from_slice(data);
        }
    }

    Ok(Bytes::from(collected))
}

fn full_response(status: StatusCode, body: &str) -> Response<BoxBody> {
    let mut response = Response::new(full_body(Bytes::copy_from_slice(body.as_bytes())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn full_body(bytes: Bytes) -> BoxBody {
    http_body_util::Full::new(bytes)
        .map_err(|never| match never {})
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use portico_common::RelayConfig;
    use portico_core::TunnelRegistry;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[test]
    fn test_parse_host_simple() {
        assert_eq!(parse_and_normalize_host("example.com").unwrap(), "example.com");
    }

    #[test]
    fn test_parse_host_with_port() {
        assert_eq!(
            parse_and_normalize_host("example.com:8080").unwrap(),
            "example.com"
        );
    }

    #[test]
    fn test_parse_host_uppercase() {
        assert_eq!(parse_and_normalize_host("EXAMPLE.COM").unwrap(), "example.com");
    }

    #[test]
    fn test_parse_host_trailing_dot() {
        assert_eq!(parse_and_normalize_host("example.com.").unwrap(), "example.com");
    }

    #[test]
    fn test_parse_host_ipv6() {
        assert_eq!(parse_and_normalize_host("[::1]:8080").unwrap(), "::1");
        assert!(parse_and_normalize_host("[::1").is_err());
    }

    #[test]
    fn test_parse_host_ipv4() {
        assert_eq!(
            parse_and_normalize_host("192.168.1.1:3000").unwrap(),
            "192.168.1.1"
        );
    }

    #[test]
    fn test_parse_host_empty() {
        assert!(parse_and_normalize_host("").is_err());
        assert!(parse_and_normalize_host(":80").is_err());
    }

    #[test]
    fn test_relay_response_drops_hop_by_hop_headers() {
        let frame = ResponseFrame {
            request_id: 1,
            status: 202,
            headers: vec![
                ("Transfer-Encoding".into(), "chunked".into()),
                ("connection".into(), "close".into()),
                ("content-length".into(), "999".into()),
                ("x-app".into(), "1".into()),
            ],
            body: Bytes::from_static(b"done"),
            error: None,
        };
        let response = relay_response(frame);
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers().get("x-app").unwrap(), "1");
        assert!(response.headers().get("transfer-encoding").is_none());
        assert!(response.headers().get("connection").is_none());
        assert!(response.headers().get("content-length").is_none());
    }

    #[test]
    fn test_relay_response_keeps_raw_header_bytes() {
        let frame = ResponseFrame {
            request_id: 1,
            status: 200,
            headers: vec![("x-name".into(), header_value_to_wire(b"caf\xe9"))],
            body: Bytes::new(),
            error: None,
        };
        let response = relay_response(frame);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-name").unwrap().as_bytes(), b"caf\xe9");
    }

    #[tokio::test]
    async fn test_accept_retrying_outlasts_errors() {
        let mut calls = 0;
        let accepted = accept_retrying(|| {
            calls += 1;
            let attempt = calls;
            async move {
                if attempt < 3 {
                    Err(io::Error::other("too many open files"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(accepted, 3);
    }

    #[test]
    fn test_relay_response_invalid_status() {
        let frame = ResponseFrame {
            request_id: 1,
            status: 1000,
            headers: vec![],
            body: Bytes::new(),
            error: None,
        };
        assert_eq!(
            relay_response(frame).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    async fn raw_request(addr: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    async fn spawn_ingress(max_request_body: usize) -> SocketAddr {
        let relay = Relay::new(Arc::new(TunnelRegistry::new()), RelayConfig::default())
            .with_max_request_body(max_request_body);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ingress = HttpIngress::new(addr, Arc::new(relay));
        tokio::spawn(ingress.serve(listener));
        addr
    }

    #[tokio::test]
    async fn test_unknown_tunnel_is_404() {
        let addr = spawn_ingress(1024).await;
        let response = raw_request(
            addr,
            "GET /9001/status HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 404"));
        assert!(response.ends_with("tunnel not found: no tunnel for public port 9001"));
    }

    #[tokio::test]
    async fn test_oversized_body_is_413() {
        let addr = spawn_ingress(4).await;
        let response = raw_request(
            addr,
            "POST /9000/ HTTP/1.1\r\nHost: localhost\r\nContent-Length: 10\r\nConnection: close\r\n\r\n0123456789",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 413"));
    }
}
