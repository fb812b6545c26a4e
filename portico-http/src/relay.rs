//! Routing and forwarding of one public request through a tunnel

use crate::ingress::parse_and_normalize_host;
use crate::proxy::LocalForwarder;
use bytes::Bytes;
use portico_common::{RelayConfig, TunnelError};
use portico_core::registry::{Route, TunnelRegistry};
use portico_core::ControlConnection;
use portico_protocol::frame::{RequestFrame, ResponseFrame};
use hyper::StatusCode;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

/// Request headers that never cross the tunnel
pub const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "keep-alive",
    "transfer-encoding",
];

/// Relay failures, each with a fixed public status code
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("tunnel not found: {0}")]
    TunnelNotFound(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),

    #[error("upstream error: {0}")]
    UpstreamError(String),

    #[error("request too large: {0}")]
    RequestTooLarge(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::TunnelNotFound(_) => StatusCode::NOT_FOUND,
            RelayError::UpstreamUnavailable(_) | RelayError::UpstreamError(_) => {
                StatusCode::BAD_GATEWAY
            }
            RelayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RelayError::RequestTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            RelayError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

type UpstreamFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RelayError>> + Send + 'a>>;

/// Where a resolved tunnel's traffic actually goes
pub trait Upstream: Send + Sync {
    /// Cheap reachability check run before forwarding
    fn probe(&self) -> UpstreamFuture<'_, ()>;

    /// Deliver the request and return the local service's response
    fn forward(&self, request: RequestFrame) -> UpstreamFuture<'_, ResponseFrame>;
}

/// Through the owning client's control connection
pub struct ChannelUpstream {
    connection: Arc<ControlConnection>,
}

impl ChannelUpstream {
    pub fn new(connection: Arc<ControlConnection>) -> Self {
        Self { connection }
    }
}

impl Upstream for ChannelUpstream {
    fn probe(&self) -> UpstreamFuture<'_, ()> {
        Box::pin(async move {
            match self.connection.probe().await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(reason)) => Err(RelayError::UpstreamUnavailable(format!(
                    "local service unreachable: {reason}"
                ))),
                Err(e) => Err(RelayError::UpstreamUnavailable(channel_failure(&e))),
            }
        })
    }

    fn forward(&self, request: RequestFrame) -> UpstreamFuture<'_, ResponseFrame> {
        Box::pin(async move {
            let response = self.connection.forward(request).await.map_err(|e| match e {
                e @ TunnelError::FrameTooLarge { .. } => RelayError::RequestTooLarge(e.to_string()),
                other => RelayError::UpstreamError(channel_failure(&other)),
            })?;
            // The client could not reach its local service
            match response.error {
                Some(reason) => Err(RelayError::UpstreamError(reason)),
                None => Ok(response),
            }
        })
    }
}

fn channel_failure(e: &TunnelError) -> String {
    match e {
        TunnelError::ConnectionClosed(_) => "control connection closed".to_string(),
        other => other.to_string(),
    }
}

/// The broker dials the local port itself (admin created tunnels)
pub struct DirectUpstream {
    forwarder: LocalForwarder,
}

impl DirectUpstream {
    pub fn new(forwarder: LocalForwarder) -> Self {
        Self { forwarder }
    }
}

impl Upstream for DirectUpstream {
    fn probe(&self) -> UpstreamFuture<'_, ()> {
        Box::pin(async move {
            self.forwarder
                .probe()
                .await
                .map_err(|e| RelayError::UpstreamUnavailable(e.to_string()))
        })
    }

    fn forward(&self, request: RequestFrame) -> UpstreamFuture<'_, ResponseFrame> {
        Box::pin(async move {
            self.forwarder
                .forward(&request)
                .await
                .map_err(|e| RelayError::UpstreamError(e.to_string()))
        })
    }
}

/// A public request after body collection
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub method: String,
    /// Path plus query, as received
    pub path: String,
    pub host: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// How a public request was matched to a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteKey {
    /// Host header names a claimed domain; path is forwarded unchanged
    Domain(String),
    /// Leading numeric path segment; the rest of the path is forwarded
    PublicPort { port: u32, forward_path: String },
}

/// Split `/9000/status?x=1` into `(9000, "/status?x=1")`.
///
/// Returns `None` when the first segment is not a decimal number.
pub fn split_port_prefix(path: &str) -> Option<(u32, String)> {
    let rest = path.strip_prefix('/')?;
    let end = rest.find(['/', '?']).unwrap_or(rest.len());
    let segment = &rest[..end];
    if segment.is_empty() || segment.len() > 5 || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let port: u32 = segment.parse().ok()?;

    let remainder = &rest[end..];
    let forward_path = if remainder.starts_with('/') {
        remainder.to_string()
    } else {
        format!("/{remainder}")
    };
    Some((port, forward_path))
}

/// Keep every header except the transport level ones
pub fn forwardable_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            !STRIPPED_REQUEST_HEADERS
                .iter()
                .any(|stripped| name.eq_ignore_ascii_case(stripped))
        })
        .cloned()
        .collect()
}

/// The request pipeline: route, resolve, probe, forward
pub struct Relay {
    registry: Arc<TunnelRegistry>,
    config: RelayConfig,
    max_request_body: usize,
}

impl Relay {
    pub fn new(registry: Arc<TunnelRegistry>, config: RelayConfig) -> Self {
        Self {
            registry,
            config,
            max_request_body: portico_common::LimitsConfig::default().max_request_body,
        }
    }

    #[must_use]
    pub fn with_max_request_body(mut self, max: usize) -> Self {
        self.max_request_body = max;
        self
    }

    pub fn max_request_body(&self) -> usize {
        self.max_request_body
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Match a request to a tunnel without touching the upstream
    pub fn resolve(&self, host: Option<&str>, path: &str) -> Result<(Route, RouteKey), RelayError> {
        if let Some(domain) = host.and_then(|h| parse_and_normalize_host(h).ok()) {
            if let Some(route) = self.registry.route_by_domain(&domain) {
                return Ok((route, RouteKey::Domain(domain)));
            }
        }

        let Some((port, forward_path)) = split_port_prefix(path) else {
            return Err(RelayError::TunnelNotFound(format!(
                "no tunnel for host {} and path {path}",
                host.unwrap_or("-")
            )));
        };
        let missing = || RelayError::TunnelNotFound(format!("no tunnel for public port {port}"));
        let public_port = u16::try_from(port).map_err(|_| missing())?;
        let route = self
            .registry
            .route_by_public_port(public_port)
            .map_err(|_| missing())?;
        Ok((route, RouteKey::PublicPort { port, forward_path }))
    }

    fn upstream_for(&self, route: &Route) -> Box<dyn Upstream> {
        match &route.connection {
            Some(connection) => Box::new(ChannelUpstream::new(Arc::clone(connection))),
            None => Box::new(DirectUpstream::new(LocalForwarder::new(
                self.config.static_upstream_host.clone(),
                route.tunnel.local_port,
            ))),
        }
    }

    /// Run the full pipeline for one request
    pub async fn relay(&self, request: RelayRequest) -> Result<ResponseFrame, RelayError> {
        if request.body.len() > self.max_request_body {
            return Err(RelayError::RequestTooLarge(format!(
                "body exceeds {} bytes",
                self.max_request_body
            )));
        }

        let (route, key) = self.resolve(request.host.as_deref(), &request.path)?;
        let forward_path = match key {
            RouteKey::Domain(_) => request.path.clone(),
            RouteKey::PublicPort { forward_path, .. } => forward_path,
        };
        debug!(
            "{} {} -> tunnel {} as {}",
            request.method, request.path, route.tunnel.tunnel_id, forward_path
        );

        let upstream = self.upstream_for(&route);

        if self.config.probe_enabled {
            match tokio::time::timeout(self.config.probe_timeout, upstream.probe()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Tunnel {} failed liveness probe: {}", route.tunnel.tunnel_id, e);
                    return Err(e);
                }
                Err(_) => {
                    return Err(RelayError::UpstreamUnavailable(format!(
                        "liveness probe timed out after {:?}",
                        self.config.probe_timeout
                    )))
                }
            }
        }

        let frame = RequestFrame {
            request_id: 0,
            method: request.method,
            path: forward_path,
            headers: forwardable_headers(&request.headers),
            body: request.body,
        };

        match tokio::time::timeout(self.config.forward_timeout, upstream.forward(frame)).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::UpstreamTimeout(format!(
                "no response within {:?}",
                self.config.forward_timeout
            ))),
        }
    }
}
