//! Forwarding of relayed requests to a local TCP service

use crate::ingress::{collect_body_with_limit, BodyLimitError};
use bytes::Bytes;
use http_body_util::Full;
use hyper::client::conn::http1;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use portico_core::transport;
use portico_core::RequestExecutor;
use portico_protocol::frame::{
    header_value_from_wire, header_value_to_wire, RequestFrame, ResponseFrame,
};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Failure talking to the local service
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("local service unreachable at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("HTTP exchange with local service failed: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("local response body: {0}")]
    Body(BodyLimitError),
}

/// Issues relayed requests to `host:port` over a fresh HTTP/1.1 connection
#[derive(Debug, Clone)]
pub struct LocalForwarder {
    host: String,
    port: u16,
    connect_timeout: Duration,
    max_response_body: usize,
}

impl LocalForwarder {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(5),
            max_response_body: portico_common::LimitsConfig::default().max_response_body,
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_response_body(mut self, max: usize) -> Self {
        self.max_response_body = max;
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn connect(&self) -> Result<TcpStream, ForwardError> {
        let addr = self.addr();
        match tokio::time::timeout(self.connect_timeout, transport::connect(&addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ForwardError::Connect { addr, source }),
            Err(_) => Err(ForwardError::ConnectTimeout(addr)),
        }
    }

    /// TCP reachability of the local service
    pub async fn probe(&self) -> Result<(), ForwardError> {
        self.connect().await.map(drop)
    }

    pub async fn forward(&self, frame: &RequestFrame) -> Result<ResponseFrame, ForwardError> {
        let stream = self.connect().await?;
        let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!("Local connection closed with error: {:?}", err);
            }
        });

        let request = self.build_request(frame)?;
        let response = sender.send_request(request).await?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    header_value_to_wire(value.as_bytes()),
                )
            })
            .collect();
        let body = collect_body_with_limit(response.into_body(), self.max_response_body)
            .await
            .map_err(ForwardError::Body)?;

        Ok(ResponseFrame {
            request_id: frame.request_id,
            status,
            headers,
            body,
            error: None,
        })
    }

    fn build_request(&self, frame: &RequestFrame) -> Result<Request<Full<Bytes>>, ForwardError> {
        let method = Method::from_bytes(frame.method.as_bytes())
            .map_err(|_| ForwardError::InvalidRequest(format!("bad method {}", frame.method)))?;
        let path = if frame.path.is_empty() { "/" } else { &frame.path };

        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(hyper::header::HOST, self.addr());
        for (name, value) in &frame.headers {
            if name.eq_ignore_ascii_case("host") {
                continue;
            }
            let raw = header_value_from_wire(value).unwrap_or_else(|| value.as_bytes().to_vec());
            builder = builder.header(name.as_str(), raw);
        }
        builder
            .body(Full::new(frame.body.clone()))
            .map_err(|e| ForwardError::InvalidRequest(e.to_string()))
    }
}

/// Client side executor: relayed requests go to the agent's local service
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    forwarder: LocalForwarder,
}

impl LocalExecutor {
    pub fn new(forwarder: LocalForwarder) -> Self {
        Self { forwarder }
    }
}

impl RequestExecutor for LocalExecutor {
    fn execute(
        &self,
        request: RequestFrame,
    ) -> Pin<Box<dyn Future<Output = ResponseFrame> + Send + '_>> {
        Box::pin(async move {
            match self.forwarder.forward(&request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!("{} {} failed locally: {}", request.method, request.path, e);
                    ResponseFrame::failure(request.request_id, e.to_string())
                }
            }
        })
    }

    fn probe(&self) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>> {
        Box::pin(async move { self.forwarder.probe().await.map_err(|e| e.to_string()) })
    }
}
