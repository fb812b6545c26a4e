use crate::transport;
use portico_common::{Result, TunnelError};
use portico_protocol::codec::{encoded_len, is_encode_error, Decoded, TunnelCodec};
use portico_protocol::constants::{HEARTBEAT_INTERVAL_SECS, MAX_FRAME_SIZE, PROTOCOL_VERSION};
use portico_protocol::frame::{
    Frame, HelloStatus, RegisterStatus, RequestFrame, ResponseFrame,
};
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Executes relayed requests against the client's local service.
///
/// Futures are boxed so the executor can be shared as a trait object
/// across the per-request tasks.
pub trait RequestExecutor: Send + Sync {
    /// Run one request locally. Local failures are reported as a response,
    /// see [`ResponseFrame::failure`].
    fn execute(
        &self,
        request: RequestFrame,
    ) -> Pin<Box<dyn Future<Output = ResponseFrame> + Send + '_>>;

    /// Check that the local service accepts connections
    fn probe(&self) -> Pin<Box<dyn Future<Output = std::result::Result<(), String>> + Send + '_>>;
}

/// What the client asks the broker to expose
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub local_port: u32,
    pub public_port: u32,
    pub custom_domain: Option<String>,
}

/// A registered tunnel as seen by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    pub connection_id: String,
    pub tunnel_id: Uuid,
    pub public_port: u32,
    pub custom_domain: Option<String>,
}

/// Aborts the writer when the session future is dropped
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// One control channel session: connect, hello, register, serve
pub struct TunnelClient {
    server_addr: String,
    auth_token: Option<String>,
    registration: Registration,
    executor: Arc<dyn RequestExecutor>,
    heartbeat_interval: Duration,
    max_frame_size: usize,
}

impl TunnelClient {
    pub fn new(
        server_addr: impl Into<String>,
        registration: Registration,
        executor: Arc<dyn RequestExecutor>,
    ) -> Self {
        Self {
            server_addr: server_addr.into(),
            auth_token: None,
            registration,
            executor,
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            max_frame_size: MAX_FRAME_SIZE as usize,
        }
    }

    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    /// Run one session until the channel closes.
    ///
    /// `on_registered` fires once the broker accepted the tunnel. A refused
    /// registration ends the session with [`TunnelError::Registration`].
    pub async fn run_session<C>(&self, on_registered: C) -> Result<()>
    where
        C: FnOnce(&TunnelInfo),
    {
        let connection_id = Uuid::new_v4().simple().to_string();

        info!("Connecting to {}", self.server_addr);
        let stream = transport::connect(&self.server_addr).await?;
        let mut framed = Framed::new(stream, TunnelCodec::with_max_frame_size(self.max_frame_size));

        // 1. Hello
        debug!("Sending hello as {}", connection_id);
        framed
            .send(Frame::Hello {
                connection_id: connection_id.clone(),
                version: PROTOCOL_VERSION,
                token: self.auth_token.clone(),
            })
            .await?;

        match next_frame(&mut framed).await? {
            Frame::HelloAck {
                status: HelloStatus::Success,
            } => {
                info!("Connected to {} as {}", self.server_addr, connection_id);
            }
            Frame::HelloAck { status } => {
                error!("Hello rejected: {:?}", status);
                return Err(TunnelError::Authentication(format!(
                    "hello rejected: {status:?}"
                )));
            }
            other => {
                return Err(TunnelError::Protocol(format!(
                    "expected hello_ack, got {}",
                    other.type_name()
                )))
            }
        }

        // 2. Register
        let Registration {
            local_port,
            public_port,
            custom_domain,
        } = self.registration.clone();
        framed
            .send(Frame::Register {
                local_port,
                public_port,
                custom_domain: custom_domain.clone(),
            })
            .await?;

        let info = match next_frame(&mut framed).await? {
            Frame::RegisterResult {
                status: RegisterStatus::Success,
                tunnel_id: Some(tunnel_id),
                ..
            } => TunnelInfo {
                connection_id,
                tunnel_id,
                public_port,
                custom_domain,
            },
            Frame::RegisterResult { status, reason, .. } => {
                let reason = reason.unwrap_or_else(|| status.reason().to_string());
                error!("Tunnel registration failed: {}", reason);
                return Err(TunnelError::Registration(reason));
            }
            other => {
                return Err(TunnelError::Protocol(format!(
                    "expected register_result, got {}",
                    other.type_name()
                )))
            }
        };
        info!(
            "Tunnel {} registered: public port {} -> local port {}",
            info.tunnel_id, info.public_port, local_port
        );
        on_registered(&info);

        // 3. Serve
        self.serve(framed).await
    }

    async fn serve(&self, framed: Framed<TcpStream, TunnelCodec>) -> Result<()> {
        let (mut sink, mut stream) = framed.split();
        let (tx, mut rx) = mpsc::channel::<Frame>(256);

        let _writer = AbortOnDrop(tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let kind = frame.type_name();
                if let Err(e) = sink.send(frame).await {
                    if is_encode_error(&e) {
                        warn!("Dropped outbound {} frame: {}", kind, e);
                        continue;
                    }
                    debug!("Client writer stopped: {}", e);
                    break;
                }
            }
        }));

        let mut heartbeat =
            interval_at(Instant::now() + self.heartbeat_interval, self.heartbeat_interval);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    debug!("Sending heartbeat");
                    tx.send(Frame::Heartbeat { timestamp: now_millis() })
                        .await
                        .map_err(|_| TunnelError::Connection("writer closed".into()))?;
                }

                item = stream.next() => {
                    match item {
                        Some(Ok(Decoded::Frame(frame))) => self.dispatch(frame, &tx),
                        Some(Ok(Decoded::Malformed(e))) => {
                            warn!("Malformed frame from broker: {}", e);
                        }
                        Some(Err(e)) => {
                            error!("Control channel error: {}", e);
                            return Err(e.into());
                        }
                        None => {
                            info!("Connection closed by broker");
                            return Err(TunnelError::Connection("Connection closed".into()));
                        }
                    }
                }
            }
        }
    }

    fn dispatch(&self, frame: Frame, tx: &mpsc::Sender<Frame>) {
        match frame {
            Frame::Request(request) => {
                let executor = Arc::clone(&self.executor);
                let tx = tx.clone();
                let max_frame_size = self.max_frame_size;
                tokio::spawn(async move {
                    let request_id = request.request_id;
                    debug!("Executing {} {} ({})", request.method, request.path, request_id);
                    let response = executor.execute(*request).await;
                    let frame = bounded_response(response, max_frame_size);
                    if tx.send(frame).await.is_err() {
                        debug!("Dropped response {}: channel closed", request_id);
                    }
                });
            }
            Frame::Probe { probe_id } => {
                let executor = Arc::clone(&self.executor);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let outcome = executor.probe().await;
                    let frame = Frame::ProbeResult {
                        probe_id,
                        reachable: outcome.is_ok(),
                        error: outcome.err(),
                    };
                    if tx.send(frame).await.is_err() {
                        debug!("Dropped probe result {}: channel closed", probe_id);
                    }
                });
            }
            Frame::Heartbeat { timestamp } => {
                if tx.try_send(Frame::HeartbeatAck { timestamp }).is_err() {
                    debug!("Dropped heartbeat ack: outbound queue full or closed");
                }
            }
            Frame::HeartbeatAck { timestamp } => {
                debug!(
                    "Heartbeat ack received, round trip {} ms",
                    now_millis().saturating_sub(timestamp)
                );
            }
            Frame::Notice { message } => {
                info!("Broker notice: {}", message);
            }
            Frame::Error { code, message } => {
                warn!("Broker reported {:?}: {}", code, message);
            }
            other => {
                warn!("Ignoring unexpected {} frame", other.type_name());
            }
        }
    }
}

/// Wrap a response for the wire, swapping in a failure if it would not fit
fn bounded_response(response: ResponseFrame, max_frame_size: usize) -> Frame {
    let request_id = response.request_id;
    let frame = Frame::Response(Box::new(response));
    match encoded_len(&frame) {
        Ok(size) if size <= max_frame_size => frame,
        Ok(size) => {
            warn!(
                "Response {} is {} bytes, over the {} byte frame limit",
                request_id, size, max_frame_size
            );
            Frame::Response(Box::new(ResponseFrame::failure(
                request_id,
                format!("response of {size} bytes exceeds frame limit of {max_frame_size} bytes"),
            )))
        }
        Err(e) => Frame::Response(Box::new(ResponseFrame::failure(request_id, e.to_string()))),
    }
}

/// Next well-formed frame during the handshake, skipping notices and noise
async fn next_frame(framed: &mut Framed<TcpStream, TunnelCodec>) -> Result<Frame> {
    while let Some(item) = framed.next().await {
        match item? {
            Decoded::Frame(Frame::Notice { message }) => info!("Broker notice: {}", message),
            Decoded::Frame(Frame::Error { code, message }) => {
                warn!("Broker reported {:?}: {}", code, message);
            }
            Decoded::Frame(frame) => return Ok(frame),
            Decoded::Malformed(e) => warn!("Malformed frame from broker: {}", e),
        }
    }
    Err(TunnelError::Connection("Connection closed".into()))
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
