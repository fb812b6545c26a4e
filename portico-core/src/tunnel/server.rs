use crate::auth::token_matches;
use crate::registry::{RegistrationError, TunnelRegistry};
use crate::resource_limits::{ConnectionPermit, ServerResourceLimits};
use crate::transport;
use crate::tunnel::session::{ControlConnection, Reply};
use portico_common::{Result, TunnelError};
use portico_protocol::codec::{is_encode_error, Decoded, TunnelCodec};
use portico_protocol::constants::{HANDSHAKE_TIMEOUT_SECS, MAX_FRAME_SIZE, PROTOCOL_VERSION};
use portico_protocol::frame::{ErrorCode, Frame, HelloStatus, RegisterStatus};
use portico_protocol::validation::{validate_frame, ValidationError, ValidationLimits};
use portico_protocol::{ConnectionState, EnvelopeError, StateError};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// How long a closing connection may spend flushing queued frames
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

type ControlStream = SplitStream<Framed<TcpStream, TunnelCodec>>;

/// Accepts control connections and keeps the registry in step with them
pub struct ControlServer {
    addr: SocketAddr,
    registry: Arc<TunnelRegistry>,
    auth_token: Option<String>,
    resource_limits: ServerResourceLimits,
    validation: ValidationLimits,
    max_frame_size: usize,
    handshake_timeout: Duration,
    shutdown: Option<watch::Receiver<bool>>,
}

/// Per-server settings shared with every connection task
struct ConnectionContext {
    registry: Arc<TunnelRegistry>,
    auth_token: Option<String>,
    validation: ValidationLimits,
    max_frame_size: usize,
    handshake_timeout: Duration,
    shutdown: Option<watch::Receiver<bool>>,
}

/// Removes the connection and its tunnels from the registry however the
/// connection task ends, then fails whatever was still waiting on it.
struct DeregisterGuard {
    registry: Arc<TunnelRegistry>,
    connection: Arc<ControlConnection>,
}

impl Drop for DeregisterGuard {
    fn drop(&mut self) {
        self.registry.deregister(self.connection.id());
        self.connection.close();
    }
}

impl ControlServer {
    pub fn new(addr: SocketAddr, registry: Arc<TunnelRegistry>) -> Self {
        Self {
            addr,
            registry,
            auth_token: None,
            resource_limits: ServerResourceLimits::default(),
            validation: ValidationLimits::default(),
            max_frame_size: MAX_FRAME_SIZE as usize,
            handshake_timeout: Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            shutdown: None,
        }
    }

    /// Require clients to present this token in `hello`
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_resource_limits(mut self, limits: ServerResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    #[must_use]
    pub fn with_validation_limits(mut self, limits: ValidationLimits) -> Self {
        self.validation = limits;
        self
    }

    #[must_use]
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Stop accepting and close every connection once `true` is sent
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn registry(&self) -> Arc<TunnelRegistry> {
        Arc::clone(&self.registry)
    }

    /// Bind the configured address and serve forever
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!("Control channel listening on {}", listener.local_addr()?);

        let ctx = Arc::new(ConnectionContext {
            registry: self.registry,
            auth_token: self.auth_token,
            validation: self.validation,
            max_frame_size: self.max_frame_size,
            handshake_timeout: self.handshake_timeout,
            shutdown: self.shutdown.clone(),
        });

        loop {
            let accepted = tokio::select! {
                accepted = transport::accept(&listener) => accepted,
                () = shutdown_signal(self.shutdown.clone()) => {
                    info!("Control channel stopped accepting connections");
                    return Ok(());
                }
            };
            match accepted {
                Ok((stream, peer)) => {
                    let permit = match self.resource_limits.try_acquire_connection() {
                        Ok(permit) => permit,
                        Err(e) => {
                            warn!("Rejecting control connection from {}: {}", peer, e);
                            continue;
                        }
                    };

                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, ctx, permit).await {
                            warn!("Control connection error for {}: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ConnectionContext>,
    _permit: ConnectionPermit,
) -> Result<()> {
    let mut framed = Framed::new(stream, TunnelCodec::with_max_frame_size(ctx.max_frame_size));
    let mut state = ConnectionState::Connecting;

    // 1. Handshake
    let hello = match tokio::time::timeout(ctx.handshake_timeout, read_hello(&mut framed, peer)).await
    {
        Ok(Ok(Some(hello))) => hello,
        Ok(Ok(None)) => {
            debug!("{} closed before hello", peer);
            return Ok(());
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            warn!("No hello from {} within {:?}", peer, ctx.handshake_timeout);
            return Ok(());
        }
    };
    let Frame::Hello {
        connection_id,
        version,
        token,
    } = hello
    else {
        return Err(TunnelError::Protocol("Expected hello".into()));
    };

    if let Some(status) = check_hello(&ctx, &connection_id, version, token.as_deref()) {
        warn!("Rejecting hello from {}: {:?}", peer, status);
        framed.send(Frame::HelloAck { status }).await?;
        return Ok(());
    }

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE_DEPTH);
    let connection = Arc::new(
        ControlConnection::new(connection_id.clone(), peer, outbound_tx)
            .with_max_frame_size(ctx.max_frame_size),
    );

    if let Err(e) = ctx.registry.attach(Arc::clone(&connection)) {
        warn!("Rejecting hello from {}: {}", peer, e);
        framed
            .send(Frame::HelloAck {
                status: HelloStatus::ConnectionIdTaken,
            })
            .await?;
        return Ok(());
    }
    let guard = DeregisterGuard {
        registry: Arc::clone(&ctx.registry),
        connection: Arc::clone(&connection),
    };

    framed
        .send(Frame::HelloAck {
            status: HelloStatus::Success,
        })
        .await?;
    state
        .transition(ConnectionState::AwaitingRegistration)
        .map_err(state_error)?;
    info!("Control connection {} established from {}", connection_id, peer);

    // 2. Writer task drains the outbound queue
    let (mut sink, stream) = framed.split();
    let writer_id = connection_id.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let kind = frame.type_name();
            if let Err(e) = sink.send(frame).await {
                // A frame that cannot be encoded leaves the stream intact
                if is_encode_error(&e) {
                    warn!("Dropped {} frame for {}: {}", kind, writer_id, e);
                    continue;
                }
                debug!("Control writer for {} stopped: {}", writer_id, e);
                break;
            }
        }
    });

    let result = tokio::select! {
        result = process_messages(stream, &connection, &ctx, &mut state) => result,
        () = shutdown_signal(ctx.shutdown.clone()) => {
            debug!("Closing control connection {} for shutdown", connection_id);
            Ok(())
        }
    };

    let _ = state.transition(ConnectionState::Closed);
    drop(guard);
    drop(connection);
    // The writer ends once every queue handle is gone
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    info!("Control connection {} closed", connection_id);
    result
}

/// Resolves when shutdown is requested or its sender is gone; never without one
async fn shutdown_signal(shutdown: Option<watch::Receiver<bool>>) {
    let Some(mut rx) = shutdown else {
        return std::future::pending().await;
    };
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Wait for `hello`, answering anything else with an error frame
async fn read_hello(
    framed: &mut Framed<TcpStream, TunnelCodec>,
    peer: SocketAddr,
) -> Result<Option<Frame>> {
    while let Some(item) = framed.next().await {
        match item? {
            Decoded::Frame(frame @ Frame::Hello { .. }) => return Ok(Some(frame)),
            Decoded::Frame(other) => {
                warn!("Expected hello from {}, got {}", peer, other.type_name());
                framed
                    .send(Frame::Error {
                        code: ErrorCode::UnexpectedFrame,
                        message: format!("expected hello, got {}", other.type_name()),
                    })
                    .await?;
            }
            Decoded::Malformed(e) => {
                warn!("Malformed frame from {}: {}", peer, e);
                framed.send(malformed_reply(&e)).await?;
            }
        }
    }
    Ok(None)
}

/// Returns the rejection status, or `None` when the hello is acceptable
fn check_hello(
    ctx: &ConnectionContext,
    connection_id: &str,
    version: u8,
    token: Option<&str>,
) -> Option<HelloStatus> {
    if version != PROTOCOL_VERSION {
        return Some(HelloStatus::UnsupportedVersion);
    }
    let hello = Frame::Hello {
        connection_id: connection_id.to_string(),
        version,
        token: token.map(str::to_string),
    };
    match validate_frame(&hello, &ctx.validation) {
        Ok(()) => {}
        Err(ValidationError::TokenTooLong { .. }) => return Some(HelloStatus::InvalidToken),
        Err(_) => return Some(HelloStatus::InvalidConnectionId),
    }
    if !token_matches(ctx.auth_token.as_deref(), token) {
        return Some(HelloStatus::InvalidToken);
    }
    None
}

fn malformed_reply(e: &EnvelopeError) -> Frame {
    let code = match e {
        EnvelopeError::UnknownType(_) => ErrorCode::UnknownFrameType,
        EnvelopeError::Invalid { .. } => ErrorCode::InvalidFrame,
        _ => ErrorCode::MalformedFrame,
    };
    Frame::Error {
        code,
        message: e.to_string(),
    }
}

async fn process_messages(
    mut stream: ControlStream,
    connection: &Arc<ControlConnection>,
    ctx: &ConnectionContext,
    state: &mut ConnectionState,
) -> Result<()> {
    let id = connection.id().to_string();

    while let Some(item) = stream.next().await {
        let frame = match item? {
            Decoded::Frame(frame) => frame,
            Decoded::Malformed(e) => {
                warn!("Malformed frame on {}: {}", id, e);
                connection.send(malformed_reply(&e)).await?;
                continue;
            }
        };

        if let Err(e) = validate_frame(&frame, &ctx.validation) {
            warn!("Rejected {} frame on {}: {}", frame.type_name(), id, e);
            connection
                .send(Frame::Error {
                    code: ErrorCode::InvalidFrame,
                    message: e.to_string(),
                })
                .await?;
            continue;
        }

        match frame {
            Frame::Register {
                local_port,
                public_port,
                custom_domain,
            } => {
                let reply = register(
                    ctx,
                    &id,
                    state,
                    local_port,
                    public_port,
                    custom_domain.as_deref(),
                )?;
                connection.send(reply).await?;
            }
            Frame::Heartbeat { timestamp } => {
                debug!("Heartbeat {} from {}", timestamp, id);
                connection.send(Frame::HeartbeatAck { timestamp }).await?;
            }
            Frame::HeartbeatAck { .. } => {
                debug!("Heartbeat ack from {}", id);
            }
            Frame::Response(response) => {
                let request_id = response.request_id;
                if !connection.complete(request_id, Reply::Response(*response)) {
                    debug!("Late or unknown response {} on {}", request_id, id);
                }
            }
            Frame::ProbeResult {
                probe_id,
                reachable,
                error,
            } => {
                connection.complete(probe_id, Reply::Probe { reachable, error });
            }
            Frame::Error { code, message } => {
                warn!("Client {} reported {:?}: {}", id, code, message);
            }
            other => {
                warn!("Unexpected {} frame on {}", other.type_name(), id);
                connection
                    .send(Frame::Error {
                        code: ErrorCode::UnexpectedFrame,
                        message: format!("unexpected {} frame", other.type_name()),
                    })
                    .await?;
            }
        }
    }

    Ok(())
}

fn register(
    ctx: &ConnectionContext,
    connection_id: &str,
    state: &mut ConnectionState,
    local_port: u32,
    public_port: u32,
    custom_domain: Option<&str>,
) -> Result<Frame> {
    if *state == ConnectionState::Registered {
        warn!("Second register on {}", connection_id);
        return Ok(Frame::register_failure(RegisterStatus::AlreadyRegistered));
    }

    match ctx
        .registry
        .register(connection_id, local_port, public_port, custom_domain)
    {
        Ok(tunnel) => {
            state
                .transition(ConnectionState::Registered)
                .map_err(state_error)?;
            Ok(Frame::register_success(tunnel.tunnel_id))
        }
        Err(e) => {
            warn!("Registration on {} refused: {}", connection_id, e);
            match e.register_status() {
                Some(status) => Ok(Frame::register_failure(status)),
                None => Err(registration_to_tunnel_error(&e)),
            }
        }
    }
}

fn registration_to_tunnel_error(e: &RegistrationError) -> TunnelError {
    TunnelError::InvalidState(e.to_string())
}

fn state_error(e: StateError) -> TunnelError {
    TunnelError::InvalidState(e.to_string())
}
