//! Embeddable broker with builder pattern.
//!
//! # Example
//!
//! ```rust,no_run
//! use portico::Server;
//!
//! # async fn example() -> portico::Result<()> {
//! let server = Server::builder()
//!     .control_bind("0.0.0.0:7835".parse().unwrap())
//!     .http_bind("0.0.0.0:8080".parse().unwrap())
//!     .token("my-secret-token")
//!     .build()?;
//!
//! let running = server.start().await?;
//! println!("relay on {}", running.http_addr());
//! running.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::ServerConfig;
use portico_common::{LimitsConfig, RelayConfig, Result, TunnelError};
use portico_core::resource_limits::ServerResourceLimits;
use portico_core::{ControlServer, TunnelRegistry};
use portico_http::{AdminServer, AdminState, BearerTokenAuthorizer, HttpIngress, Relay};
use portico_protocol::{Frame, ValidationLimits};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

const SHUTDOWN_NOTICE: &str = "broker is shutting down";

/// A broker that can be embedded in your application.
///
/// Use [`Server::builder()`] to create one.
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    registry: Arc<TunnelRegistry>,
}

/// Builder for constructing a [`Server`].
#[derive(Debug, Default)]
pub struct ServerBuilder {
    config: ServerConfig,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// The registry shared by every listener of this server
    pub fn registry(&self) -> Arc<TunnelRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind every listener and start serving in the background.
    ///
    /// Binding happens before this returns, so port 0 binds can be read back
    /// from the returned handle.
    pub async fn start(self) -> Result<RunningServer> {
        let config = self.config;
        let registry = self.registry;

        let control_listener = TcpListener::bind(config.control_bind).await?;
        let http_listener = TcpListener::bind(config.http_bind).await?;
        let admin_listener = match config.admin_bind {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };

        let control_addr = control_listener.local_addr()?;
        let http_addr = http_listener.local_addr()?;
        let admin_addr = match &admin_listener {
            Some(listener) => Some(listener.local_addr()?),
            None => None,
        };

        info!("Starting Portico broker");
        info!("  Control bind: {}", control_addr);
        info!("  HTTP bind: {}", http_addr);
        match admin_addr {
            Some(addr) => info!("  Admin bind: {}", addr),
            None => info!("  Admin API disabled"),
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        let mut control = ControlServer::new(control_addr, Arc::clone(&registry))
            .with_resource_limits(ServerResourceLimits::new(config.limits.max_connections))
            .with_validation_limits(validation_limits(&config.limits))
            .with_max_frame_size(max_frame_size(&config.limits))
            .with_handshake_timeout(config.handshake_timeout)
            .with_shutdown(shutdown_rx);
        if let Some(token) = &config.auth_token {
            control = control.with_auth_token(token.clone());
        }
        tasks.spawn(control.serve(control_listener));

        let relay = Relay::new(Arc::clone(&registry), config.relay.clone())
            .with_max_request_body(config.limits.max_request_body);
        let ingress = HttpIngress::with_max_connections(
            http_addr,
            Arc::new(relay),
            config.limits.max_http_connections,
        );
        tasks.spawn(ingress.serve(http_listener));

        if let (Some(listener), Some(addr), Some(token)) =
            (admin_listener, admin_addr, config.admin_token.as_deref())
        {
            let state = Arc::new(AdminState {
                registry: Arc::clone(&registry),
                authorizer: Arc::new(BearerTokenAuthorizer::new(token)),
            });
            tasks.spawn(AdminServer::new(addr, state).serve(listener));
        }

        Ok(RunningServer {
            control_addr,
            http_addr,
            admin_addr,
            registry,
            shutdown_tx,
            tasks,
        })
    }

    /// Serve until Ctrl-C, then shut down
    pub async fn run(self) -> Result<()> {
        let mut running = self.start().await?;
        let result = tokio::select! {
            result = running.wait() => result,
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Shutdown signal received");
                Ok(())
            }
        };
        running.shutdown().await?;
        result
    }
}

fn validation_limits(limits: &LimitsConfig) -> ValidationLimits {
    ValidationLimits {
        max_headers: limits.max_headers,
        max_payload_bytes: max_frame_size(limits),
        ..ValidationLimits::default()
    }
}

fn max_frame_size(limits: &LimitsConfig) -> usize {
    usize::try_from(limits.max_frame_bytes).unwrap_or(usize::MAX)
}

/// Handle to a started broker
#[derive(Debug)]
pub struct RunningServer {
    control_addr: SocketAddr,
    http_addr: SocketAddr,
    admin_addr: Option<SocketAddr>,
    registry: Arc<TunnelRegistry>,
    shutdown_tx: watch::Sender<bool>,
    tasks: JoinSet<Result<()>>,
}

impl RunningServer {
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin_addr
    }

    pub fn registry(&self) -> Arc<TunnelRegistry> {
        Arc::clone(&self.registry)
    }

    /// Wait until one of the listeners stops, returning its error if any
    pub async fn wait(&mut self) -> Result<()> {
        match self.tasks.join_next().await {
            Some(Ok(result)) => result,
            Some(Err(e)) => Err(TunnelError::Connection(format!("listener task failed: {e}"))),
            None => Ok(()),
        }
    }

    /// Tell every client the broker is going away, then stop all listeners
    /// and close every control connection.
    pub async fn shutdown(mut self) -> Result<()> {
        let report = self.registry.broadcast(&Frame::Notice {
            message: SHUTDOWN_NOTICE.to_string(),
        });
        info!(
            "Shutting down: notified {} client(s), {} unreachable",
            report.delivered,
            report.failed.len()
        );
        for id in &report.failed {
            warn!("Shutdown notice not delivered to {}", id);
        }

        let _ = self.shutdown_tx.send(true);
        self.tasks.shutdown().await;

        // Connection tasks close on their own once they see the signal
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while self.registry.connection_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        // Best-effort signal shutdown on drop
        let _ = self.shutdown_tx.send(true);
    }
}

impl ServerBuilder {
    /// Set the control channel address.
    ///
    /// Default: `0.0.0.0:7835`
    #[must_use]
    pub fn control_bind(mut self, addr: SocketAddr) -> Self {
        self.config.control_bind = addr;
        self
    }

    /// Set the public relay address.
    ///
    /// Default: `0.0.0.0:8080`
    #[must_use]
    pub fn http_bind(mut self, addr: SocketAddr) -> Self {
        self.config.http_bind = addr;
        self
    }

    /// Enable the admin API on `addr`. Requires [`admin_token`](Self::admin_token).
    #[must_use]
    pub fn admin_bind(mut self, addr: SocketAddr) -> Self {
        self.config.admin_bind = Some(addr);
        self
    }

    /// Require clients to present this token.
    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.auth_token = Some(token.into());
        self
    }

    /// Bearer token accepted by the admin API.
    #[must_use]
    pub fn admin_token(mut self, token: impl Into<String>) -> Self {
        self.config.admin_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn relay(mut self, relay: RelayConfig) -> Self {
        self.config.relay = relay;
        self
    }

    /// Default: 10 seconds
    #[must_use]
    pub fn forward_timeout(mut self, timeout: Duration) -> Self {
        self.config.relay.forward_timeout = timeout;
        self
    }

    /// Enable or disable the liveness probe before each forward.
    ///
    /// Default: `true`
    #[must_use]
    pub fn probe(mut self, enabled: bool) -> Self {
        self.config.relay.probe_enabled = enabled;
        self
    }

    /// Host dialed for tunnels created through the admin API.
    ///
    /// Default: `127.0.0.1`
    #[must_use]
    pub fn static_upstream_host(mut self, host: impl Into<String>) -> Self {
        self.config.relay.static_upstream_host = host.into();
        self
    }

    #[must_use]
    pub fn limits(mut self, limits: LimitsConfig) -> Self {
        self.config.limits = limits;
        self
    }

    /// Default: 10 seconds
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Build the server with the configured options.
    pub fn build(self) -> Result<Server> {
        self.config.validate()?;
        Ok(Server {
            config: self.config,
            registry: Arc::new(TunnelRegistry::new()),
        })
    }
}
