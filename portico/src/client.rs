//! Embeddable client agent with builder pattern.
//!
//! # Example
//!
//! ```rust,no_run
//! use portico::Client;
//!
//! # async fn example() -> portico::Result<()> {
//! let mut client = Client::builder()
//!     .server_addr("tunnel.example.com:7835")
//!     .token("my-secret-token")
//!     .local_port(3000)
//!     .public_port(9000)
//!     .build()?;
//!
//! let info = client.start().await?;
//! println!("Exposed on public port {}", info.public_port);
//! # Ok(())
//! # }
//! ```

use crate::config::ClientConfig;
use portico_common::{ResilienceConfig, Result, TunnelError};
use portico_core::reconnect::{Backoff, BackoffConfig};
use portico_core::{Registration, TunnelClient, TunnelInfo};
use portico_http::{LocalExecutor, LocalForwarder};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A client agent that can be embedded in your application.
///
/// Use [`Client::builder()`] to create one.
#[derive(Debug)]
pub struct Client {
    config: ClientConfig,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

/// Builder for constructing a [`Client`].
#[derive(Debug, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Start the supervisor and wait for the first registration exchange.
    ///
    /// Returns the registered tunnel, or the error that ended the first
    /// session. Either way the supervisor keeps reconnecting in the
    /// background until [`shutdown()`](Self::shutdown), unless
    /// `auto_reconnect` is off.
    pub async fn start(&mut self) -> Result<TunnelInfo> {
        if self.task.is_some() {
            return Err(TunnelError::InvalidState("client already started".into()));
        }

        let local_port = u16::try_from(self.config.local_port)
            .map_err(|_| TunnelError::Config("local_port out of range".into()))?;
        let executor = LocalExecutor::new(LocalForwarder::new(
            self.config.local_host.clone(),
            local_port,
        ));

        let mut tunnel_client = TunnelClient::new(
            self.config.server_addr.clone(),
            Registration {
                local_port: self.config.local_port,
                public_port: self.config.public_port,
                custom_domain: self.config.custom_domain.clone(),
            },
            Arc::new(executor),
        )
        .with_heartbeat_interval(self.config.heartbeat_interval);
        if let Some(token) = &self.config.auth_token {
            tunnel_client = tunnel_client.with_auth_token(token.clone());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        self.task = Some(tokio::spawn(supervise(
            tunnel_client,
            BackoffConfig::from(self.config.resilience.clone()),
            self.config.auto_reconnect,
            shutdown_rx,
            outcome_tx,
        )));

        outcome_rx
            .await
            .map_err(|_| TunnelError::Connection("client stopped before connecting".into()))?
    }

    /// Stop the supervisor and wait for it to finish.
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        Ok(())
    }

    /// Signal the supervisor to stop (non-blocking).
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // Best-effort signal shutdown on drop
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
    }
}

/// Resolves once `true` is sent or the sender is gone
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Run sessions back to back, sleeping the backoff delay in between
async fn supervise(
    client: TunnelClient,
    backoff: BackoffConfig,
    auto_reconnect: bool,
    mut shutdown: watch::Receiver<bool>,
    outcome: oneshot::Sender<Result<TunnelInfo>>,
) {
    let mut backoff = Backoff::new(backoff);
    let mut outcome = Some(outcome);

    loop {
        let mut registered = false;
        let result = tokio::select! {
            result = client.run_session(|info| {
                registered = true;
                if let Some(tx) = outcome.take() {
                    let _ = tx.send(Ok(info.clone()));
                }
            }) => result,
            () = shutdown_requested(&mut shutdown) => {
                info!("Client shutdown requested");
                break;
            }
        };

        if registered {
            backoff.reset();
        }
        match result {
            Ok(()) => info!("Session with {} ended", client.server_addr()),
            Err(e) => {
                warn!("Session with {} ended: {}", client.server_addr(), e);
                if let Some(tx) = outcome.take() {
                    let _ = tx.send(Err(e));
                }
            }
        }

        if !auto_reconnect {
            break;
        }

        let delay = backoff.next_delay();
        info!("Reconnecting in {:?} (attempt {})", delay, backoff.attempts());
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = shutdown_requested(&mut shutdown) => {
                info!("Client shutdown requested");
                break;
            }
        }
    }
}

impl ClientBuilder {
    /// Set the broker control channel address (`host:port`).
    #[must_use]
    pub fn server_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.server_addr = addr.into();
        self
    }

    /// Set the authentication token.
    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.auth_token = Some(token.into());
        self
    }

    /// Host of the local service.
    ///
    /// Default: `127.0.0.1`
    #[must_use]
    pub fn local_host(mut self, host: impl Into<String>) -> Self {
        self.config.local_host = host.into();
        self
    }

    #[must_use]
    pub fn local_port(mut self, port: u32) -> Self {
        self.config.local_port = port;
        self
    }

    #[must_use]
    pub fn public_port(mut self, port: u32) -> Self {
        self.config.public_port = port;
        self
    }

    #[must_use]
    pub fn custom_domain(mut self, domain: impl Into<String>) -> Self {
        self.config.custom_domain = Some(domain.into());
        self
    }

    /// Enable or disable automatic reconnection.
    ///
    /// Default: `true`
    #[must_use]
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.auto_reconnect = enabled;
        self
    }

    /// Use a fixed delay between reconnection attempts.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.resilience = ResilienceConfig {
            reconnect_base: delay,
            reconnect_max: delay,
            factor: 1.0,
            jitter_factor: 0.0,
        };
        self
    }

    /// Full reconnection policy, e.g. exponential backoff with a cap.
    #[must_use]
    pub fn resilience(mut self, resilience: ResilienceConfig) -> Self {
        self.config.resilience = resilience;
        self
    }

    /// Default: 30 seconds
    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Build the client with the configured options.
    pub fn build(self) -> Result<Client> {
        self.config.validate()?;
        Ok(Client {
            config: self.config,
            shutdown_tx: None,
            task: None,
        })
    }
}
