//! Client subcommand implementation

use anyhow::{Context, Result};
use clap::Args;
use portico::{Client, ResilienceConfig};
use portico_observability::LogFormat;
use std::time::Duration;
use tracing::{error, info};

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Broker control channel address (host:port)
    #[arg(long, env = "PORTICO_SERVER")]
    server: String,

    /// Authentication token
    #[arg(long, env = "PORTICO_TOKEN")]
    token: Option<String>,

    /// Prompt for the token on the terminal instead of passing it on the command line
    #[arg(long, conflicts_with = "token")]
    ask_token: bool,

    /// Host of the local service
    #[arg(long, default_value = "127.0.0.1", env = "PORTICO_LOCAL_HOST")]
    local_host: String,

    /// Port of the local service
    #[arg(long, env = "PORTICO_LOCAL_PORT")]
    local_port: u32,

    /// Public port to request from the broker
    #[arg(long, env = "PORTICO_PUBLIC_PORT")]
    public_port: u32,

    /// Hostname to claim on the broker
    #[arg(long, env = "PORTICO_CUSTOM_DOMAIN")]
    custom_domain: Option<String>,

    /// Seconds between reconnection attempts
    #[arg(long, default_value_t = 5, env = "PORTICO_RECONNECT_DELAY")]
    reconnect_delay: u64,

    /// Multiply the delay by this after each failed attempt (1.0 keeps it fixed)
    #[arg(long, default_value_t = 1.0, env = "PORTICO_BACKOFF_FACTOR")]
    backoff_factor: f64,

    /// Upper bound for the reconnection delay in seconds
    #[arg(long, default_value_t = 60, env = "PORTICO_MAX_RECONNECT_DELAY")]
    max_reconnect_delay: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format: pretty or json
    #[arg(long, default_value = "pretty", env = "PORTICO_LOG_FORMAT")]
    log_format: LogFormat,
}

/// Prompt for token on TTY without echoing (secure input).
fn prompt_token() -> Result<String> {
    rpassword::prompt_password("Token: ").context(
        "Could not read token from terminal (is stdin a TTY?). Set PORTICO_TOKEN or pass --token",
    )
}

pub async fn run(args: ClientArgs) -> Result<()> {
    super::init_logging(args.log_format, &args.log_level)?;

    info!("Starting Portico client v{}", env!("CARGO_PKG_VERSION"));

    let token = if args.ask_token {
        Some(prompt_token()?)
    } else {
        args.token
    };

    let mut builder = Client::builder()
        .server_addr(args.server)
        .local_host(args.local_host)
        .local_port(args.local_port)
        .public_port(args.public_port)
        .resilience(ResilienceConfig {
            reconnect_base: Duration::from_secs(args.reconnect_delay),
            reconnect_max: Duration::from_secs(args.max_reconnect_delay),
            factor: args.backoff_factor,
            jitter_factor: 0.0,
        });
    if let Some(token) = token {
        builder = builder.token(token);
    }
    if let Some(domain) = args.custom_domain {
        builder = builder.custom_domain(domain);
    }
    let mut client = builder.build()?;

    match client.start().await {
        Ok(info) => info!(
            "Tunnel {} live on public port {}",
            info.tunnel_id, info.public_port
        ),
        Err(e) => error!("First session failed: {}; retrying in the background", e),
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    client.shutdown().await?;
    Ok(())
}
