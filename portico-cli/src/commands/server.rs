//! Server subcommand implementation

use anyhow::Result;
use clap::Args;
use portico::{LimitsConfig, RelayConfig, Server};
use portico_observability::LogFormat;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Control channel bind address
    #[arg(long, default_value = "0.0.0.0:7835", env = "PORTICO_CONTROL_BIND")]
    control_bind: SocketAddr,

    /// Public relay bind address
    #[arg(long, default_value = "0.0.0.0:8080", env = "PORTICO_HTTP_BIND")]
    http_bind: SocketAddr,

    /// Admin API bind address (only used with --admin-token)
    #[arg(long, default_value = "127.0.0.1:7836", env = "PORTICO_ADMIN_BIND")]
    admin_bind: SocketAddr,

    /// Token clients must present. If omitted, any client may connect.
    #[arg(long, env = "PORTICO_TOKEN")]
    token: Option<String>,

    /// Bearer token for the admin API. The admin API is off without it.
    #[arg(long, env = "PORTICO_ADMIN_TOKEN")]
    admin_token: Option<String>,

    /// Seconds to wait for the local service's response
    #[arg(long, default_value_t = 10, env = "PORTICO_FORWARD_TIMEOUT")]
    forward_timeout: u64,

    /// Seconds to wait for the liveness probe
    #[arg(long, default_value_t = 3, env = "PORTICO_PROBE_TIMEOUT")]
    probe_timeout: u64,

    /// Skip the liveness probe before forwarding
    #[arg(long, env = "PORTICO_NO_PROBE")]
    no_probe: bool,

    /// Host dialed for tunnels created through the admin API
    #[arg(long, default_value = "127.0.0.1", env = "PORTICO_STATIC_UPSTREAM_HOST")]
    static_upstream_host: String,

    /// Maximum concurrent control connections
    #[arg(long, default_value_t = 1000, env = "PORTICO_MAX_CONNECTIONS")]
    max_connections: usize,

    /// Maximum concurrent public HTTP connections
    #[arg(long, default_value_t = 10_000, env = "PORTICO_MAX_HTTP_CONNECTIONS")]
    max_http_connections: usize,

    /// Maximum public request body in bytes
    #[arg(long, default_value_t = 10 * 1024 * 1024, env = "PORTICO_MAX_REQUEST_BODY")]
    max_request_body: usize,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format: pretty or json
    #[arg(long, default_value = "pretty", env = "PORTICO_LOG_FORMAT")]
    log_format: LogFormat,
}

pub async fn run(args: ServerArgs) -> Result<()> {
    super::init_logging(args.log_format, &args.log_level)?;

    info!("Starting Portico broker v{}", env!("CARGO_PKG_VERSION"));

    let mut builder = Server::builder()
        .control_bind(args.control_bind)
        .http_bind(args.http_bind)
        .relay(RelayConfig {
            forward_timeout: Duration::from_secs(args.forward_timeout),
            probe_enabled: !args.no_probe,
            probe_timeout: Duration::from_secs(args.probe_timeout),
            static_upstream_host: args.static_upstream_host,
        })
        .limits(LimitsConfig {
            max_connections: args.max_connections,
            max_http_connections: args.max_http_connections,
            max_request_body: args.max_request_body,
            ..LimitsConfig::default()
        });

    match args.token {
        Some(token) => builder = builder.token(token),
        None => warn!("No --token given; any client may register tunnels"),
    }
    match args.admin_token {
        Some(token) => builder = builder.admin_bind(args.admin_bind).admin_token(token),
        None => info!("No --admin-token given; admin API disabled"),
    }

    builder.build()?.run().await?;
    info!("Broker stopped");
    Ok(())
}
