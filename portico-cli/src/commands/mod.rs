pub mod client;
pub mod server;
pub mod version;

use portico_observability::{init_tracing, LogFormat, TracingConfig};

/// Install logging for a subcommand; `RUST_LOG` overrides `level`
pub fn init_logging(format: LogFormat, level: &str) -> anyhow::Result<()> {
    init_tracing(&TracingConfig {
        format,
        default_filter: level.to_string(),
    })
}
