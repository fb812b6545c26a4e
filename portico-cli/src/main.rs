//! Portico command line
//!
//! One binary for both sides of the tunnel: `portico server` runs the
//! broker, `portico client` exposes a local service through it.

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "portico",
    author,
    version,
    about = "Reverse-tunnel broker and client agent",
    long_about = "Portico exposes services behind NAT through a public relay.\n\n\
                  Run `portico server` on the public host and `portico client` next to the \
                  service you want to expose.",
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker
    Server(commands::server::ServerArgs),

    /// Run the client agent
    Client(commands::client::ClientArgs),

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Server(args) => commands::server::run(args).await,
        Commands::Client(args) => commands::client::run(args).await,
        Commands::Version => {
            commands::version::run();
            Ok(())
        }
    }
}
