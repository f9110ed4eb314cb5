//! Meshgate gateway binary
//!
//! Loads configuration, builds the composition root and serves until
//! interrupted.

use clap::Parser;
use meshgate::{Gateway, GatewayConfig, Result};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listening host
    #[arg(long)]
    host: Option<String>,

    /// Override the listening port
    #[arg(short, long)]
    port: Option<u16>,

    /// Set the verbosity level
    #[arg(short, long, default_value = "info")]
    verbosity: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    use tracing_subscriber::{fmt, EnvFilter};
    fmt()
        .with_env_filter(EnvFilter::new(&args.verbosity))
        .init();

    let mut config = GatewayConfig::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    log::info!(
        "starting meshgate on {}:{} ({} configured services)",
        config.host,
        config.port,
        config.services.len()
    );

    let gateway = Gateway::new(config).await?;
    gateway.serve().await
}
