use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use hookbus::{run_bridge, BridgeConfig};

#[derive(Parser, Debug)]
#[command(name = "hookbus", version, about = "Webhook-to-MQTT message bus bridge")]
struct Args {
    /// Path to the TOML configuration file
    config: PathBuf,

    /// Enable debug logging (RUST_LOG overrides this)
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug { "hookbus=debug,info" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = BridgeConfig::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;

    info!(version = env!("CARGO_PKG_VERSION"), "hookbus starting");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal.cancel();
        }
    });

    run_bridge(config, shutdown).await?;

    info!("hookbus stopped");
    Ok(())
}
