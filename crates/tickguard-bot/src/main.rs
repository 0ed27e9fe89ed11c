//! tickguard entry point.

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Market-data watcher with automated position protection
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via TICKGUARD_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // TLS provider must be installed before any stream connects
    tickguard_ws::init_crypto();

    let args = Args::parse();

    tickguard_telemetry::init_logging()?;

    info!("Starting tickguard v{}", env!("CARGO_PKG_VERSION"));

    // CLI arg > TICKGUARD_CONFIG > default
    let config_path = args
        .config
        .or_else(|| std::env::var("TICKGUARD_CONFIG").ok())
        .unwrap_or_else(|| tickguard_bot::DEFAULT_CONFIG_PATH.to_string());

    info!(config_path = %config_path, "Loading configuration");

    let config = tickguard_bot::AppConfig::from_file(&config_path)?;
    info!(
        symbols = ?config.stream.symbols,
        fallback = config.fallback.enabled,
        "Configuration loaded"
    );

    let app = tickguard_bot::Application::new(config)?;
    app.run().await?;

    Ok(())
}
