//! optx - options quoting engine entry point.

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Options quoting engine with transaction-rate admission control
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via OPTX_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,

    /// Default log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    optx_telemetry::init_logging(&args.log_level)?;
    info!("Starting optx v{}", env!("CARGO_PKG_VERSION"));

    let config_path = optx_engine::AppConfig::resolve_path(args.config.as_deref());
    info!(config_path = %config_path, "Loading configuration");
    let config = optx_engine::AppConfig::load(Some(&config_path))?;
    info!(
        instruments = config.instruments.len(),
        limit = config.controller.limit,
        "Configuration loaded"
    );

    let app = optx_engine::Application::new(config)?;
    app.run().await?;

    Ok(())
}
