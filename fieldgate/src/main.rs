//! Modbus TCP gateway: polls field devices, stores and publishes samples,
//! accepts write commands and streams updates to WebSocket clients.

use anyhow::{Context, Result};
use clap::Parser;
use fieldgate::GatewayConfig;
use fieldgate::context::GatewayContext;
use std::path::PathBuf;
use tracing::{error, info};

/// Modbus TCP field-device gateway.
#[derive(Parser, Debug)]
#[command(name = "fieldgate")]
#[command(about = "Polls Modbus TCP devices and bridges them to InfluxDB, Zenoh and WebSocket")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "fieldgate.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = GatewayConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    fieldgate_common::init_tracing(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Loaded configuration from {:?}", args.config);

    let gateway = GatewayContext::start(config)
        .await
        .context("Failed to start gateway")?;

    gateway
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
            }
        })
        .await
        .context("Gateway stopped with an error")?;

    Ok(())
}
