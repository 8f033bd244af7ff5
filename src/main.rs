pub mod broker;
pub mod bus;
pub mod config;
pub mod forwarding;
pub mod gateway;
pub mod ingress;
pub mod mqtt;

use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::bus::MemoryBus;
use crate::config::{default_config_path, GatewayConfig};
use crate::gateway::Gateway;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);
    info!("Using configuration {}", config_path.display());
    let config = GatewayConfig::load_or_create(&config_path).await?;

    let bus = Arc::new(MemoryBus::new(config.context()));
    let mut gateway = Gateway::start(&config, bus)
        .await
        .map_err(|e| eyre!("Failed to start gateway: {}", e))?;

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for shutdown signal: {}", e))?;
    info!("Shutdown requested");

    gateway.stop().await;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
