//! Escrow engine binary

use anyhow::Context;
use settlement::{Config, EscrowEngine, MockGateway};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    // Load configuration: argv[1], then SETTLEMENT_CONFIG, then environment only
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SETTLEMENT_CONFIG").ok());
    let config = match path {
        Some(path) => {
            let mut config = Config::from_file(&path)
                .with_context(|| format!("loading config from {}", path))?;
            config.apply_env()?;
            config
        }
        None => Config::from_env()?,
    };

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        worker_id = %config.workers.worker_id,
        "Starting escrow engine"
    );

    let engine = Arc::new(
        EscrowEngine::open(config, Arc::new(MockGateway::new())).context("opening engine")?,
    );
    let workers = engine.spawn_workers();

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down escrow engine");
    workers.shutdown().await;
    Ok(())
}
