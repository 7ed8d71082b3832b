//! Maintenance worker binary.
//!
//! Connects to the configured database, then polls for freshness-check
//! jobs until interrupted.

use anyhow::Result;
use ingestion::{EngineConfig, Pipeline, PipelineWorker};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = EngineConfig::from_env();
    info!(database_url = %config.database_url, "starting pipeline worker");

    let pipeline = Pipeline::connect(config).await?;
    let worker = PipelineWorker::new(pipeline, format!("worker-{}", std::process::id()));

    let shutdown = worker.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
        }
    });

    worker.run().await?;
    Ok(())
}
