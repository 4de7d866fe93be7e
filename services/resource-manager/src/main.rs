//! Resource manager daemon.
//!
//! Runs the orchestration core with the in-memory store and the simulated
//! launcher until interrupted.

use anyhow::Result;
use rm_core::{config, ResourceManager};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to RM_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting resource manager");
    info!(
        dispatcher_workers = config.dispatcher_workers,
        queues = config.queues.len(),
        "Configuration loaded"
    );

    let manager = ResourceManager::start(config);

    match manager.recover().await {
        Ok(recovered) => info!(applications = recovered, "State recovered"),
        Err(e) => {
            error!(error = %e, "Failed to recover state");
            manager.shutdown().await;
            return Err(e.into());
        }
    }

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    manager.shutdown().await;
    info!("Resource manager stopped");

    Ok(())
}
