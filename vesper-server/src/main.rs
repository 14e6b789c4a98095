//! VESPER Server Entry Point
//!
//! Loads configuration from the environment, opens the database service,
//! runs the background jobs until Ctrl-C, then shuts down in order: jobs
//! first, then open sessions and tenant engines.

use vesper_core::VesperConfig;
use vesper_server::{init_tracing, ApiError, ApiResult, DatabaseService};

#[tokio::main]
async fn main() -> ApiResult<()> {
    init_tracing()?;

    let config = VesperConfig::from_env();
    config.validate()?;
    tracing::info!(
        data_dir = %config.storage.data_dir.display(),
        backend = ?config.storage.backend,
        idle_timeout_secs = config.transactions.idle_timeout.as_secs(),
        "Starting VESPER server"
    );

    let service = DatabaseService::from_config(config)?;
    let jobs = service.start_background_jobs();

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to listen for shutdown: {}", e)))?;
    tracing::info!("Shutdown signal received");

    jobs.shutdown().await;
    service.shutdown().await;
    Ok(())
}
