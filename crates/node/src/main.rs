use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use taskmesh_dispatch::cluster::InMemoryCluster;
use taskmesh_dispatch::{handler_fn, DispatchConfig, DispatchService, InMemoryWorkStore};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "taskmesh=info")
    // - TASKMESH_*: see DispatchConfig::from_env
    let filter = std::env::var("RUST_LOG")
        .or_else(|_| std::env::var("LOG_LEVEL").map(|level| format!("taskmesh={level}")))
        .unwrap_or_else(|_| "taskmesh=info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    tracing::info!("taskmesh-node starting...");

    let config = DispatchConfig::from_env().context("Invalid node configuration")?;

    tracing::info!(
        node_id = %config.node_id,
        address = %config.address,
        max_workers = config.pool.max_workers,
        policy = ?config.pool.saturation_policy,
        recovery = config.recovery.enabled,
        "Starting dispatch node"
    );

    let cluster = Arc::new(InMemoryCluster::new());
    let store = Arc::new(InMemoryWorkStore::new());
    let handler = handler_fn(|item| async move {
        tracing::info!(
            id = %item.id,
            group = %item.group,
            recovered = item.recovered,
            "Processing work item"
        );
        Ok(json!({"id": item.id, "group": item.group}))
    });

    let service = Arc::new(
        DispatchService::new(config, handler, cluster.clone(), store)
            .context("Failed to create dispatch service")?,
    );
    cluster.join(service.member().clone(), &service);
    service.start().context("Failed to start dispatch service")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    let undelivered = service.shutdown_now().await;
    if !undelivered.is_empty() {
        tracing::warn!(count = undelivered.len(), "Work items never started");
    }

    let snapshot = service.metrics_snapshot();
    tracing::info!(
        submitted = snapshot.submitted,
        completed = snapshot.completed,
        failed = snapshot.failed,
        "Node shutdown complete"
    );
    Ok(())
}
