use classify_gateway::{app_state::AppState, config::AppConfig, supervisor};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting classify-gateway worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Metrics are recorded but not served by the worker
    PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    classify_gateway::describe_metrics();

    let state = AppState::build(&config).expect("Failed to initialize services");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl-C received, shutting down");
                shutdown_tx.send_replace(true);
            }
        }
    });

    tracing::info!("Worker ready, starting consumer loop");

    let consumer = state.consumer();
    let handle = tokio::spawn(async move { consumer.run(shutdown_rx).await });
    let exit = supervisor::supervise(handle, shutdown_tx, config.shutdown_timeout()).await;

    state.connection.close().await;
    tracing::info!(exit = ?exit, "Worker stopped");
}
