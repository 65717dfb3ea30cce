// src/server/mod.rs

use crate::config::Config;
use crate::core::supervisor::Supervisor;
use anyhow::Result;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;

pub mod accept_loop;
pub mod listener;
pub mod metrics_server;
mod stream;

pub use stream::AnyStream;

/// Waits for SIGINT or SIGTERM.
async fn await_shutdown_signal() {
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to create SIGINT stream");
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to create SIGTERM stream");

    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received, initiating graceful shutdown."),
        _ = sigterm.recv() => info!("SIGTERM received, initiating graceful shutdown."),
    }
}

/// The main proxy startup function: brings up the supervisor and its
/// clusters, starts the metrics exporter, and runs until a shutdown signal.
pub async fn run(config: Config, config_path: &str) -> Result<()> {
    let supervisor = Supervisor::new(&config.proxy, config_path);
    supervisor.serve(config.clusters).await?;

    if config.proxy.metrics.enabled {
        let shutdown_rx = supervisor.subscribe_shutdown();
        let port = config.proxy.metrics.port;
        tokio::spawn(async move {
            metrics_server::run_metrics_server(port, shutdown_rx).await;
        });
    } else {
        info!("Prometheus metrics server is disabled in the configuration.");
    }

    await_shutdown_signal().await;

    supervisor.close();
    info!("Proxy shutdown complete.");
    Ok(())
}
