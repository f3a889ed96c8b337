mod config;

use anyhow::{Context, Result};
use config::DaemonConfig;
use hc_engine::domain::{ProcessEventListener, ServerInventory};
use hc_engine::infrastructure::{LocalProcessController, load_server_configs};
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = DaemonConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    config.validate().map_err(anyhow::Error::msg)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config_dir = %config.config_dir.display(),
        "hc-daemon starting"
    );

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let controller = Arc::new(LocalProcessController::new(events_tx));
    let inventory = Arc::new(ServerInventory::new(controller, config.inventory_settings()));

    let token = CancellationToken::new();
    let listener = tokio::spawn({
        let listener = ProcessEventListener::new(inventory.clone());
        let token = token.clone();
        async move { listener.run(events_rx, token).await }
    });

    match load_server_configs(&config.config_dir) {
        Ok(servers) => {
            info!(count = servers.len(), "loaded server configurations");
            for (name, server) in servers.into_iter().filter(|(_, s)| s.auto_start) {
                let inventory = inventory.clone();
                tokio::spawn(async move {
                    match inventory
                        .start_server(&name, server.boot_configuration(), false)
                        .await
                    {
                        Ok(status) => {
                            info!(server = %name, status = %status, "server start requested")
                        }
                        Err(e) => error!(server = %name, error = %e, "failed to start server"),
                    }
                });
            }
        }
        Err(e) => warn!(error = %format!("{e:#}"), "no server configurations loaded"),
    }

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    let deadline = inventory.settings().blocking_timeout;
    let stopped = tokio::time::timeout(deadline, inventory.shutdown(true, None, true)).await;
    if stopped.is_err() {
        warn!(
            timeout_secs = deadline.as_secs(),
            "servers did not stop in time, killing the rest"
        );
        for server in inventory.servers() {
            if !server.status().is_settled() {
                server.kill().await;
            }
        }
    }

    token.cancel();
    if let Err(e) = listener.await {
        error!(error = %e, "event listener task failed");
    }

    info!("hc-daemon stopped");
    Ok(())
}
