//! Signal handling for graceful shutdown and settings reload.

use crate::config::ConfigLoader;
use pickup_core::config::{DlqSettings, RelaySettings, SettingsStore};
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

/// Cancel `shutdown` on SIGTERM or SIGINT (Ctrl+C).
pub fn spawn_shutdown_listener(shutdown: CancellationToken) -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = shutdown.cancelled() => return,
        }
        shutdown.cancel();
    });
    Ok(())
}

/// Re-read the config file on SIGHUP and push the relay and DLQ sections
/// to the running workers. Stops when `shutdown` is cancelled.
pub fn spawn_config_reload_handler(
    config_loader: Arc<ConfigLoader>,
    relay_settings: SettingsStore<RelaySettings>,
    dlq_settings: SettingsStore<DlqSettings>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let mut sighup = signal(SignalKind::hangup())?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sighup.recv() => {
                    tracing::info!("Received SIGHUP, reloading configuration");
                    match config_loader.reload() {
                        Ok(loaded) => {
                            relay_settings.update(loaded.relay).await;
                            dlq_settings.update(loaded.dlq).await;
                            tracing::info!("Configuration reloaded successfully");
                        }
                        Err(e) => {
                            tracing::error!("Failed to reload configuration: {}", e);
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::debug!("Config reload handler shutting down");
                    break;
                }
            }
        }
    });
    Ok(())
}
