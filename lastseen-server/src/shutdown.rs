//! Signal handling for graceful shutdown.

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;

/// Completes when SIGTERM or SIGINT (Ctrl+C) is received.
pub async fn shutdown_signal() -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
        }
    }
    Ok(())
}

/// Flip `shutdown_tx` to `true` on the first shutdown signal.
pub fn spawn_signal_forwarder(shutdown_tx: watch::Sender<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            result = shutdown_signal() => match result {
                Ok(()) => {
                    shutdown_tx.send_replace(true);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install signal handlers");
                    // Keep the sender alive so a missing handler is not read as shutdown.
                    shutdown_tx.closed().await;
                }
            },
            _ = shutdown_tx.closed() => {}
        }
    })
}

/// Completes once `shutdown_rx` reads `true` or its sender is gone.
pub async fn wait_for_shutdown(mut shutdown_rx: watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}
