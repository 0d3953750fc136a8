use std::io;

use tokio::signal;
use tokio::sync::watch;

/// Shutdown flag shared by the worker loops; flips to `true` exactly once.
pub type ShutdownRx = watch::Receiver<bool>;

pub fn shutdown_channel() -> (watch::Sender<bool>, ShutdownRx) {
    watch::channel(false)
}

/// Waits for Ctrl+C or SIGTERM. A handler that cannot be installed never fires.
pub async fn wait_for_signal() {
    tokio::select! {
        result = signal::ctrl_c() => received("ctrl_c", result).await,
        result = terminate() => received("sigterm", result).await,
    }
}

/// Waits for a process signal, then tells every receiver to stop.
pub async fn broadcast_on_signal(tx: watch::Sender<bool>) {
    wait_for_signal().await;
    if tx.send(true).is_err() {
        tracing::warn!("No background task was listening for shutdown");
    }
}

async fn received(name: &'static str, result: io::Result<()>) {
    match result {
        Ok(()) => tracing::info!(signal = name, "shutdown signal received"),
        Err(err) => {
            tracing::error!(signal = name, error = %err, "Failed to install signal handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(unix)]
async fn terminate() -> io::Result<()> {
    let mut stream = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    stream.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn terminate() -> io::Result<()> {
    std::future::pending().await
}
