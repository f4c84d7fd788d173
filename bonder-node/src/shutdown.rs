//! Signal handling for graceful shutdown.

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;

/// Spawns a task that flips the returned receiver to `true` on SIGTERM or
/// SIGINT (Ctrl+C). Every daemon loop selects on a clone of it.
///
/// The handlers are installed before returning, so a failure is reported
/// at boot rather than at the first signal.
pub fn spawn_shutdown_watch() -> std::io::Result<watch::Receiver<bool>> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
        }
        let _ = tx.send(true);
        // Dropping the sender would also read as shutdown; hold it until
        // every daemon has let go of its receiver.
        tx.closed().await;
    });

    Ok(rx)
}
