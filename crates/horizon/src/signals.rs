//! Signal handling for graceful host shutdown.
//!
//! The first signal starts the orderly shutdown; the host then listens again
//! so that a second signal can cut it short.

use tokio::signal;
use tracing::info;

/// Waits for a termination signal and logs it.
///
/// Handles SIGINT and SIGTERM on Unix and Ctrl+C elsewhere.
pub async fn wait_for_shutdown_signal() -> Result<(), Box<dyn std::error::Error>> {
    wait_for_shutdown_signal_silent().await?;
    info!("📡 Received shutdown signal - initiating graceful shutdown");
    Ok(())
}

pub async fn wait_for_shutdown_signal_silent() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => (),
            _ = sigterm.recv() => ()
        }
    }

    #[cfg(not(unix))]
    signal::ctrl_c().await?;

    Ok(())
}
