use tokio::signal;

#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("could not listen for Ctrl+C: {0}")]
    Interrupt(std::io::Error),
    #[cfg(unix)]
    #[error("could not listen for SIGTERM: {0}")]
    Terminate(std::io::Error),
}

/// The signal that asked the process to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ShutdownSignal {
    #[strum(to_string = "Ctrl+C")]
    Interrupt,
    #[strum(to_string = "SIGTERM")]
    Terminate,
}

/// Resolves on the first Ctrl+C or, on Unix, SIGTERM, and logs which one it was.
pub async fn wait_for_shutdown() -> Result<ShutdownSignal, ShutdownError> {
    let received = tokio::select! {
        result = signal::ctrl_c() => {
            result.map_err(ShutdownError::Interrupt)?;
            ShutdownSignal::Interrupt
        }
        result = terminate() => result?,
    };
    tracing::info!(signal = %received, "shutdown signal received");
    Ok(received)
}

#[cfg(unix)]
async fn terminate() -> Result<ShutdownSignal, ShutdownError> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .map_err(ShutdownError::Terminate)?;
    sigterm.recv().await;
    Ok(ShutdownSignal::Terminate)
}

#[cfg(not(unix))]
async fn terminate() -> Result<ShutdownSignal, ShutdownError> {
    std::future::pending().await
}
