//! # OS signal handling.
//!
//! [`wait_for_shutdown_signal`] completes when the process receives a
//! termination request. Only terminate and interrupt trigger shutdown;
//! every other signal is left at its default disposition.
//!
//! **Unix:** `SIGINT` (Ctrl-C), `SIGTERM` (systemd/kill default).
//! **Elsewhere:** Ctrl-C via [`tokio::signal::ctrl_c`].

/// Waits for a termination signal.
///
/// Each call installs independent listeners. Returns `Ok(())` when a
/// signal arrives, or `Err` if listener registration fails.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }
    Ok(())
}

/// Waits for a termination signal (Ctrl-C only off Unix).
#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
