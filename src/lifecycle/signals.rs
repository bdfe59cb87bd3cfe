//! OS signal handling.
//!
//! # Responsibilities
//! - Wait for SIGINT (Ctrl+C) or SIGTERM
//! - Translate the first one into a shutdown trigger
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - A handler that cannot be installed is logged and never resolves,
//!   so the other signal still works

use crate::lifecycle::shutdown::Shutdown;

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

/// Resolve on the first termination signal, returning its name.
pub async fn wait_for_signal() -> &'static str {
    tokio::select! {
        _ = ctrl_c() => "SIGINT",
        _ = terminate() => "SIGTERM",
    }
}

/// Trigger `shutdown` when the process is asked to stop.
pub async fn trigger_on_signal(shutdown: &Shutdown) {
    let signal = wait_for_signal().await;
    tracing::info!(signal, "Shutdown signal received");
    shutdown.trigger();
}
