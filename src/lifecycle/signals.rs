//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT)
//! - Translate the first signal into a shutdown request
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - The first signal lets the current probe and recovery finish and the
//!   checkpoint land; a second one exits at once with status 130

use std::sync::Arc;

use crate::lifecycle::Shutdown;

/// Exit status for a run stopped by a signal.
pub const INTERRUPTED_EXIT: i32 = 130;

/// Listen for termination signals until the process exits.
pub async fn listen(shutdown: Arc<Shutdown>) {
    loop {
        let signal = wait_for_signal().await;
        if shutdown.trigger() {
            tracing::warn!(
                signal,
                "Stop requested; finishing the current step (signal again to force)"
            );
        } else {
            tracing::error!(signal, "Second signal received; exiting without a final checkpoint");
            std::process::exit(INTERRUPTED_EXIT);
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable");
            return ctrl_c().await;
        }
    };

    tokio::select! {
        name = ctrl_c() => name,
        _ = term.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    ctrl_c().await
}

async fn ctrl_c() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for SIGINT");
        std::future::pending::<()>().await;
    }
    "SIGINT"
}
