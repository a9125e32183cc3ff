//! Graceful shutdown on SIGINT/SIGTERM.
//!
//! The orchestrator polls the shutdown flag between feeds: in-flight
//! work for the current feed finishes, the metadata cache is persisted,
//! the workspace and lock are released, and the process exits non-zero.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

#[inline]
pub fn is_shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::Relaxed)
}

pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

#[cfg(test)]
pub fn reset_shutdown() {
    SHUTDOWN_REQUESTED.store(false, Ordering::Relaxed);
}

/// Registers the signal listeners for the lifetime of the process.
pub struct ShutdownGuard {
    _marker: (),
}

impl ShutdownGuard {
    /// Spawn the listener task. In environments where handlers cannot
    /// be registered the run continues without graceful shutdown.
    pub fn new() -> Self {
        tokio::spawn(async move {
            let sigint = signal(SignalKind::interrupt());
            let sigterm = signal(SignalKind::terminate());
            match (sigint, sigterm) {
                (Ok(mut int), Ok(mut term)) => {
                    tokio::select! {
                        _ = int.recv() => info!("received SIGINT, finishing current feed"),
                        _ = term.recv() => info!("received SIGTERM, finishing current feed"),
                    }
                    request_shutdown();
                }
                (Ok(mut int), Err(_)) => {
                    int.recv().await;
                    info!("received SIGINT, finishing current feed");
                    request_shutdown();
                }
                (Err(_), Ok(mut term)) => {
                    term.recv().await;
                    info!("received SIGTERM, finishing current feed");
                    request_shutdown();
                }
                (Err(e), Err(_)) => {
                    warn!("no signal handlers registered ({}), graceful shutdown disabled", e);
                }
            }
        });
        Self { _marker: () }
    }
}

impl Default for ShutdownGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_flag_round_trip() {
        reset_shutdown();
        assert!(!is_shutdown_requested());
        request_shutdown();
        assert!(is_shutdown_requested());
        reset_shutdown();
        assert!(!is_shutdown_requested());
    }
}
