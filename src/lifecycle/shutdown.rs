//! Shutdown coordination for a run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

/// Coordinator for graceful shutdown.
///
/// Provides a broadcast channel the engine subscribes to. The request is
/// also latched, so a subscriber created after the trigger still sees it.
pub struct Shutdown {
    /// Broadcast channel sender.
    tx: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to the shutdown signal.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
            triggered: Arc::clone(&self.triggered),
        }
    }

    /// Trigger the shutdown signal. Returns `false` if it was already
    /// triggered.
    pub fn trigger(&self) -> bool {
        let first = !self.triggered.swap(true, Ordering::SeqCst);
        let _ = self.tx.send(());
        first
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end, polled by the engine at checkpoints only.
pub struct ShutdownSignal {
    rx: broadcast::Receiver<()>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// Non-blocking check. Once true, stays true.
    pub fn is_requested(&mut self) -> bool {
        match self.rx.try_recv() {
            Ok(()) | Err(broadcast::error::TryRecvError::Lagged(_)) => {
                self.triggered.store(true, Ordering::SeqCst);
                true
            }
            Err(_) => self.triggered.load(Ordering::SeqCst),
        }
    }
}
