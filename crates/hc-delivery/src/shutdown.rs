use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// Polled by retry loops to learn that the pipeline is shutting down
pub trait ShutdownSignal: Send + Sync {
    fn is_requested(&self) -> bool;
}

/// Shareable flag flipped once by the owner of the pipeline
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    requested: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }
}

impl ShutdownSignal for ShutdownFlag {
    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

impl ShutdownSignal for watch::Receiver<bool> {
    fn is_requested(&self) -> bool {
        *self.borrow()
    }
}

/// Signal that never fires
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverShutdown;

impl ShutdownSignal for NeverShutdown {
    fn is_requested(&self) -> bool {
        false
    }
}
