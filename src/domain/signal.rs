//! Cooperative cancellation
//!
//! The control loop polls a `CancelSignal` only at iteration boundaries. An
//! in-flight agent turn or subprocess is always allowed to finish first.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Polled between iterations to decide whether to stop early.
pub trait CancelSignal: Send + Sync {
    /// Returns true once a pause or cancel has been requested
    fn is_cancelled(&self) -> bool;
}

/// Never cancels.
pub struct NoOpCancelSignal;

impl CancelSignal for NoOpCancelSignal {
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Cancellation flag shared between the executor and a controller.
#[derive(Debug, Clone, Default)]
pub struct PauseFlag {
    inner: Arc<AtomicBool>,
}

impl PauseFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a pause; observed at the next iteration boundary
    pub fn request(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    /// Clear a pending request
    pub fn clear(&self) {
        self.inner.store(false, Ordering::SeqCst);
    }
}

impl CancelSignal for PauseFlag {
    fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }
}
