//! Cancellation context (`Cx`) for worker loops.
//!
//! Each handler and the distributor receive a `Cx` at loop entry and call
//! [`Cx::checkpoint`] once per iteration. Cancellation is therefore observed
//! only between iterations: an in-flight store operation always completes.
//! Clones share cancellation state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use shmflow_error::{Result, ShmflowError};

#[derive(Debug, Default)]
struct CxInner {
    cancel_requested: AtomicBool,
    checkpoints: AtomicU64,
}

/// Shared cancellation token.
#[derive(Debug, Clone, Default)]
pub struct Cx {
    inner: Arc<CxInner>,
}

impl Cx {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.inner.cancel_requested.load(Ordering::Acquire)
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel_requested.store(true, Ordering::Release);
    }

    /// Returns `Err(Cancelled)` once cancellation has been requested.
    pub fn checkpoint(&self) -> Result<()> {
        self.inner.checkpoints.fetch_add(1, Ordering::Relaxed);
        if self.is_cancel_requested() {
            return Err(ShmflowError::Cancelled);
        }
        Ok(())
    }

    /// Number of checkpoints observed across all clones.
    #[must_use]
    pub fn checkpoint_count(&self) -> u64 {
        self.inner.checkpoints.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_before_and_after_cancel() {
        let cx = Cx::new();
        assert!(cx.checkpoint().is_ok());
        cx.cancel();
        assert!(matches!(cx.checkpoint(), Err(ShmflowError::Cancelled)));
        assert_eq!(cx.checkpoint_count(), 2);
    }

    #[test]
    fn test_cancel_propagates_to_clones() {
        let cx = Cx::new();
        let worker = cx.clone();
        assert!(!worker.is_cancel_requested());
        cx.cancel();
        cx.cancel();
        assert!(worker.is_cancel_requested());
    }
}
