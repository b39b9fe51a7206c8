use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cancellation state shared between the caller and the worker of one backup run
#[derive(Clone, Debug, Default)]
pub struct BackupContext {
    cancel_flag: Arc<AtomicBool>,
}

impl BackupContext {
    /// Create a new backup context
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the raw flag, e.g. for a Ctrl-C handler
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel_flag.clone()
    }

    /// Request cancellation; safe to call from any thread, any number of times
    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    /// Check if cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation is observed, checking every `interval`
    pub async fn cancelled(&self, interval: Duration) {
        while !self.is_cancelled() {
            tokio::time::sleep(interval).await;
        }
    }
}

/// Admits at most one backup run at a time
#[derive(Clone, Debug, Default)]
pub struct RunSlot {
    busy: Arc<AtomicBool>,
}

impl RunSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot, or `None` when a run is already in flight
    pub fn try_acquire(&self) -> Option<RunGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunGuard {
                busy: self.busy.clone(),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

/// RAII guard that frees the run slot on drop
#[derive(Debug)]
pub struct RunGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}
