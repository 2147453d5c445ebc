use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-lifetime upload counters shared by the listener and all handlers.
#[derive(Debug, Clone, Default)]
pub struct IngestStats {
    accepted: Arc<AtomicU64>,
    active: Arc<AtomicU64>,
    stored: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    rejected_busy: Arc<AtomicU64>,
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub active: u64,
    pub stored: u64,
    pub failed: u64,
    pub rejected_busy: u64,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_busy(&self) {
        self.rejected_busy.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark a handler as running. The count drops again when the guard does.
    pub fn handler_started(&self) -> ActiveGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveGuard {
            active: Arc::clone(&self.active),
        }
    }

    pub fn record_outcome(&self, success: bool) {
        if success {
            self.stored.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected_busy: self.rejected_busy.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the active handler count on drop, including on panic.
#[derive(Debug)]
pub struct ActiveGuard {
    active: Arc<AtomicU64>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}
