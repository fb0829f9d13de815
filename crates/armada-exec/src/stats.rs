use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of translator counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TranslatorStats {
    /// Tier0 builds published.
    pub tier0_compiles: u64,
    /// Tier1 builds published.
    pub tier1_compiles: u64,
    /// Dispatches that found a cache entry.
    pub cache_hits: u64,
    /// Subroutine executions started by the dispatch loop.
    pub executions: u64,
    /// Caller entries marked for re-JIT after Tier1 builds.
    pub caller_notifications: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    tier0_compiles: AtomicU64,
    tier1_compiles: AtomicU64,
    cache_hits: AtomicU64,
    executions: AtomicU64,
    caller_notifications: AtomicU64,
}

impl Counters {
    pub(crate) fn tier0_compile(&self) {
        self.tier0_compiles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tier1_compile(&self) {
        self.tier1_compiles.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn execution(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn caller_notifications(&self, marked: usize) {
        self.caller_notifications
            .fetch_add(marked as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TranslatorStats {
        TranslatorStats {
            tier0_compiles: self.tier0_compiles.load(Ordering::Relaxed),
            tier1_compiles: self.tier1_compiles.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            executions: self.executions.load(Ordering::Relaxed),
            caller_notifications: self.caller_notifications.load(Ordering::Relaxed),
        }
    }
}
