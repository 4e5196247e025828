//! Store operation counters (lock-free atomics) and their snapshot form.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct StoreStats {
    pub(crate) adds: AtomicU64,
    pub(crate) removes: AtomicU64,
    pub(crate) replaces: AtomicU64,
    pub(crate) renames: AtomicU64,
    pub(crate) scans: AtomicU64,
    pub(crate) backend_failures: AtomicU64,
}

impl StoreStats {
    pub fn snapshot(&self, entry_count: usize, generation: u64) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            entry_count,
            generation,
            adds: self.adds.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            replaces: self.replaces.load(Ordering::Relaxed),
            renames: self.renames.load(Ordering::Relaxed),
            scans: self.scans.load(Ordering::Relaxed),
            backend_failures: self.backend_failures.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot of store activity for observability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStatsSnapshot {
    pub entry_count: usize,
    /// Structural-change generation; scan order is stable within one.
    pub generation: u64,
    pub adds: u64,
    pub removes: u64,
    pub replaces: u64,
    pub renames: u64,
    pub scans: u64,
    pub backend_failures: u64,
}
