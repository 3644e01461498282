//! Allocation statistics: per-thread counters merged into per-pool atomics.
//!
//! Every user-visible allocation and deallocation bumps plain counters in
//! the calling thread's pool-local state (no atomics on the hot path).
//! `merge` folds a thread's counters into the pool totals using a
//! delta-since-last-report protocol, so merging is idempotent-safe and can
//! run at any cadence. All atomics use relaxed ordering — the totals are
//! an advisory, eventually-consistent view, not a synchronization point.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::thread_cache;

/// Plain per-thread counters carried in the thread's pool-local state.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ThreadCounters {
    pub allocations: usize,
    pub deallocations: usize,
    pub bytes_allocated: usize,
    /// Byte level at the last merge; the next merge applies the delta.
    pub last_reported_bytes: usize,
}

impl ThreadCounters {
    #[inline]
    pub(crate) fn record_alloc(&mut self, bytes: usize) {
        self.allocations += 1;
        self.bytes_allocated += bytes;
    }

    #[inline]
    pub(crate) fn record_dealloc(&mut self, bytes: usize) {
        self.deallocations += 1;
        self.bytes_allocated = self.bytes_allocated.saturating_sub(bytes);
    }
}

/// Per-pool atomic totals.
pub(crate) struct PoolStats {
    total_allocations: AtomicUsize,
    total_deallocations: AtomicUsize,
    total_bytes: AtomicUsize,
}

impl PoolStats {
    pub(crate) const fn new() -> Self {
        Self {
            total_allocations: AtomicUsize::new(0),
            total_deallocations: AtomicUsize::new(0),
            total_bytes: AtomicUsize::new(0),
        }
    }

    /// Folds a thread's counters into the totals and re-arms them.
    pub(crate) fn merge_counters(&self, counters: &mut ThreadCounters) {
        self.total_allocations
            .fetch_add(counters.allocations, Ordering::Relaxed);
        self.total_deallocations
            .fetch_add(counters.deallocations, Ordering::Relaxed);

        let current = counters.bytes_allocated;
        let previous = counters.last_reported_bytes;
        if current >= previous {
            self.total_bytes.fetch_add(current - previous, Ordering::Relaxed);
        } else {
            self.total_bytes.fetch_sub(previous - current, Ordering::Relaxed);
        }
        counters.last_reported_bytes = current;
        counters.allocations = 0;
        counters.deallocations = 0;
    }

    /// Drops the outstanding-byte total to zero (pool reset).
    pub(crate) fn reset_bytes(&self) {
        self.total_bytes.store(0, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_allocations: self.total_allocations.load(Ordering::Relaxed),
            total_deallocations: self.total_deallocations.load(Ordering::Relaxed),
            outstanding_bytes: self.total_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a pool's merged totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Merged user-visible allocations.
    pub total_allocations: usize,
    /// Merged user-visible deallocations.
    pub total_deallocations: usize,
    /// Merged live payload bytes.
    pub outstanding_bytes: usize,
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Total allocations: {}\nTotal deallocations: {}\nOutstanding bytes: {}",
            self.total_allocations, self.total_deallocations, self.outstanding_bytes
        )
    }
}

/// Bumps the calling thread's allocation counters for `pool_id`.
#[inline]
pub(crate) fn record_alloc(pool_id: u64, bytes: usize) {
    thread_cache::with_state(pool_id, |state| state.counters.record_alloc(bytes));
}

/// Bumps the calling thread's deallocation counters for `pool_id`.
#[inline]
pub(crate) fn record_dealloc(pool_id: u64, bytes: usize) {
    thread_cache::with_state(pool_id, |state| state.counters.record_dealloc(bytes));
}
