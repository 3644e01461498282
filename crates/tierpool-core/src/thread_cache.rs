//! Thread-local front end for the fixed-size slab tiers.
//!
//! Each thread keeps, per pool, one LIFO of cached payload pointers for
//! every slab size plus its private stat counters. Cache operations take
//! no locks; refills pull a batch of blocks from the owning slab through
//! the stats-silent path. Blocks sitting in a cache are logically free
//! but recorded in no slab free list, and their tier tag stays FixedSize.
//!
//! The registry is keyed by pool id so several pools can coexist on one
//! thread; lookups scan a short vector (one entry per pool the thread has
//! touched) rather than hashing.

use std::cell::RefCell;

use crate::stats::ThreadCounters;

/// Cached pointers per thread for the 32-byte slab.
pub const SMALL_CACHE_LIMIT: usize = 256;
/// Cached pointers per thread for the 128-byte slab.
pub const MEDIUM_CACHE_LIMIT: usize = 256;
/// Cached pointers per thread for the 256-byte slab.
pub const LARGE_CACHE_LIMIT: usize = 256;

/// Blocks pulled from the 32-byte slab on a cache miss.
pub const SMALL_REFILL_BATCH: usize = 64;
/// Blocks pulled from the 128-byte slab on a cache miss.
pub const MEDIUM_REFILL_BATCH: usize = 32;
/// Blocks pulled from the 256-byte slab on a cache miss.
pub const LARGE_REFILL_BATCH: usize = 32;

/// Per-(thread, pool) state: the three slab caches and the stat counters.
pub(crate) struct PoolThreadState {
    pool_id: u64,
    pub small: Vec<*mut u8>,
    pub medium: Vec<*mut u8>,
    pub large: Vec<*mut u8>,
    pub counters: ThreadCounters,
}

impl PoolThreadState {
    fn new(pool_id: u64) -> Self {
        Self {
            pool_id,
            small: Vec::new(),
            medium: Vec::new(),
            large: Vec::new(),
            counters: ThreadCounters::default(),
        }
    }
}

thread_local! {
    static POOL_TLS: RefCell<Vec<PoolThreadState>> = const { RefCell::new(Vec::new()) };
}

/// Runs `f` against the calling thread's state for `pool_id`, creating it
/// on first touch.
///
/// `f` must not re-enter this function (the registry is a `RefCell`).
pub(crate) fn with_state<R>(pool_id: u64, f: impl FnOnce(&mut PoolThreadState) -> R) -> R {
    POOL_TLS.with(|tls| {
        let mut states = tls.borrow_mut();
        let idx = match states.iter().position(|s| s.pool_id == pool_id) {
            Some(idx) => idx,
            None => {
                states.push(PoolThreadState::new(pool_id));
                states.len() - 1
            }
        };
        f(&mut states[idx])
    })
}

/// Removes and returns the calling thread's state for `pool_id`, if any.
///
/// Used by `release_thread_cache` and `reset` to spill cached pointers
/// back to their slabs.
pub(crate) fn take_state(pool_id: u64) -> Option<PoolThreadState> {
    POOL_TLS.with(|tls| {
        let mut states = tls.borrow_mut();
        let idx = states.iter().position(|s| s.pool_id == pool_id)?;
        Some(states.swap_remove(idx))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_created_on_first_touch() {
        let seen = with_state(1_000_001, |state| {
            state.small.push(std::ptr::null_mut());
            state.small.len()
        });
        assert_eq!(seen, 1);
        // Same entry on the second access.
        let seen = with_state(1_000_001, |state| state.small.len());
        assert_eq!(seen, 1);
        take_state(1_000_001);
    }

    #[test]
    fn pools_do_not_share_entries() {
        with_state(1_000_002, |state| state.counters.record_alloc(64));
        let other = with_state(1_000_003, |state| state.counters.bytes_allocated);
        assert_eq!(other, 0);
        take_state(1_000_002);
        take_state(1_000_003);
    }

    #[test]
    fn take_state_removes_entry() {
        with_state(1_000_004, |state| state.counters.record_alloc(32));
        let taken = take_state(1_000_004).expect("entry must exist");
        assert_eq!(taken.counters.bytes_allocated, 32);
        assert!(take_state(1_000_004).is_none());
    }
}
