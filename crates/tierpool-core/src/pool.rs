//! The memory pool facade.
//!
//! Routes every request to the right tier: thread-cached slabs for small
//! blocks, segregated class lists for mid sizes, and the coalescing
//! best-fit arena for everything else. Deallocation recovers the tier
//! from the block header alone. One mutex guards the arena structures,
//! the scope stack, and (without `sharded-classes`) the class lists; each
//! slab carries its own leaf mutex.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::arena::Arena;
use crate::block::{BlockHeader, Tier, ALIGNMENT};
use crate::scope::ScopeTracker;
use crate::segregated::{self, ClassLists};
use crate::slab::FixedSizeAllocator;
use crate::stats::{self, PoolStats, StatsSnapshot};
use crate::thread_cache::{
    self, PoolThreadState, LARGE_CACHE_LIMIT, LARGE_REFILL_BATCH, MEDIUM_CACHE_LIMIT,
    MEDIUM_REFILL_BATCH, SMALL_CACHE_LIMIT, SMALL_REFILL_BATCH,
};

/// Allocation policy requested by the caller.
///
/// `BestFit` is the default and is subject to size routing: small requests
/// are served by the slab tiers and mid-size requests by the segregated
/// classes. `PoolBased` and `Segregated` override the routing; `FixedSize`
/// is honoured only when the aligned size fits a slab, and falls through
/// to best-fit otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationStrategy {
    /// Best-fit allocation for variable-size blocks.
    #[default]
    BestFit,
    /// Fixed-size slab blocks for uniform small allocations.
    FixedSize,
    /// First-fit scan over the arena, no split.
    PoolBased,
    /// Segregated free lists per size class.
    Segregated,
}

/// Resolved destination tier for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Slab32,
    Slab128,
    Slab256,
    Segregated(usize),
    BestFit,
    PoolBased,
}

/// Which of the three thread-cache LIFOs a slab maps to.
#[derive(Debug, Clone, Copy)]
enum CacheSlot {
    Small,
    Medium,
    Large,
}

fn cache_vec(state: &mut PoolThreadState, slot: CacheSlot) -> &mut Vec<*mut u8> {
    match slot {
        CacheSlot::Small => &mut state.small,
        CacheSlot::Medium => &mut state.medium,
        CacheSlot::Large => &mut state.large,
    }
}

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

struct PoolInner {
    arena: Arena,
    scopes: ScopeTracker,
    #[cfg(not(feature = "sharded-classes"))]
    classes: ClassLists,
}

/// Thread-aware tiered memory pool.
///
/// In thread-safe mode a pool may be shared freely across threads; in
/// single-threaded mode it is meant for exclusive use by one thread. All
/// state is mutex-guarded in both modes (an uncontended `parking_lot`
/// lock is a single CAS), so the flag records intent rather than
/// changing the safety contract.
pub struct MemoryPool {
    pool_id: u64,
    thread_safe: bool,
    inner: Mutex<PoolInner>,
    /// Open scope count, read without the lock on the hot paths.
    scope_count: AtomicUsize,
    #[cfg(feature = "sharded-classes")]
    classes: ClassLists,
    slab_small: FixedSizeAllocator<32>,
    slab_medium: FixedSizeAllocator<128>,
    slab_large: FixedSizeAllocator<256>,
    stats: PoolStats,
}

impl MemoryPool {
    /// Creates a pool with one arena chunk and its three slab allocators.
    pub fn new(thread_safe: bool) -> Self {
        let pool_id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            pool_id,
            thread_safe,
            inner: Mutex::new(PoolInner {
                arena: Arena::new(),
                scopes: ScopeTracker::new(),
                #[cfg(not(feature = "sharded-classes"))]
                classes: ClassLists::new(),
            }),
            scope_count: AtomicUsize::new(0),
            #[cfg(feature = "sharded-classes")]
            classes: ClassLists::new(),
            slab_small: FixedSizeAllocator::new(pool_id),
            slab_medium: FixedSizeAllocator::new(pool_id),
            slab_large: FixedSizeAllocator::new(pool_id),
            stats: PoolStats::new(),
        }
    }

    /// Whether the pool was constructed for cross-thread sharing.
    pub fn is_thread_safe(&self) -> bool {
        self.thread_safe
    }

    /// Allocates `size` bytes with the default best-fit policy.
    ///
    /// Returns a 16-byte-aligned pointer to at least `align_size(size)`
    /// usable bytes, or `None` when the system allocator is exhausted.
    pub fn allocate(&self, size: usize) -> Option<*mut u8> {
        self.allocate_with(size, AllocationStrategy::BestFit)
    }

    /// Allocates `size` bytes under an explicit strategy.
    pub fn allocate_with(&self, size: usize, strategy: AllocationStrategy) -> Option<*mut u8> {
        let aligned = BlockHeader::align_size(size);
        let ptr = match Self::route(aligned, strategy) {
            Route::Slab32 => {
                self.acquire_fixed(&self.slab_small, CacheSlot::Small, SMALL_REFILL_BATCH)
            }
            Route::Slab128 => {
                self.acquire_fixed(&self.slab_medium, CacheSlot::Medium, MEDIUM_REFILL_BATCH)
            }
            Route::Slab256 => {
                self.acquire_fixed(&self.slab_large, CacheSlot::Large, LARGE_REFILL_BATCH)
            }
            Route::Segregated(class) => self.allocate_segregated(class),
            Route::BestFit => self.allocate_arena(aligned, false),
            Route::PoolBased => self.allocate_arena(aligned, true),
        };
        if ptr.is_null() {
            return None;
        }
        // Scope bookkeeping: the lock is retaken here even for lockless
        // cache hits so the pointer lands in the current scope.
        if self.scope_count.load(Ordering::Relaxed) > 0 {
            let mut inner = self.inner.lock();
            inner.scopes.record(ptr as usize);
        }
        Some(ptr)
    }

    /// Allocates `size` bytes whose payload is aligned to `align`.
    ///
    /// `align` must be a power of two and at least 16; anything else is
    /// reported as exhaustion. The pointer must be released with
    /// [`MemoryPool::deallocate_aligned`], never [`MemoryPool::deallocate`].
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Option<*mut u8> {
        self.allocate_aligned_with(size, align, AllocationStrategy::BestFit)
    }

    /// [`MemoryPool::allocate_aligned`] under an explicit strategy.
    pub fn allocate_aligned_with(
        &self,
        size: usize,
        align: usize,
        strategy: AllocationStrategy,
    ) -> Option<*mut u8> {
        if !align.is_power_of_two() || align < ALIGNMENT {
            return None;
        }
        let padded = size.checked_add(align)?;
        let raw = self.allocate_with(padded, strategy)?;
        let raw_addr = raw as usize;
        // Leave room for the back-pointer word, then round up to `align`.
        // The padded request guarantees `user + size` stays inside the
        // payload because the raw pointer is itself 16-aligned.
        let user = (raw_addr + std::mem::size_of::<usize>() + align - 1) & !(align - 1);
        // SAFETY: `user - raw_addr` is at least one word and the word
        // before `user` lies inside the allocation.
        unsafe { (user as *mut usize).sub(1).write(raw_addr) };
        Some(user as *mut u8)
    }

    /// Returns a pointer obtained from [`MemoryPool::allocate`] to its
    /// owning tier. Null is tolerated.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by this pool's
    /// `allocate`/`allocate_with`, not yet deallocated or invalidated by
    /// `reset`.
    pub unsafe fn deallocate(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        // SAFETY: per contract, `ptr` carries a live header prefix.
        let block = unsafe { BlockHeader::from_payload(ptr) };
        let (tier, payload_size) = unsafe { ((*block).tier, (*block).size) };

        if self.scope_count.load(Ordering::Relaxed) > 0 {
            let mut inner = self.inner.lock();
            inner.scopes.forget(ptr as usize);
            match tier {
                Tier::FixedSize => {
                    drop(inner);
                    self.release_fixed(ptr, payload_size);
                }
                Tier::Segregated => self.free_segregated(&mut inner, block, payload_size),
                Tier::BestFit | Tier::PoolBased => {
                    inner.arena.insert_free(block);
                    stats::record_dealloc(self.pool_id, payload_size);
                }
            }
            return;
        }

        match tier {
            Tier::FixedSize => self.release_fixed(ptr, payload_size),
            Tier::Segregated => {
                let mut inner = self.inner.lock();
                self.free_segregated(&mut inner, block, payload_size);
            }
            Tier::BestFit | Tier::PoolBased => {
                let mut inner = self.inner.lock();
                inner.arena.insert_free(block);
                stats::record_dealloc(self.pool_id, payload_size);
            }
        }
    }

    /// Undoes [`MemoryPool::allocate_aligned`]. Null is tolerated.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by this pool's
    /// `allocate_aligned`/`allocate_aligned_with`.
    pub unsafe fn deallocate_aligned(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        // SAFETY: the word before an aligned pointer stores the raw pointer.
        let raw = unsafe { (ptr as *const usize).sub(1).read() } as *mut u8;
        unsafe { self.deallocate(raw) };
    }

    /// Payload byte count recorded in the header of `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by `allocate`.
    pub unsafe fn usable_size(&self, ptr: *const u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        // SAFETY: per contract, `ptr` carries a live header prefix.
        unsafe { (*BlockHeader::from_payload(ptr.cast_mut())).size }
    }

    /// [`MemoryPool::usable_size`] for a pointer from `allocate_aligned`.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by `allocate_aligned`.
    pub unsafe fn usable_size_aligned(&self, ptr: *const u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        // SAFETY: the word before an aligned pointer stores the raw pointer.
        let raw = unsafe { (ptr as *const usize).sub(1).read() } as *const u8;
        unsafe { self.usable_size(raw) }
    }

    /// Whether `ptr` falls inside any arena or slab chunk of this pool.
    pub fn owns_ptr(&self, ptr: *const u8) -> bool {
        if ptr.is_null() {
            return false;
        }
        let addr = ptr as usize;
        {
            let inner = self.inner.lock();
            if inner.arena.owns(addr) {
                return true;
            }
        }
        self.slab_small.owns(addr) || self.slab_medium.owns(addr) || self.slab_large.owns(addr)
    }

    /// Opens a scope: subsequent allocations are released en masse by the
    /// matching [`MemoryPool::end_scope`].
    pub fn begin_scope(&self) {
        let mut inner = self.inner.lock();
        inner.scopes.begin();
        self.scope_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Closes the top scope and deallocates every pointer still
    /// outstanding in it. Tolerates an empty scope stack.
    pub fn end_scope(&self) {
        let drained = {
            let mut inner = self.inner.lock();
            if inner.scopes.depth() == 0 {
                if self.scope_count.load(Ordering::Relaxed) > 0 {
                    self.scope_count.fetch_sub(1, Ordering::Relaxed);
                }
                return;
            }
            self.scope_count.fetch_sub(1, Ordering::Relaxed);
            inner.scopes.end()
        };
        for addr in drained {
            // SAFETY: scope entries are live pointers from this pool; any
            // that were freed early left the scope in `deallocate`.
            unsafe { self.deallocate(addr as *mut u8) };
        }
    }

    /// Logically frees every outstanding block: each arena chunk becomes
    /// one free block again, class lists and scopes are dropped, and the
    /// calling thread's cache returns to the slabs. The slab allocators
    /// stay intact and no memory returns to the system.
    ///
    /// Merge other threads' stats before resetting if a coherent byte
    /// total matters; their unmerged deltas are not visible here.
    pub fn reset(&self) {
        {
            let mut inner = self.inner.lock();
            inner.arena.reset();
            inner.scopes.clear();
            #[cfg(not(feature = "sharded-classes"))]
            inner.classes.clear();
            #[cfg(feature = "sharded-classes")]
            self.classes.clear();
            self.scope_count.store(0, Ordering::Relaxed);
        }
        if let Some(mut state) = thread_cache::take_state(self.pool_id) {
            self.spill_cache(&mut state);
            self.stats.merge_counters(&mut state.counters);
        }
        self.stats.reset_bytes();
    }

    /// Returns every pointer cached by the calling thread to its slab via
    /// the stats-silent path and merges the thread's counters. Call before
    /// a worker thread detaches.
    pub fn release_thread_cache(&self) {
        if let Some(mut state) = thread_cache::take_state(self.pool_id) {
            self.spill_cache(&mut state);
            self.stats.merge_counters(&mut state.counters);
        }
    }

    /// Folds the calling thread's counters into the pool totals.
    pub fn merge_thread_stats(&self) {
        thread_cache::with_state(self.pool_id, |state| {
            self.stats.merge_counters(&mut state.counters);
        });
    }

    /// Point-in-time view of the merged totals.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Number of free blocks on the arena list (diagnostic).
    pub fn arena_free_block_count(&self) -> usize {
        self.inner.lock().arena.free_block_count()
    }

    /// Payload of the largest free arena block (diagnostic).
    pub fn arena_largest_free_payload(&self) -> usize {
        self.inner.lock().arena.largest_free_payload()
    }

    fn route(aligned: usize, strategy: AllocationStrategy) -> Route {
        match strategy {
            AllocationStrategy::BestFit => {
                if aligned <= 32 {
                    Route::Slab32
                } else if aligned <= 128 {
                    Route::Slab128
                } else if aligned <= 256 {
                    Route::Slab256
                } else if aligned <= 512 {
                    segregated::class_index(aligned).map_or(Route::BestFit, Route::Segregated)
                } else {
                    Route::BestFit
                }
            }
            AllocationStrategy::FixedSize => {
                if aligned <= 32 {
                    Route::Slab32
                } else if aligned <= 128 {
                    Route::Slab128
                } else if aligned <= 256 {
                    Route::Slab256
                } else {
                    Route::BestFit
                }
            }
            AllocationStrategy::Segregated => {
                segregated::class_index(aligned).map_or(Route::BestFit, Route::Segregated)
            }
            AllocationStrategy::PoolBased => Route::PoolBased,
        }
    }

    /// Slab fast path: pop from the thread cache, batch-refill on a miss,
    /// and only fall back to the locking slab allocate when the refill
    /// produced nothing.
    fn acquire_fixed<const BLOCK: usize>(
        &self,
        slab: &FixedSizeAllocator<BLOCK>,
        slot: CacheSlot,
        batch: usize,
    ) -> *mut u8 {
        let ptr = thread_cache::with_state(self.pool_id, |state| {
            let cache = cache_vec(state, slot);
            let ptr = match cache.pop() {
                Some(ptr) => ptr,
                None => {
                    slab.allocate_batch_raw(cache, batch);
                    cache.pop().unwrap_or(std::ptr::null_mut())
                }
            };
            if !ptr.is_null() {
                state.counters.record_alloc(BLOCK);
            }
            ptr
        });
        if ptr.is_null() {
            return slab.allocate();
        }
        // SAFETY: cache entries are payload pointers carved by `slab`.
        unsafe {
            let block = BlockHeader::from_payload(ptr);
            (*block).is_free = false;
            (*block).tier = Tier::FixedSize;
        }
        ptr
    }

    /// Slab release path: cache the pointer if there is room, otherwise
    /// spill to the slab's locked free list.
    fn release_fixed_cached<const BLOCK: usize>(
        &self,
        slab: &FixedSizeAllocator<BLOCK>,
        slot: CacheSlot,
        limit: usize,
        ptr: *mut u8,
    ) {
        let cached = thread_cache::with_state(self.pool_id, |state| {
            let cache = cache_vec(state, slot);
            if cache.len() < limit {
                // SAFETY: `ptr` is a payload pointer carved by `slab`.
                unsafe { (*BlockHeader::from_payload(ptr)).is_free = true };
                cache.push(ptr);
                state.counters.record_dealloc(BLOCK);
                true
            } else {
                false
            }
        });
        if !cached {
            // SAFETY: `ptr` is a payload pointer carved by `slab`.
            unsafe { slab.deallocate(ptr) };
        }
    }

    fn release_fixed(&self, ptr: *mut u8, payload_size: usize) {
        if payload_size <= 32 {
            self.release_fixed_cached(&self.slab_small, CacheSlot::Small, SMALL_CACHE_LIMIT, ptr);
        } else if payload_size <= 128 {
            self.release_fixed_cached(&self.slab_medium, CacheSlot::Medium, MEDIUM_CACHE_LIMIT, ptr);
        } else {
            debug_assert!(payload_size <= 256);
            self.release_fixed_cached(&self.slab_large, CacheSlot::Large, LARGE_CACHE_LIMIT, ptr);
        }
    }

    fn allocate_arena(&self, aligned: usize, pool_based: bool) -> *mut u8 {
        let mut inner = self.inner.lock();
        let ptr = if pool_based {
            inner.arena.first_fit(aligned)
        } else {
            inner.arena.best_fit(aligned)
        };
        if !ptr.is_null() {
            // The handed-out block may exceed the request when an
            // unsplittable remainder was absorbed; count what it records.
            let bytes = unsafe { (*BlockHeader::from_payload(ptr)).size };
            stats::record_alloc(self.pool_id, bytes);
        }
        ptr
    }

    #[cfg(not(feature = "sharded-classes"))]
    fn allocate_segregated(&self, class: usize) -> *mut u8 {
        let class_size = segregated::class_size(class);
        let ptr = {
            let mut inner = self.inner.lock();
            loop {
                let block = inner.classes.pop(class);
                if !block.is_null() {
                    // SAFETY: class lists hold initialized headers.
                    break unsafe { BlockHeader::payload(block) };
                }
                let (head, tail) = inner.arena.carve_segment(class_size);
                if head.is_null() {
                    break std::ptr::null_mut();
                }
                inner.classes.splice(class, head, tail);
            }
        };
        if !ptr.is_null() {
            stats::record_alloc(self.pool_id, class_size);
        }
        ptr
    }

    /// Sharded fast path: only the class mutex is taken on a hit; a miss
    /// replenishes under the arena lock and retries. Replenishment still
    /// funnels through the arena mutex, so per-class parallelism degrades
    /// when several classes miss at once.
    #[cfg(feature = "sharded-classes")]
    fn allocate_segregated(&self, class: usize) -> *mut u8 {
        let class_size = segregated::class_size(class);
        let ptr = loop {
            let block = self.classes.pop(class);
            if !block.is_null() {
                // SAFETY: class lists hold initialized headers.
                break unsafe { BlockHeader::payload(block) };
            }
            let mut inner = self.inner.lock();
            let (head, tail) = inner.arena.carve_segment(class_size);
            if head.is_null() {
                break std::ptr::null_mut();
            }
            // Class mutex nests inside the arena mutex here.
            self.classes.splice(class, head, tail);
            drop(inner);
        };
        if !ptr.is_null() {
            stats::record_alloc(self.pool_id, class_size);
        }
        ptr
    }

    #[cfg(not(feature = "sharded-classes"))]
    fn free_segregated(&self, inner: &mut PoolInner, block: *mut BlockHeader, size: usize) {
        match segregated::class_index(size) {
            Some(class) if segregated::class_size(class) == size => {
                inner.classes.push(class, block);
            }
            _ => inner.arena.insert_free(block),
        }
        stats::record_dealloc(self.pool_id, size);
    }

    /// Runs under the arena lock (the unified free path already holds it)
    /// and takes the class mutex for the splice itself. Moving this fully
    /// onto the class mutex is the tunable worth benchmarking.
    #[cfg(feature = "sharded-classes")]
    fn free_segregated(&self, inner: &mut PoolInner, block: *mut BlockHeader, size: usize) {
        match segregated::class_index(size) {
            Some(class) if segregated::class_size(class) == size => {
                self.classes.push(class, block);
            }
            _ => inner.arena.insert_free(block),
        }
        stats::record_dealloc(self.pool_id, size);
    }

    fn spill_cache(&self, state: &mut PoolThreadState) {
        for ptr in state.small.drain(..) {
            // SAFETY: cached pointers were carved by the matching slab.
            unsafe { self.slab_small.deallocate_raw(ptr) };
        }
        for ptr in state.medium.drain(..) {
            // SAFETY: cached pointers were carved by the matching slab.
            unsafe { self.slab_medium.deallocate_raw(ptr) };
        }
        for ptr in state.large.drain(..) {
            // SAFETY: cached pointers were carved by the matching slab.
            unsafe { self.slab_large.deallocate_raw(ptr) };
        }
    }
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new(true)
    }
}
