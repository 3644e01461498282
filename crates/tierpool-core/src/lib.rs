//! Thread-aware tiered memory pool for churn-heavy workloads.
//!
//! tierpool serves reinforcement-learning and inference loops: many
//! small, aligned, short-lived buffers allocated and freed at high rate
//! across several worker threads, interleaved with occasional medium and
//! large buffers. Every block carries a 16-byte-aligned header prefix, so
//! any pointer can be deallocated from the header alone.
//!
//! # Architecture
//!
//! - **Block header** (`block`): size, free flag, and tier tag prefixed to
//!   every allocation
//! - **Slab allocators** (`slab`): 64 KiB chunks carved into 32/128/256-byte
//!   blocks behind leaf mutexes
//! - **Thread cache** (`thread_cache`): lockless per-thread LIFOs batch-refilled
//!   from the slabs
//! - **Segregated lists** (`segregated`): eight size classes, optionally one
//!   mutex per class (`sharded-classes` feature)
//! - **Best-fit arena** (`arena`): address-ordered coalescing free list with a
//!   size index over 1 MiB chunks
//! - **Scopes** (`scope`): bracketed allocation regions released en masse
//! - **Stats** (`stats`): per-thread counters merged into per-pool atomics
//! - **Facade** (`pool`): size routing, strategy overrides, the aligned-pointer
//!   shim, and the tier-tag deallocation router
//!
//! The pool is not a drop-in global allocator; it exposes a byte-oriented
//! interface consumed by benchmark harnesses and adapters.
//!
//! # Example
//!
//! ```
//! use tierpool_core::MemoryPool;
//!
//! let pool = MemoryPool::new(true);
//! let ptr = pool.allocate(100).expect("allocation");
//! assert_eq!(ptr as usize % 16, 0);
//! unsafe {
//!     assert!(pool.usable_size(ptr) >= 112);
//!     pool.deallocate(ptr);
//! }
//! ```

pub mod block;
pub mod segregated;

mod arena;
mod pool;
mod scope;
mod slab;
mod stats;
mod thread_cache;

pub use arena::{MIN_SPLIT_PAYLOAD, POOL_SIZE};
pub use block::{ALIGNMENT, HEADER_SIZE};
pub use pool::{AllocationStrategy, MemoryPool};
pub use slab::SLAB_CHUNK_SIZE;
pub use stats::StatsSnapshot;
pub use thread_cache::{
    LARGE_CACHE_LIMIT, LARGE_REFILL_BATCH, MEDIUM_CACHE_LIMIT, MEDIUM_REFILL_BATCH,
    SMALL_CACHE_LIMIT, SMALL_REFILL_BATCH,
};
