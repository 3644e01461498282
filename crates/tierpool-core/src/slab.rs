//! Fixed-size slab allocators for the three small block sizes.
//!
//! Each slab owns a list of 64 KiB chunks carved into equal blocks of
//! `BLOCK` payload bytes, linked into a LIFO free list behind a private
//! mutex. The stats-writing `allocate`/`deallocate` pair serves direct
//! calls from the pool facade; the `_raw` variants do the same pointer
//! work without touching the counters so thread-cache refills do not show
//! up as user-visible allocations.

use parking_lot::Mutex;

use crate::block::{BlockHeader, Tier, ALIGNMENT, HEADER_SIZE};
use crate::stats;

/// Byte size of every slab chunk.
pub const SLAB_CHUNK_SIZE: usize = 64 * 1024;

struct SlabInner {
    /// Backing chunks, append-only until drop.
    chunks: Vec<*mut u8>,
    /// LIFO of free headers.
    free_list: *mut BlockHeader,
}

// SAFETY: the raw pointers reference chunk memory owned by this slab and
// are only dereferenced while the mutex is held.
unsafe impl Send for SlabInner {}

/// Slab allocator handing out blocks of exactly `BLOCK` payload bytes.
pub(crate) struct FixedSizeAllocator<const BLOCK: usize> {
    pool_id: u64,
    inner: Mutex<SlabInner>,
}

impl<const BLOCK: usize> FixedSizeAllocator<BLOCK> {
    /// Number of blocks carved out of one chunk.
    pub(crate) const BLOCKS_PER_CHUNK: usize = SLAB_CHUNK_SIZE / (BLOCK + HEADER_SIZE);

    /// Creates the slab and carves its first chunk.
    pub(crate) fn new(pool_id: u64) -> Self {
        let mut inner = SlabInner {
            chunks: Vec::new(),
            free_list: std::ptr::null_mut(),
        };
        Self::add_chunk(&mut inner);
        Self {
            pool_id,
            inner: Mutex::new(inner),
        }
    }

    /// Pops a block, refilling from a fresh chunk when the list is empty.
    ///
    /// Returns the payload pointer, or null when the system allocator is
    /// exhausted. Records one user-visible allocation.
    pub(crate) fn allocate(&self) -> *mut u8 {
        let mut inner = self.inner.lock();
        let ptr = Self::pop_locked(&mut inner);
        if !ptr.is_null() {
            stats::record_alloc(self.pool_id, BLOCK);
        }
        ptr
    }

    /// Returns a payload pointer to the free list. Records one deallocation.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live payload pointer produced by this slab.
    pub(crate) unsafe fn deallocate(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let mut inner = self.inner.lock();
        // SAFETY: caller guarantees `ptr` came from this slab.
        unsafe { Self::push_locked(&mut inner, ptr) };
        stats::record_dealloc(self.pool_id, BLOCK);
    }

    /// Pops up to `max` blocks into `out` under a single lock acquisition.
    ///
    /// Stats-silent: the blocks move into a thread cache as a pre-fetched
    /// reservoir, not as user allocations. Cached blocks keep their free
    /// flag set.
    pub(crate) fn allocate_batch_raw(&self, out: &mut Vec<*mut u8>, max: usize) {
        let mut inner = self.inner.lock();
        for _ in 0..max {
            if inner.free_list.is_null() && !Self::add_chunk(&mut inner) {
                break;
            }
            let block = inner.free_list;
            // SAFETY: non-null list heads always point at initialized headers.
            unsafe {
                inner.free_list = (*block).next;
                (*block).next = std::ptr::null_mut();
                out.push(BlockHeader::payload(block));
            }
        }
    }

    /// Returns a payload pointer to the free list without touching stats.
    ///
    /// Used when spilling thread-cache contents back at thread teardown or
    /// pool reset.
    ///
    /// # Safety
    ///
    /// `ptr` must be a payload pointer produced by this slab.
    pub(crate) unsafe fn deallocate_raw(&self, ptr: *mut u8) {
        let mut inner = self.inner.lock();
        // SAFETY: caller guarantees `ptr` came from this slab.
        unsafe { Self::push_locked(&mut inner, ptr) };
    }

    /// Whether `addr` falls inside one of this slab's chunks.
    pub(crate) fn owns(&self, addr: usize) -> bool {
        let inner = self.inner.lock();
        inner
            .chunks
            .iter()
            .any(|&chunk| addr >= chunk as usize && addr < chunk as usize + SLAB_CHUNK_SIZE)
    }

    fn pop_locked(inner: &mut SlabInner) -> *mut u8 {
        if inner.free_list.is_null() && !Self::add_chunk(inner) {
            return std::ptr::null_mut();
        }
        let block = inner.free_list;
        // SAFETY: non-null list heads always point at initialized headers.
        unsafe {
            inner.free_list = (*block).next;
            (*block).next = std::ptr::null_mut();
            (*block).is_free = false;
            (*block).tier = Tier::FixedSize;
            BlockHeader::payload(block)
        }
    }

    unsafe fn push_locked(inner: &mut SlabInner, ptr: *mut u8) {
        // SAFETY: caller guarantees `ptr` is a payload pointer from this slab.
        let block = unsafe { BlockHeader::from_payload(ptr) };
        unsafe {
            (*block).is_free = true;
            (*block).next = inner.free_list;
        }
        inner.free_list = block;
    }

    /// Allocates and carves one chunk. Returns false on system exhaustion.
    fn add_chunk(inner: &mut SlabInner) -> bool {
        let layout = chunk_layout();
        // SAFETY: layout has non-zero size and valid alignment.
        let chunk = unsafe { std::alloc::alloc(layout) };
        if chunk.is_null() {
            return false;
        }
        inner.chunks.push(chunk);

        let step = BLOCK + HEADER_SIZE;
        for i in 0..Self::BLOCKS_PER_CHUNK {
            // SAFETY: each step stays within the chunk; chunk base is
            // 16-aligned and `step` is a multiple of 16.
            unsafe {
                let block = BlockHeader::init(chunk.add(i * step), step, Tier::FixedSize);
                (*block).next = inner.free_list;
                inner.free_list = block;
            }
        }
        true
    }
}

impl<const BLOCK: usize> Drop for FixedSizeAllocator<BLOCK> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let layout = chunk_layout();
        for &chunk in &inner.chunks {
            // SAFETY: every chunk was allocated with this exact layout.
            unsafe { std::alloc::dealloc(chunk, layout) };
        }
    }
}

fn chunk_layout() -> std::alloc::Layout {
    // SAFETY: size and alignment are non-zero compile-time constants.
    unsafe { std::alloc::Layout::from_size_align_unchecked(SLAB_CHUNK_SIZE, ALIGNMENT) }
}
