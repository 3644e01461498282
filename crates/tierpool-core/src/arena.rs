//! Coalescing best-fit arena over 1 MiB chunks.
//!
//! Free blocks live on an address-ordered doubly-linked list; a size
//! index keyed by (payload, header address) gives O(log n) best-fit
//! lookup and O(log n) removal by identity. The list gives constant-time
//! coalescing once the neighbours are known. Only blocks carrying the
//! BestFit tier tag coalesce; free blocks of other tiers sit on the list
//! untouched.
//!
//! All methods assume the caller holds the pool's arena mutex.

use std::collections::BTreeSet;

use crate::block::{BlockHeader, Tier, ALIGNMENT, HEADER_SIZE};

/// Byte size of every arena chunk.
pub const POOL_SIZE: usize = 1024 * 1024;

/// Smallest remainder payload worth splitting off during allocation.
pub const MIN_SPLIT_PAYLOAD: usize = 32;

pub(crate) struct Arena {
    /// Backing chunks, append-only until drop.
    chunks: Vec<*mut u8>,
    /// Head of the address-ordered free list.
    free_head: *mut BlockHeader,
    /// (payload, header address) for every free block on the list.
    size_index: BTreeSet<(usize, usize)>,
}

// SAFETY: the raw pointers reference chunk memory owned by this arena and
// are only dereferenced while the pool's arena mutex is held.
unsafe impl Send for Arena {}

impl Arena {
    /// Creates the arena with one chunk. A failed initial chunk allocation
    /// leaves the arena empty; the first allocation retries the growth.
    pub(crate) fn new() -> Self {
        let mut arena = Self {
            chunks: Vec::new(),
            free_head: std::ptr::null_mut(),
            size_index: BTreeSet::new(),
        };
        arena.add_chunk();
        arena
    }

    /// Best-fit allocation of `size` payload bytes (already aligned).
    ///
    /// Splits the chosen block when the remainder is worth keeping; grows
    /// the arena by one chunk on a miss. Returns null on exhaustion or
    /// when `size` exceeds what a single chunk can hold.
    pub(crate) fn best_fit(&mut self, size: usize) -> *mut u8 {
        if size > POOL_SIZE - HEADER_SIZE {
            return std::ptr::null_mut();
        }
        loop {
            let found = self.size_index.range((size, 0)..).next().copied();
            match found {
                Some((_, addr)) => {
                    let block = addr as *mut BlockHeader;
                    self.detach(block);
                    // SAFETY: indexed addresses always point at initialized
                    // free headers inside our chunks.
                    unsafe {
                        self.maybe_split(block, size);
                        (*block).is_free = false;
                        (*block).tier = Tier::BestFit;
                        return BlockHeader::payload(block);
                    }
                }
                None => {
                    if !self.add_chunk() {
                        return std::ptr::null_mut();
                    }
                }
            }
        }
    }

    /// First-fit scan in address order, no split. Retained so the
    /// pool-based policy stays comparable against best-fit.
    pub(crate) fn first_fit(&mut self, size: usize) -> *mut u8 {
        if size > POOL_SIZE - HEADER_SIZE {
            return std::ptr::null_mut();
        }
        loop {
            let mut cur = self.free_head;
            while !cur.is_null() {
                // SAFETY: list members always point at initialized headers.
                unsafe {
                    if (*cur).is_free && (*cur).size >= size {
                        self.detach(cur);
                        (*cur).is_free = false;
                        (*cur).tier = Tier::PoolBased;
                        return BlockHeader::payload(cur);
                    }
                    cur = (*cur).next;
                }
            }
            if !self.add_chunk() {
                return std::ptr::null_mut();
            }
        }
    }

    /// Inserts a block into the free list at its address position, then
    /// coalesces with adjacent free BestFit neighbours and indexes the
    /// surviving header.
    pub(crate) fn insert_free(&mut self, mut block: *mut BlockHeader) {
        // SAFETY: callers pass headers inside our chunks; list surgery only
        // touches headers already on the list.
        unsafe {
            (*block).is_free = true;
            (*block).next = std::ptr::null_mut();
            (*block).prev = std::ptr::null_mut();

            let mut cur = self.free_head;
            let mut prev: *mut BlockHeader = std::ptr::null_mut();
            while !cur.is_null() && (cur as usize) < (block as usize) {
                prev = cur;
                cur = (*cur).next;
            }
            (*block).prev = prev;
            (*block).next = cur;
            if prev.is_null() {
                self.free_head = block;
            } else {
                (*prev).next = block;
            }
            if !cur.is_null() {
                (*cur).prev = block;
            }

            if (*block).tier == Tier::BestFit {
                let next = (*block).next;
                if !next.is_null()
                    && BlockHeader::end_addr(block) == next as usize
                    && (*next).is_free
                    && (*next).tier == Tier::BestFit
                {
                    self.size_index.remove(&((*next).size, next as usize));
                    (*block).next = (*next).next;
                    if !(*next).next.is_null() {
                        (*(*next).next).prev = block;
                    }
                    (*block).size += HEADER_SIZE + (*next).size;
                }

                let before = (*block).prev;
                if !before.is_null()
                    && BlockHeader::end_addr(before) == block as usize
                    && (*before).is_free
                    && (*before).tier == Tier::BestFit
                {
                    self.size_index.remove(&((*before).size, before as usize));
                    (*before).size += HEADER_SIZE + (*block).size;
                    (*before).next = (*block).next;
                    if !(*block).next.is_null() {
                        (*(*block).next).prev = before;
                    }
                    block = before;
                }
            }

            self.size_index.insert(((*block).size, block as usize));
        }
    }

    /// Unlinks a free block from the list and the size index.
    pub(crate) fn detach(&mut self, block: *mut BlockHeader) {
        // SAFETY: `block` is a member of the free list.
        unsafe {
            self.size_index.remove(&((*block).size, block as usize));
            let prev = (*block).prev;
            let next = (*block).next;
            if prev.is_null() {
                self.free_head = next;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            (*block).next = std::ptr::null_mut();
            (*block).prev = std::ptr::null_mut();
        }
    }

    /// Carves one detached arena block into a linked segment of class
    /// blocks of `class_size` payload each. Returns (head, tail) of the
    /// segment, or nulls on system exhaustion. Any remainder bigger than
    /// a header goes back to the free list as a BestFit block.
    pub(crate) fn carve_segment(
        &mut self,
        class_size: usize,
    ) -> (*mut BlockHeader, *mut BlockHeader) {
        let step = HEADER_SIZE + class_size;

        let mut block = self.detach_youngest();
        // SAFETY: detached blocks are initialized headers inside our chunks.
        unsafe {
            if block.is_null() || HEADER_SIZE + (*block).size < step {
                if !block.is_null() {
                    self.insert_free(block);
                }
                block = self.new_chunk_block();
                if block.is_null() {
                    return (std::ptr::null_mut(), std::ptr::null_mut());
                }
            }

            let base = block.cast::<u8>();
            let total = HEADER_SIZE + (*block).size;
            let mut offset = 0;
            let mut head: *mut BlockHeader = std::ptr::null_mut();
            let mut tail: *mut BlockHeader = std::ptr::null_mut();
            while total - offset >= step {
                let piece = BlockHeader::init(base.add(offset), step, Tier::Segregated);
                if head.is_null() {
                    head = piece;
                } else {
                    (*tail).next = piece;
                }
                tail = piece;
                offset += step;
            }

            let remainder = total - offset;
            if remainder > HEADER_SIZE {
                let rest = BlockHeader::init(base.add(offset), remainder, Tier::BestFit);
                self.insert_free(rest);
            }

            (head, tail)
        }
    }

    /// Detaches the youngest free block: the highest-addressed one, i.e.
    /// the most recently created free region of the append-only chunk set.
    pub(crate) fn detach_youngest(&mut self) -> *mut BlockHeader {
        let mut cur = self.free_head;
        if cur.is_null() {
            return cur;
        }
        // SAFETY: list members always point at initialized headers.
        unsafe {
            while !(*cur).next.is_null() {
                cur = (*cur).next;
            }
        }
        self.detach(cur);
        cur
    }

    /// Whether `addr` falls inside one of the arena's chunks.
    pub(crate) fn owns(&self, addr: usize) -> bool {
        self.chunks
            .iter()
            .any(|&chunk| addr >= chunk as usize && addr < chunk as usize + POOL_SIZE)
    }

    /// Drops every free-list structure and reinitialises each chunk as one
    /// free block. O(chunks); no memory returns to the system.
    pub(crate) fn reset(&mut self) {
        self.free_head = std::ptr::null_mut();
        self.size_index.clear();
        let chunks = self.chunks.clone();
        for chunk in chunks {
            // SAFETY: every chunk is POOL_SIZE bytes of arena-owned memory.
            let block = unsafe { BlockHeader::init(chunk, POOL_SIZE, Tier::BestFit) };
            self.insert_free(block);
        }
    }

    /// Number of free blocks currently on the arena list.
    pub(crate) fn free_block_count(&self) -> usize {
        self.size_index.len()
    }

    /// Payload of the largest free block, or 0 when the list is empty.
    pub(crate) fn largest_free_payload(&self) -> usize {
        self.size_index
            .iter()
            .next_back()
            .map(|&(size, _)| size)
            .unwrap_or(0)
    }

    /// Splits `block` when the remainder would carry a worthwhile payload.
    ///
    /// # Safety
    ///
    /// `block` must be a detached, initialized header with at least `size`
    /// payload bytes.
    unsafe fn maybe_split(&mut self, block: *mut BlockHeader, size: usize) {
        unsafe {
            if (*block).size >= size + HEADER_SIZE + MIN_SPLIT_PAYLOAD {
                let rest_total = (*block).size - size;
                let rest = BlockHeader::init(
                    BlockHeader::payload(block).add(size),
                    rest_total,
                    Tier::BestFit,
                );
                (*block).size = size;
                self.insert_free(rest);
            }
        }
    }

    /// Grows the arena by one chunk inserted as a single free block.
    fn add_chunk(&mut self) -> bool {
        let block = self.new_chunk_block();
        if block.is_null() {
            return false;
        }
        self.insert_free(block);
        true
    }

    /// Allocates a chunk and returns its (detached) covering block.
    fn new_chunk_block(&mut self) -> *mut BlockHeader {
        let layout = chunk_layout();
        // SAFETY: layout has non-zero size and valid alignment.
        let chunk = unsafe { std::alloc::alloc(layout) };
        if chunk.is_null() {
            return std::ptr::null_mut();
        }
        self.chunks.push(chunk);
        // SAFETY: the fresh chunk is POOL_SIZE bytes, 16-aligned.
        unsafe { BlockHeader::init(chunk, POOL_SIZE, Tier::BestFit) }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let layout = chunk_layout();
        for &chunk in &self.chunks {
            // SAFETY: every chunk was allocated with this exact layout.
            unsafe { std::alloc::dealloc(chunk, layout) };
        }
    }
}

fn chunk_layout() -> std::alloc::Layout {
    // SAFETY: size and alignment are non-zero compile-time constants.
    unsafe { std::alloc::Layout::from_size_align_unchecked(POOL_SIZE, ALIGNMENT) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_size(ptr: *mut u8) -> usize {
        unsafe { (*BlockHeader::from_payload(ptr)).size }
    }

    #[test]
    fn fresh_arena_is_one_block() {
        let arena = Arena::new();
        assert_eq!(arena.free_block_count(), 1);
        assert_eq!(arena.largest_free_payload(), POOL_SIZE - HEADER_SIZE);
    }

    #[test]
    fn best_fit_splits_and_records_aligned_size() {
        let mut arena = Arena::new();
        let ptr = arena.best_fit(1024);
        assert!(!ptr.is_null());
        assert_eq!(payload_size(ptr), 1024);
        // The remainder went back as one free block.
        assert_eq!(arena.free_block_count(), 1);
        assert_eq!(
            arena.largest_free_payload(),
            POOL_SIZE - HEADER_SIZE - 1024 - HEADER_SIZE
        );
    }

    #[test]
    fn best_fit_absorbs_unsplittable_remainder() {
        let mut arena = Arena::new();
        // Leave a remainder smaller than header + MIN_SPLIT_PAYLOAD.
        let size = POOL_SIZE - HEADER_SIZE - 16;
        let ptr = arena.best_fit(size);
        assert!(!ptr.is_null());
        // Whole block handed out: usable exceeds the request.
        assert_eq!(payload_size(ptr), POOL_SIZE - HEADER_SIZE);
        assert_eq!(arena.free_block_count(), 0);
    }

    #[test]
    fn coalesce_restores_single_block() {
        let mut arena = Arena::new();
        let a = arena.best_fit(256);
        let b = arena.best_fit(512);
        let c = arena.best_fit(1024);
        unsafe {
            arena.insert_free(BlockHeader::from_payload(b));
            arena.insert_free(BlockHeader::from_payload(c));
            arena.insert_free(BlockHeader::from_payload(a));
        }
        assert_eq!(arena.free_block_count(), 1);
        assert_eq!(arena.largest_free_payload(), POOL_SIZE - HEADER_SIZE);
    }

    #[test]
    fn adjacent_pair_coalesces_into_sum_plus_header() {
        let mut arena = Arena::new();
        let a = arena.best_fit(256);
        let b = arena.best_fit(256);
        // Pin the tail so the pair cannot merge back into the main block.
        let _pin = arena.best_fit(64);
        unsafe {
            arena.insert_free(BlockHeader::from_payload(a));
            arena.insert_free(BlockHeader::from_payload(b));
            let merged = BlockHeader::from_payload(a);
            assert_eq!((*merged).size, 256 + HEADER_SIZE + 256);
        }
    }

    #[test]
    fn first_fit_takes_whole_block_in_address_order() {
        let mut arena = Arena::new();
        let a = arena.best_fit(4096);
        // Pin the space after `a` so the freed hole cannot coalesce with
        // the chunk tail.
        let _pin = arena.best_fit(64);
        unsafe { arena.insert_free(BlockHeader::from_payload(a)) };
        // First fitting block in address order is the 4096 hole, handed
        // out whole.
        let p = arena.first_fit(128);
        assert_eq!(p, a);
        assert_eq!(payload_size(p), 4096);
        unsafe {
            assert_eq!((*BlockHeader::from_payload(p)).tier, Tier::PoolBased);
        }
    }

    #[test]
    fn detach_youngest_takes_highest_address() {
        let mut arena = Arena::new();
        let a = arena.best_fit(256);
        let _hold = arena.best_fit(256);
        unsafe { arena.insert_free(BlockHeader::from_payload(a)) };
        // Free list now holds the 256 hole (low) and the chunk tail (high).
        let youngest = arena.detach_youngest();
        assert!(youngest as usize > a as usize);
        assert_eq!(arena.free_block_count(), 1);
    }

    #[test]
    fn carve_segment_builds_exact_class_blocks() {
        let mut arena = Arena::new();
        let (head, tail) = arena.carve_segment(512);
        assert!(!head.is_null() && !tail.is_null());

        let mut count = 0;
        let mut cur = head;
        unsafe {
            while !cur.is_null() {
                assert_eq!((*cur).size, 512);
                assert!((*cur).is_free);
                assert_eq!((*cur).tier, Tier::Segregated);
                count += 1;
                cur = (*cur).next;
            }
        }
        assert_eq!(count, POOL_SIZE / (512 + HEADER_SIZE));
    }

    #[test]
    fn reset_reinitialises_every_chunk() {
        let mut arena = Arena::new();
        for _ in 0..3 {
            // Force growth past the first chunk.
            let p = arena.best_fit(POOL_SIZE - HEADER_SIZE);
            assert!(!p.is_null());
        }
        assert!(arena.chunks.len() >= 3);
        arena.reset();
        // Contiguous chunks may coalesce across their boundary, so the
        // largest block is at least one full chunk.
        assert!(arena.largest_free_payload() >= POOL_SIZE - HEADER_SIZE);
        let p = arena.best_fit(POOL_SIZE - HEADER_SIZE);
        assert!(!p.is_null());
    }

    #[test]
    fn oversized_request_returns_null() {
        let mut arena = Arena::new();
        assert!(arena.best_fit(POOL_SIZE).is_null());
        assert!(arena.first_fit(POOL_SIZE).is_null());
    }

    #[test]
    fn owns_tracks_chunk_membership() {
        let mut arena = Arena::new();
        let p = arena.best_fit(64);
        assert!(arena.owns(p as usize));
        let local = 0u8;
        assert!(!arena.owns(std::ptr::addr_of!(local) as usize));
    }
}
