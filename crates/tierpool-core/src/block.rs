//! Block header metadata prefixed to every allocation.
//!
//! Every pointer handed out by the pool is preceded by a [`BlockHeader`]
//! that records the payload size, the free flag, and the tier that produced
//! the block. Deallocation recovers everything it needs from this prefix
//! alone; no side table is consulted on the free path.

/// Payload alignment guaranteed by every allocation path (AVX2-friendly).
pub const ALIGNMENT: usize = 16;

/// Provenance of a block, written at allocation time and read on free.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Variable-size block from the coalescing best-fit arena.
    BestFit = 0,
    /// Block from one of the three fixed-size slab allocators.
    FixedSize = 1,
    /// Arena block handed out by the first-fit pool scan.
    PoolBased = 2,
    /// Block belonging to one of the eight segregated size classes.
    Segregated = 3,
}

/// Metadata prefix for every block managed by the pool.
///
/// The header is 16-byte aligned, so the payload that starts immediately
/// after it is 16-byte aligned as well. The `next`/`prev` links are only
/// meaningful while the block sits on a free list.
#[repr(C, align(16))]
pub struct BlockHeader {
    /// Next block on the owning free list (null when detached).
    pub next: *mut BlockHeader,
    /// Previous block on the arena free list (unused by singly-linked tiers).
    pub prev: *mut BlockHeader,
    /// Payload byte count, recorded as requested-after-alignment.
    pub size: usize,
    /// Whether the block currently sits on a free list or thread cache.
    pub is_free: bool,
    /// Tier that produced the block.
    pub tier: Tier,
}

/// Size of the header prefix in bytes.
pub const HEADER_SIZE: usize = std::mem::size_of::<BlockHeader>();

const _: () = assert!(HEADER_SIZE % ALIGNMENT == 0);
const _: () = assert!(std::mem::align_of::<BlockHeader>() == ALIGNMENT);

impl BlockHeader {
    /// Rounds a requested size up to the next [`ALIGNMENT`] boundary.
    #[inline]
    pub const fn align_size(size: usize) -> usize {
        (size + ALIGNMENT - 1) & !(ALIGNMENT - 1)
    }

    /// Initializes a header at `ptr` covering `total` bytes (header included).
    ///
    /// Returns the header pointer. The block starts out free with no links.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes of `total` bytes, 16-byte aligned, and
    /// `total` must be at least [`HEADER_SIZE`].
    #[inline]
    pub unsafe fn init(ptr: *mut u8, total: usize, tier: Tier) -> *mut BlockHeader {
        debug_assert!(total >= HEADER_SIZE);
        debug_assert_eq!(ptr as usize % ALIGNMENT, 0);
        let block = ptr.cast::<BlockHeader>();
        unsafe {
            (*block).next = std::ptr::null_mut();
            (*block).prev = std::ptr::null_mut();
            (*block).size = total - HEADER_SIZE;
            (*block).is_free = true;
            (*block).tier = tier;
        }
        block
    }

    /// Returns the payload pointer for a header.
    ///
    /// # Safety
    ///
    /// `block` must point to an initialized header.
    #[inline]
    pub unsafe fn payload(block: *mut BlockHeader) -> *mut u8 {
        unsafe { block.add(1).cast::<u8>() }
    }

    /// Recovers the header from a payload pointer handed out by the pool.
    ///
    /// # Safety
    ///
    /// `ptr` must be a payload pointer previously produced by
    /// [`BlockHeader::payload`] on a live header.
    #[inline]
    pub unsafe fn from_payload(ptr: *mut u8) -> *mut BlockHeader {
        unsafe { ptr.sub(HEADER_SIZE).cast::<BlockHeader>() }
    }

    /// Address one past the end of this block (header + payload).
    ///
    /// # Safety
    ///
    /// `block` must point to an initialized header.
    #[inline]
    pub unsafe fn end_addr(block: *mut BlockHeader) -> usize {
        block as usize + HEADER_SIZE + unsafe { (*block).size }
    }
}
