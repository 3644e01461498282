//! Segregated free lists for mid-size allocations.
//!
//! Eight singly-linked LIFO class lists; every block on class `i` has a
//! payload of exactly `SEGREGATED_CLASS_SIZES[i]` and carries the
//! Segregated tier tag. Class selection rounds up to the smallest class
//! that fits; requests above the largest class report no class and the
//! facade falls through to the best-fit arena.
//!
//! With the `sharded-classes` feature each class head sits behind its own
//! mutex so the allocation fast path avoids the arena lock; without it,
//! the heads live inside the arena-guarded pool state and inherit its
//! lock. Lock order when both are needed: arena mutex before class mutex.

use crate::block::{BlockHeader, Tier};

#[cfg(feature = "sharded-classes")]
use parking_lot::Mutex;

/// Payload sizes of the eight segregated classes.
pub const SEGREGATED_CLASS_SIZES: [usize; 8] = [32, 64, 128, 256, 512, 1024, 2048, 4096];

/// Number of segregated classes.
pub const SEGREGATED_CLASS_COUNT: usize = SEGREGATED_CLASS_SIZES.len();

/// Smallest class whose payload fits `size`, or `None` above 4096.
#[inline]
pub fn class_index(size: usize) -> Option<usize> {
    SEGREGATED_CLASS_SIZES.iter().position(|&class| class >= size)
}

/// Payload size of class `index`.
#[inline]
pub fn class_size(index: usize) -> usize {
    SEGREGATED_CLASS_SIZES[index]
}

/// The eight class list heads, arena-locked variant.
#[cfg(not(feature = "sharded-classes"))]
pub(crate) struct ClassLists {
    heads: [*mut BlockHeader; SEGREGATED_CLASS_COUNT],
}

// SAFETY: the heads reference pool-owned chunk memory and are only touched
// while the caller holds the arena mutex guarding this structure.
#[cfg(not(feature = "sharded-classes"))]
unsafe impl Send for ClassLists {}

#[cfg(not(feature = "sharded-classes"))]
impl ClassLists {
    pub(crate) fn new() -> Self {
        Self {
            heads: [std::ptr::null_mut(); SEGREGATED_CLASS_COUNT],
        }
    }

    /// Pops the head of class `class`, clearing its free flag.
    pub(crate) fn pop(&mut self, class: usize) -> *mut BlockHeader {
        let block = self.heads[class];
        if block.is_null() {
            return block;
        }
        // SAFETY: list heads always point at initialized headers.
        unsafe {
            self.heads[class] = (*block).next;
            (*block).next = std::ptr::null_mut();
            (*block).is_free = false;
        }
        block
    }

    /// Pushes a block, stamping it free and Segregated. Callers route only
    /// class-sized blocks here.
    pub(crate) fn push(&mut self, class: usize, block: *mut BlockHeader) {
        // SAFETY: `block` points at an initialized header owned by the pool.
        unsafe {
            (*block).is_free = true;
            (*block).tier = Tier::Segregated;
            (*block).prev = std::ptr::null_mut();
            (*block).next = self.heads[class];
        }
        self.heads[class] = block;
    }

    /// Splices a pre-linked segment (head..=tail) onto the class head.
    pub(crate) fn splice(&mut self, class: usize, head: *mut BlockHeader, tail: *mut BlockHeader) {
        debug_assert!(!head.is_null() && !tail.is_null());
        // SAFETY: the segment was linked by the carver from pool memory.
        unsafe { (*tail).next = self.heads[class] };
        self.heads[class] = head;
    }

    /// Drops every class list (pool reset).
    pub(crate) fn clear(&mut self) {
        self.heads = [std::ptr::null_mut(); SEGREGATED_CLASS_COUNT];
    }
}

#[cfg(feature = "sharded-classes")]
struct ClassHead(*mut BlockHeader);

// SAFETY: the head references pool-owned chunk memory and is only touched
// while its class mutex is held.
#[cfg(feature = "sharded-classes")]
unsafe impl Send for ClassHead {}

/// The eight class list heads, one mutex per class.
#[cfg(feature = "sharded-classes")]
pub(crate) struct ClassLists {
    heads: [Mutex<ClassHead>; SEGREGATED_CLASS_COUNT],
}

#[cfg(feature = "sharded-classes")]
impl ClassLists {
    pub(crate) fn new() -> Self {
        Self {
            heads: std::array::from_fn(|_| Mutex::new(ClassHead(std::ptr::null_mut()))),
        }
    }

    /// Pops the head of class `class` under the class mutex only.
    pub(crate) fn pop(&self, class: usize) -> *mut BlockHeader {
        let mut head = self.heads[class].lock();
        let block = head.0;
        if block.is_null() {
            return block;
        }
        // SAFETY: list heads always point at initialized headers.
        unsafe {
            head.0 = (*block).next;
            (*block).next = std::ptr::null_mut();
            (*block).is_free = false;
        }
        block
    }

    /// Pushes a block under the class mutex, stamping it free and Segregated.
    pub(crate) fn push(&self, class: usize, block: *mut BlockHeader) {
        let mut head = self.heads[class].lock();
        // SAFETY: `block` points at an initialized header owned by the pool.
        unsafe {
            (*block).is_free = true;
            (*block).tier = Tier::Segregated;
            (*block).prev = std::ptr::null_mut();
            (*block).next = head.0;
        }
        head.0 = block;
    }

    /// Splices a pre-linked segment (head..=tail) onto the class head.
    pub(crate) fn splice(&self, class: usize, head: *mut BlockHeader, tail: *mut BlockHeader) {
        debug_assert!(!head.is_null() && !tail.is_null());
        let mut list = self.heads[class].lock();
        // SAFETY: the segment was linked by the carver from pool memory.
        unsafe { (*tail).next = list.0 };
        list.0 = head;
    }

    /// Drops every class list (pool reset).
    pub(crate) fn clear(&self) {
        for head in &self.heads {
            head.lock().0 = std::ptr::null_mut();
        }
    }
}
