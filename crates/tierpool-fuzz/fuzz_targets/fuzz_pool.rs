#![no_main]
use libfuzzer_sys::fuzz_target;

use tierpool_core::{AllocationStrategy, MemoryPool};

fuzz_target!(|data: &[u8]| {
    // Parse data as a sequence of alloc/free/inspect operations.
    if data.len() < 4 {
        return;
    }

    let pool = MemoryPool::new(true);
    let mut live: Vec<*mut u8> = Vec::new();

    for chunk in data.chunks(4) {
        if chunk.len() < 4 {
            break;
        }
        let op = chunk[0] % 4;
        let size = u16::from_le_bytes([chunk[1], chunk[2]]) as usize;
        let strategy = match chunk[3] % 4 {
            0 => AllocationStrategy::BestFit,
            1 => AllocationStrategy::FixedSize,
            2 => AllocationStrategy::PoolBased,
            _ => AllocationStrategy::Segregated,
        };

        match op {
            0 => {
                // Allocate
                if let Some(ptr) = pool.allocate_with(size.min(65536), strategy) {
                    assert_eq!(ptr as usize % 16, 0);
                    live.push(ptr);
                }
            }
            1 => {
                // Free most recent
                if let Some(ptr) = live.pop() {
                    unsafe { pool.deallocate(ptr) };
                }
            }
            2 => {
                // Inspect an existing allocation
                if let Some(&ptr) = live.last() {
                    assert!(pool.owns_ptr(ptr));
                    let usable = unsafe { pool.usable_size(ptr) };
                    assert!(usable >= 16);
                }
            }
            _ => {
                // Aligned roundtrip
                let align = 16usize << (chunk[3] % 4);
                if let Some(ptr) = pool.allocate_aligned(size.min(4096), align) {
                    assert_eq!(ptr as usize % align, 0);
                    unsafe { pool.deallocate_aligned(ptr) };
                }
            }
        }
    }

    // Clean up
    for ptr in live {
        unsafe { pool.deallocate(ptr) };
    }
    pool.release_thread_cache();
});
