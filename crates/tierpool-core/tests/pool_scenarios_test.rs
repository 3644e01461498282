use tierpool_core::block::{BlockHeader, Tier};
use tierpool_core::segregated::SEGREGATED_CLASS_SIZES;
use tierpool_core::{AllocationStrategy, MemoryPool, HEADER_SIZE, POOL_SIZE};

fn tier_of(ptr: *mut u8) -> Tier {
    // SAFETY: tests only pass live pointers from the pool under test.
    unsafe { (*BlockHeader::from_payload(ptr)).tier }
}

#[test]
fn routing_lands_each_size_in_its_tier() {
    let pool = MemoryPool::new(true);

    let p32 = pool.allocate(32).expect("alloc 32");
    let p33 = pool.allocate(33).expect("alloc 33");
    let p129 = pool.allocate(129).expect("alloc 129");
    let p257 = pool.allocate(257).expect("alloc 257");
    let p513 = pool.allocate(513).expect("alloc 513");

    assert_eq!(tier_of(p32), Tier::FixedSize);
    assert_eq!(tier_of(p33), Tier::FixedSize);
    assert_eq!(tier_of(p129), Tier::FixedSize);
    assert_eq!(tier_of(p257), Tier::Segregated);
    assert_eq!(tier_of(p513), Tier::BestFit);

    // Slab and class hits report their block size; best-fit reports the
    // aligned request.
    unsafe {
        assert_eq!(pool.usable_size(p32), 32);
        assert_eq!(pool.usable_size(p33), 128);
        assert_eq!(pool.usable_size(p129), 256);
        assert_eq!(pool.usable_size(p257), 512);
        assert_eq!(pool.usable_size(p513), 528);

        pool.deallocate(p32);
        pool.deallocate(p33);
        pool.deallocate(p129);
        pool.deallocate(p257);
        pool.deallocate(p513);
    }
    pool.release_thread_cache();
}

#[test]
fn reverse_free_coalesces_to_single_chunk_block() {
    let pool = MemoryPool::new(true);

    // 900 blocks of 1024 + header fit inside one chunk.
    let ptrs: Vec<_> = (0..900)
        .map(|_| pool.allocate(1024).expect("arena alloc"))
        .collect();
    for &ptr in &ptrs {
        assert_eq!(tier_of(ptr), Tier::BestFit);
    }
    for &ptr in ptrs.iter().rev() {
        unsafe { pool.deallocate(ptr) };
    }

    assert_eq!(pool.arena_free_block_count(), 1);
    assert_eq!(pool.arena_largest_free_payload(), POOL_SIZE - HEADER_SIZE);
}

#[test]
fn reverse_free_across_chunk_growth() {
    let pool = MemoryPool::new(true);

    let ptrs: Vec<_> = (0..1000)
        .map(|_| pool.allocate(1024).expect("arena alloc"))
        .collect();
    for &ptr in ptrs.iter().rev() {
        unsafe { pool.deallocate(ptr) };
    }

    // One block per chunk, fewer if chunks happened to be contiguous.
    assert!(pool.arena_free_block_count() <= 2);
    assert!(pool.arena_largest_free_payload() >= POOL_SIZE - HEADER_SIZE);
}

#[test]
fn scope_releases_everything_allocated_inside_it() {
    let pool = MemoryPool::new(true);

    pool.merge_thread_stats();
    let before = pool.stats().outstanding_bytes;

    pool.begin_scope();
    let ptrs: Vec<_> = (0..10)
        .map(|_| pool.allocate(64).expect("scoped alloc"))
        .collect();
    pool.merge_thread_stats();
    assert!(pool.stats().outstanding_bytes > before);
    pool.end_scope();

    pool.merge_thread_stats();
    assert_eq!(
        pool.stats().outstanding_bytes,
        before,
        "live bytes must return to the pre-scope level"
    );

    // Every pointer is reusable after the bulk release.
    let again: Vec<_> = (0..10)
        .map(|_| pool.allocate(64).expect("realloc"))
        .collect();
    for ptr in &again {
        assert!(ptrs.contains(ptr));
    }
    for &ptr in &again {
        unsafe { pool.deallocate(ptr) };
    }
    pool.release_thread_cache();
}

#[test]
fn early_free_leaves_scope_consistent() {
    let pool = MemoryPool::new(true);

    pool.begin_scope();
    let a = pool.allocate(64).expect("alloc");
    let b = pool.allocate(64).expect("alloc");
    let c = pool.allocate(64).expect("alloc");
    // Free the middle pointer before the scope closes; end_scope must not
    // touch it again.
    unsafe { pool.deallocate(b) };
    pool.end_scope();

    // All three blocks are reusable afterwards.
    let again: Vec<_> = (0..3)
        .map(|_| pool.allocate(64).expect("realloc"))
        .collect();
    for ptr in [a, b, c] {
        assert!(again.contains(&ptr));
    }
    for &ptr in &again {
        unsafe { pool.deallocate(ptr) };
    }
    pool.release_thread_cache();
}

#[test]
fn unmatched_end_scope_is_tolerated() {
    let pool = MemoryPool::new(true);
    pool.end_scope();
    let ptr = pool.allocate(128).expect("alloc");
    unsafe { pool.deallocate(ptr) };
    pool.release_thread_cache();
}

#[test]
fn segregated_blocks_carry_exact_class_sizes() {
    let pool = MemoryPool::new(true);

    for &class_size in &SEGREGATED_CLASS_SIZES {
        let ptr = pool
            .allocate_with(class_size, AllocationStrategy::Segregated)
            .expect("segregated alloc");
        assert_eq!(tier_of(ptr), Tier::Segregated);
        unsafe {
            assert_eq!(pool.usable_size(ptr), class_size);
            pool.deallocate(ptr);
        }
    }

    // A request one byte over a class boundary lands in the next class.
    let ptr = pool
        .allocate_with(513, AllocationStrategy::Segregated)
        .expect("segregated alloc");
    unsafe {
        assert_eq!(pool.usable_size(ptr), 1024);
        pool.deallocate(ptr);
    }

    // Above the largest class the request falls through to best-fit.
    let ptr = pool
        .allocate_with(4097, AllocationStrategy::Segregated)
        .expect("fallback alloc");
    assert_eq!(tier_of(ptr), Tier::BestFit);
    unsafe { pool.deallocate(ptr) };
}

#[test]
fn adjacent_best_fit_blocks_coalesce() {
    let pool = MemoryPool::new(true);

    let a = pool.allocate(1024).expect("alloc");
    let b = pool.allocate(1024).expect("alloc");
    // Keep the tail of the chunk out of the way.
    let pin = pool.allocate(1024).expect("alloc");

    let before = pool.arena_free_block_count();
    unsafe {
        pool.deallocate(a);
        pool.deallocate(b);
    }
    // Two adjacent frees leave one free block of both payloads plus the
    // absorbed header.
    assert_eq!(pool.arena_free_block_count(), before + 1);
    unsafe {
        assert_eq!(
            (*BlockHeader::from_payload(a)).size,
            1024 + HEADER_SIZE + 1024
        );
        pool.deallocate(pin);
    }
}

#[test]
fn aligned_allocations_honour_alignment_and_size() {
    let pool = MemoryPool::new(true);

    let mut ptrs = Vec::new();
    for _ in 0..10 {
        let ptr = pool.allocate_aligned(100, 64).expect("aligned alloc");
        assert_eq!(ptr as usize % 64, 0);
        let usable = unsafe { pool.usable_size_aligned(ptr) };
        assert!(usable >= 112, "usable {usable} must cover the aligned request");
        ptrs.push(ptr);
    }
    for ptr in ptrs {
        unsafe { pool.deallocate_aligned(ptr) };
    }

    // Larger power-of-two alignments hold as well.
    for shift in 4..=12 {
        let align = 1usize << shift;
        let ptr = pool.allocate_aligned(256, align).expect("aligned alloc");
        assert_eq!(ptr as usize % align, 0);
        unsafe { pool.deallocate_aligned(ptr) };
    }

    // Misuse is reported as exhaustion, not a panic.
    assert!(pool.allocate_aligned(64, 24).is_none());
    assert!(pool.allocate_aligned(64, 8).is_none());
    pool.release_thread_cache();
}

#[test]
fn reset_restores_full_capacity() {
    let pool = MemoryPool::new(true);

    let mut live = Vec::new();
    for i in 0..200 {
        live.push(pool.allocate(16 + (i % 256) * 16).expect("alloc"));
    }
    // Leak half of them deliberately; reset reclaims everything.
    for &ptr in live.iter().step_by(2) {
        unsafe { pool.deallocate(ptr) };
    }

    pool.reset();
    assert_eq!(pool.stats().outstanding_bytes, 0);

    let big = pool
        .allocate(POOL_SIZE - HEADER_SIZE - 16)
        .expect("post-reset alloc must succeed");
    assert_eq!(tier_of(big), Tier::BestFit);
    unsafe { pool.deallocate(big) };
    pool.release_thread_cache();
}
