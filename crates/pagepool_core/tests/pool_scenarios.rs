//! # Segmented Pool Verification Tests
//!
//! End-to-end checks of the allocator contract:
//!
//! 1. **Uniqueness**: live blocks never overlap
//! 2. **Reuse**: freed blocks are handed out before any page is added
//! 3. **Guard bytes**: overruns are reported, clean returns never are
//! 4. **Growth and reclaim**: page accounting across page boundaries
//!
//! Run with: cargo test -p pagepool_core --test pool_scenarios -- --nocapture

// Tests poke at raw block memory on purpose.
#![allow(unsafe_code)]

use std::collections::HashSet;
use std::ptr::NonNull;

use pagepool_core::{
    GuardRegion, PoolConfig, PoolError, RecordingReporter, SegmentedPoolAllocator, Severity,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn pool_with_recorder(
    block_size: usize,
    blocks_per_page: usize,
) -> (SegmentedPoolAllocator, RecordingReporter) {
    init_tracing();
    let reporter = RecordingReporter::new();
    let config = PoolConfig::new(block_size, blocks_per_page).with_signatures(true);
    let pool = SegmentedPoolAllocator::with_reporter(config, reporter.clone()).unwrap();
    (pool, reporter)
}

fn corruption_count(reporter: &RecordingReporter) -> usize {
    reporter.count_matching(|e| matches!(e, PoolError::CorruptionDetected { .. }))
}

// ============================================================================
// UNIQUENESS
// ============================================================================

#[test]
fn verify_live_blocks_never_overlap() {
    let (mut pool, reporter) = pool_with_recorder(40, 7);

    let blocks: Vec<NonNull<u8>> = (0..50).map(|_| pool.allocate().unwrap()).collect();

    let mut ranges: Vec<(usize, usize)> = blocks
        .iter()
        .map(|b| (b.as_ptr() as usize, b.as_ptr() as usize + 40))
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "blocks overlap: {pair:?}");
    }

    // Fill every block completely, then verify nothing bled across.
    for (i, block) in blocks.iter().enumerate() {
        unsafe { std::ptr::write_bytes(block.as_ptr(), i as u8, 40) };
    }
    for (i, block) in blocks.iter().enumerate() {
        let bytes = unsafe { std::slice::from_raw_parts(block.as_ptr(), 40) };
        assert!(bytes.iter().all(|&b| b == i as u8));
    }

    for block in blocks {
        pool.deallocate(block).unwrap();
    }
    assert_eq!(corruption_count(&reporter), 0);
}

// ============================================================================
// REUSE BEFORE GROWTH
// ============================================================================

#[test]
fn verify_free_blocks_reused_before_growth() {
    let (mut pool, _) = pool_with_recorder(16, 4);

    let blocks: Vec<_> = (0..4).map(|_| pool.allocate().unwrap()).collect();
    assert_eq!(pool.page_count(), 1);

    for _ in 0..100 {
        pool.deallocate(blocks[1]).unwrap();
        let again = pool.allocate().unwrap();
        assert_eq!(again, blocks[1]);
        assert_eq!(pool.page_count(), 1);
    }

    // Free list is empty now: the next request must grow.
    let extra = pool.allocate().unwrap();
    assert_eq!(pool.page_count(), 2);
    assert!(!blocks.contains(&extra));
}

// ============================================================================
// GUARD BYTES
// ============================================================================

#[test]
fn verify_guard_bytes_catch_overruns() {
    let (mut pool, reporter) = pool_with_recorder(16, 4);

    let clean = pool.allocate().unwrap();
    unsafe { std::ptr::write_bytes(clean.as_ptr(), 0xFF, 16) };
    pool.deallocate(clean).unwrap();
    assert_eq!(corruption_count(&reporter), 0);

    let overflow = pool.allocate().unwrap();
    unsafe { std::ptr::write_bytes(overflow.as_ptr(), 0xFF, 17) };
    pool.deallocate(overflow).unwrap();

    let underflow = pool.allocate().unwrap();
    unsafe { underflow.as_ptr().sub(4).write(0) };
    pool.deallocate(underflow).unwrap();

    let reports = reporter.reports();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|(severity, _)| *severity == Severity::Error));
    assert!(matches!(
        reports[0].1,
        PoolError::CorruptionDetected { region: GuardRegion::Trailing, .. }
    ));
    assert!(matches!(
        reports[1].1,
        PoolError::CorruptionDetected { region: GuardRegion::Leading, .. }
    ));

    // Both corrupted blocks were recycled and the pool is whole again.
    assert_eq!(pool.allocated_count(), 0);
    assert_eq!(pool.free_count(), 4);
}

// ============================================================================
// GROWTH AND PAGE ACCOUNTING
// ============================================================================

#[test]
fn verify_one_extra_page_for_k_plus_one() {
    const K: usize = 8;
    let (mut pool, _) = pool_with_recorder(24, K);

    let blocks: Vec<_> = (0..=K).map(|_| pool.allocate().unwrap()).collect();
    assert_eq!(pool.page_count(), 2);

    let unique: HashSet<_> = blocks.iter().collect();
    assert_eq!(unique.len(), K + 1);
    assert!(blocks.iter().all(|b| pool.is_allocated(*b)));
}

#[test]
fn verify_page_in_use_counters() {
    let (mut pool, _) = pool_with_recorder(8, 3);

    let blocks: Vec<_> = (0..8).map(|_| pool.allocate().unwrap()).collect();
    assert_eq!(pool.page_usage(), vec![3, 3, 2]);

    for index in [0, 3, 4, 7] {
        pool.deallocate(blocks[index]).unwrap();
    }
    assert_eq!(pool.page_usage(), vec![2, 1, 1]);

    // Refill: LIFO hands out 7, 4, 3, 0 in that order.
    let refilled: Vec<_> = (0..4).map(|_| pool.allocate().unwrap()).collect();
    assert_eq!(
        refilled,
        vec![blocks[7], blocks[4], blocks[3], blocks[0]]
    );
    assert_eq!(pool.page_usage(), vec![3, 3, 2]);
    assert_eq!(pool.page_count(), 3);
}

#[test]
fn verify_reclaim_scenario() {
    let (mut pool, reporter) = pool_with_recorder(16, 4);

    let blocks: Vec<_> = (0..5).map(|_| pool.allocate().unwrap()).collect();
    assert_eq!(pool.page_count(), 2);
    assert_eq!(blocks.iter().collect::<HashSet<_>>().len(), 5);

    for block in &blocks[..4] {
        pool.deallocate(*block).unwrap();
    }
    assert_eq!(pool.page_usage(), vec![0, 1]);

    assert_eq!(pool.reclaim_empty_pages(), 1);
    assert_eq!(pool.page_count(), 1);
    assert_eq!(pool.page_usage(), vec![1]);
    assert!(pool.is_allocated(blocks[4]));

    // The freed page's addresses are gone from the free list.
    let next = pool.allocate().unwrap();
    assert!(!blocks[..4].contains(&next));
    assert_eq!(pool.page_count(), 1);
    assert_eq!(pool.page_usage(), vec![2]);

    pool.deallocate(next).unwrap();
    pool.deallocate(blocks[4]).unwrap();
    assert!(reporter.is_empty());
}

#[test]
fn verify_reclaim_never_frees_busy_pages() {
    let (mut pool, _) = pool_with_recorder(32, 2);

    let blocks: Vec<_> = (0..6).map(|_| pool.allocate().unwrap()).collect();
    for block in blocks.iter().step_by(2) {
        pool.deallocate(*block).unwrap();
    }
    assert_eq!(pool.page_usage(), vec![1, 1, 1]);
    assert_eq!(pool.reclaim_empty_pages(), 0);
    assert_eq!(pool.page_count(), 3);

    // Survivors are still readable and writable.
    for block in blocks.iter().skip(1).step_by(2) {
        unsafe { std::ptr::write_bytes(block.as_ptr(), 0x5A, 32) };
        pool.deallocate(*block).unwrap();
    }
    assert_eq!(pool.reclaim_empty_pages(), 3);
    assert_eq!(pool.page_count(), 0);
}

#[test]
fn verify_config_file_drives_pool() {
    let config = PoolConfig::from_toml_str(
        r#"
        block_size = 96
        blocks_per_page = 16
        stamp_signatures = true
        "#,
    )
    .unwrap();

    let pool = SegmentedPoolAllocator::with_config(config).unwrap();
    let stats = pool.stats();
    assert_eq!(stats.block_size, 96);
    assert_eq!(stats.blocks_per_page, 16);
    assert_eq!(stats.capacity(), 16);
    assert!(pool.stamps_signatures());
}

#[test]
fn verify_shipped_config_loads() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config/particles.toml");
    let config = PoolConfig::from_toml(path).unwrap();

    let mut pool = SegmentedPoolAllocator::with_config(config).unwrap();
    assert_eq!(pool.block_size(), 48);
    assert_eq!(pool.capacity(), 256);

    let block = pool.allocate().unwrap();
    pool.deallocate(block).unwrap();
}
