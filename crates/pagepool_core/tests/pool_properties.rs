//! Property tests for allocate/deallocate/reclaim invariants.
//!
//! After any sequence of operations:
//! - live blocks are pairwise distinct and match a shadow model
//! - per-page in-use counters sum to the live block count
//! - `allocated + free == capacity`
//! - clean returns never report corruption

use std::collections::HashSet;
use std::ptr::NonNull;

use pagepool_core::{PoolConfig, PoolError, RecordingReporter, SegmentedPoolAllocator};
use proptest::prelude::*;

// ---------------------------------------------------------------------------
// Operation model
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
enum Op {
    Allocate,
    /// Free the live block at this position (modulo the live count).
    Free(usize),
    Reclaim,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        5 => Just(Op::Allocate),
        4 => any::<usize>().prop_map(Op::Free),
        1 => Just(Op::Reclaim),
    ]
}

fn check_invariants(pool: &SegmentedPoolAllocator, live: &[NonNull<u8>]) {
    let usage = pool.page_usage();
    assert_eq!(usage.len(), pool.page_count());
    assert_eq!(usage.iter().sum::<usize>(), live.len());
    assert!(usage.iter().all(|&n| n <= pool.blocks_per_page()));

    assert_eq!(pool.allocated_count(), live.len());
    assert_eq!(pool.allocated_count() + pool.free_count(), pool.capacity());

    let distinct: HashSet<_> = live.iter().collect();
    assert_eq!(distinct.len(), live.len());

    let reported: HashSet<_> = pool.allocated_blocks().collect();
    assert_eq!(reported, live.iter().copied().collect::<HashSet<_>>());
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn bookkeeping_matches_model(
        block_size in 1usize..96,
        blocks_per_page in 1usize..9,
        ops in prop::collection::vec(op_strategy(), 1..200),
    ) {
        let reporter = RecordingReporter::new();
        let config = PoolConfig::new(block_size, blocks_per_page).with_signatures(true);
        let mut pool = SegmentedPoolAllocator::with_reporter(config, reporter.clone()).unwrap();
        let mut live: Vec<NonNull<u8>> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate => {
                    let pages_before = pool.page_count();
                    let had_free = pool.free_count() > 0;
                    live.push(pool.allocate().unwrap());
                    if had_free {
                        prop_assert_eq!(pool.page_count(), pages_before);
                    } else {
                        prop_assert_eq!(pool.page_count(), pages_before + 1);
                    }
                }
                Op::Free(i) if !live.is_empty() => {
                    let block = live.swap_remove(i % live.len());
                    pool.deallocate(block).unwrap();
                    prop_assert!(!pool.is_allocated(block));
                }
                Op::Free(_) => {}
                Op::Reclaim => {
                    let empty = pool.page_usage().iter().filter(|&&n| n == 0).count();
                    prop_assert_eq!(pool.reclaim_empty_pages(), empty);
                    prop_assert!(pool.page_usage().iter().all(|&n| n > 0));
                }
            }
            check_invariants(&pool, &live);
        }

        for block in live.drain(..) {
            pool.deallocate(block).unwrap();
        }
        prop_assert_eq!(
            reporter.count_matching(|e| matches!(e, PoolError::CorruptionDetected { .. })),
            0
        );
    }

    #[test]
    fn next_allocation_reuses_last_free(
        blocks_per_page in 1usize..6,
        count in 1usize..20,
        pick in any::<usize>(),
    ) {
        let mut pool = SegmentedPoolAllocator::new(16, blocks_per_page).unwrap();
        let blocks: Vec<_> = (0..count).map(|_| pool.allocate().unwrap()).collect();
        let pages = pool.page_count();

        let victim = blocks[pick % count];
        pool.deallocate(victim).unwrap();
        prop_assert_eq!(pool.allocate().unwrap(), victim);
        prop_assert_eq!(pool.page_count(), pages);

        for block in blocks {
            pool.deallocate(block).unwrap();
        }
    }
}
