/*!
 * Allocation Tests
 * Placement, alignment, coalescing and padding of primary store allocations
 */

use crate::common::{align16, config, descriptor, expected_log, temp_dir, write_session, ToggleAllocator, RECORDS};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use trace_store::{
    AllocationKind, MetadataKind, StoreDescriptor, TraceContext, TraceStoreAllocator, TraceStoreId, TraceStoreTraits,
};

const STORE: TraceStoreId = TraceStoreId(0);

#[test]
fn test_small_allocations_coalesce() {
    let dir = temp_dir();
    let traits = TraceStoreTraits::VARYING_RECORD_SIZE
        | TraceStoreTraits::MULTIPLE_RECORDS
        | TraceStoreTraits::STREAMING_WRITE;
    let context = write_session(dir.path(), &[descriptor("Records", traits)]);
    let store = context.store(STORE).unwrap();

    let first = store.allocate_records(100, 1).unwrap().as_ptr() as usize;
    let second = store.allocate_records(100, 1).unwrap().as_ptr() as usize;
    let third = store.allocate_records(250, 1).unwrap().as_ptr() as usize;
    let fourth = store.allocate_records(100, 1).unwrap().as_ptr() as usize;

    assert_eq!(second - first, 112);
    assert_eq!(third - second, 112);
    assert_eq!(fourth - third, 256);
    assert_eq!(
        store.allocation_log().unwrap(),
        vec![
            AllocationKind::Data { record_size: 100, count: 2 },
            AllocationKind::Data { record_size: 250, count: 1 },
            AllocationKind::Data { record_size: 100, count: 1 },
        ]
    );

    let totals = store.totals();
    assert_eq!(totals.number_of_allocations, 4);
    assert_eq!(totals.allocation_size, 112 + 112 + 256 + 112);
    assert_eq!(totals.end_of_file, 592);
}

#[test]
fn test_runs_of_equal_sizes_share_an_entry() {
    let dir = temp_dir();
    let context = write_session(dir.path(), &[descriptor("Records", RECORDS)]);
    let store = context.store(STORE).unwrap();

    for size in [64, 64, 64, 48, 48] {
        store.allocate(size, 1).unwrap();
    }
    assert_eq!(
        store.allocation_log().unwrap(),
        vec![
            AllocationKind::Data { record_size: 64, count: 3 },
            AllocationKind::Data { record_size: 48, count: 2 },
        ]
    );
}

#[test]
fn test_batched_unaligned_records_log_as_one() {
    let dir = temp_dir();
    let context = write_session(dir.path(), &[descriptor("Records", RECORDS)]);
    let store = context.store(STORE).unwrap();

    let batch = store.allocate(10, 3).unwrap();
    assert_eq!(batch.len, 30);
    let next = store.allocate(32, 1).unwrap();
    assert_eq!(next.file_offset, 32);
    assert_eq!(
        store.allocation_log().unwrap(),
        vec![
            AllocationKind::Data { record_size: 30, count: 1 },
            AllocationKind::Data { record_size: 32, count: 1 },
        ]
    );
}

#[test]
fn test_zero_sized_and_oversized_requests_fail() {
    let dir = temp_dir();
    let context = write_session(dir.path(), &[descriptor("Records", RECORDS)]);
    let store = context.store(STORE).unwrap();

    assert!(store.allocate(0, 1).is_none());
    assert!(store.allocate(16, 0).is_none());
    assert!(store.allocate(store.mapping_size() + 1, 1).is_none());
    assert_eq!(store.stats().dropped_records, 1);

    assert!(store.allocate(u64::MAX, 1).is_none());
    assert!(store.allocate(u64::MAX / 2, 2).is_none());
    assert!(store.allocate_page_aligned(u64::MAX - 1, 1).is_none());
    assert!(store.allocate(u64::MAX / 2, 3).is_none());
    assert_eq!(store.stats().dropped_records, 1);
    assert_eq!(store.totals().number_of_allocations, 0);
}

#[test]
fn test_page_spill_is_prevented_with_logged_padding() {
    let dir = temp_dir();
    let traits = RECORDS | TraceStoreTraits::PREVENT_PAGE_SPILL;
    let context = write_session(dir.path(), &[descriptor("Strings", traits)]);
    let store = context.store(STORE).unwrap();
    let page = context.platform().page_size() as u64;

    let allocations: Vec<_> = (0..120)
        .map(|index| store.allocate(1000 + index % 3 * 200, 1).unwrap())
        .collect();

    for allocation in &allocations {
        assert!(
            allocation.file_offset % page + allocation.len <= page,
            "record at {} spills over a page",
            allocation.file_offset
        );
    }
    assert!(allocations.iter().any(|a| a.padding > 0));
    assert_eq!(store.allocation_log().unwrap(), expected_log(&allocations));

    let padding: u64 = allocations.iter().map(|a| a.padding).sum();
    let data: u64 = allocations.iter().map(|a| align16(a.len)).sum();
    assert_eq!(store.totals().allocation_size, padding + data);
}

#[test]
fn test_page_aligned_allocation_starts_on_a_page() {
    let dir = temp_dir();
    let context = write_session(dir.path(), &[descriptor("Records", RECORDS)]);
    let store = context.store(STORE).unwrap();
    let page = context.platform().page_size() as u64;

    store.allocate(100, 1).unwrap();
    let aligned = store.allocate_page_aligned(200, 1).unwrap();
    assert_eq!(aligned.file_offset, page);
    assert_eq!(aligned.padding, page - 112);

    let next = store.allocate(16, 1).unwrap();
    assert_eq!(next.file_offset, 2 * page);
    assert_eq!(next.ptr.as_ptr() as usize % page as usize, 0);
}

#[test]
fn test_try_allocate_fails_while_suspended() {
    let dir = temp_dir();
    let context = write_session(dir.path(), &[descriptor("Records", RECORDS)]);
    let store = context.store(STORE).unwrap();

    assert!(store.try_allocate_records(64, 1).is_some());
    store.suspend_allocations();
    assert!(store.try_allocate_records(64, 1).is_none());
    store.resume_allocations();
    assert!(store.try_allocate_records(64, 1).is_some());
}

#[test]
fn test_suspended_allocations_park_until_resumed() {
    let dir = temp_dir();
    let context = write_session(dir.path(), &[descriptor("Records", RECORDS)]);
    let store = Arc::clone(context.store(STORE).unwrap());

    store.suspend_allocations();
    let worker = {
        let store = Arc::clone(&store);
        std::thread::spawn(move || store.allocate(64, 1).map(|a| a.file_offset))
    };

    while store.stats().suspended_allocations == 0 {
        std::thread::sleep(Duration::from_millis(5));
    }
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(store.totals().number_of_allocations, 0);

    store.resume_allocations();
    assert_eq!(worker.join().unwrap(), Some(0));
    assert!(store.stats().elapsed_suspension_ticks > 0);
}

#[test]
fn test_concurrent_allocations_never_overlap() {
    let dir = temp_dir();
    let traits = RECORDS | TraceStoreTraits::CONCURRENT_ALLOCATIONS;
    let context = write_session(dir.path(), &[descriptor("Shared", traits)]);
    let store = context.store(STORE).unwrap();
    let counter = AtomicUsize::new(0);
    let successes = &counter;

    let mut offsets: Vec<(u64, u64)> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(move || {
                    (0..300)
                        .filter_map(|_| store.allocate(96, 1))
                        .inspect(|_| {
                            successes.fetch_add(1, Ordering::Relaxed);
                        })
                        .map(|a| (a.file_offset, a.len))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers.into_iter().flat_map(|w| w.join().unwrap()).collect()
    });

    assert_eq!(counter.load(Ordering::Relaxed), 1200);
    offsets.sort_unstable();
    for pair in offsets.windows(2) {
        assert!(pair[0].0 + pair[0].1 <= pair[1].0, "{:?} overlaps {:?}", pair[0], pair[1]);
    }
}

#[test]
fn test_allocation_timestamps_follow_each_allocation() {
    let dir = temp_dir();
    let context = write_session(dir.path(), &[descriptor("Records", RECORDS)]);
    let store = context.store(STORE).unwrap();

    let counts: Vec<u64> = (0..50).map(|index| 1 + index % 3).collect();
    for &count in &counts {
        store.allocate(24, count).unwrap();
    }

    let stamps = store.allocation_timestamps().unwrap();
    assert_eq!(stamps.len(), counts.len());
    assert_eq!(stamps.iter().map(|s| s.number_of_records).collect::<Vec<_>>(), counts);
    assert!(stamps.windows(2).all(|pair| pair[0].timestamp <= pair[1].timestamp));
    assert!(stamps[0].timestamp > 0);

    let satellite = store.satellite(MetadataKind::AllocationTimestamp).unwrap();
    assert_eq!(satellite.totals().number_of_allocations, counts.len() as u64);
    assert_eq!(satellite.totals().end_of_file, 16 * counts.len() as u64);
}

#[test]
fn test_allocation_timestamps_can_be_disabled() {
    let dir = temp_dir();
    let context = TraceContext::builder(config(dir.path()).disable_allocation_timestamps(true))
        .stores(&[descriptor("Records", RECORDS)])
        .build()
        .unwrap();
    let store = context.store(STORE).unwrap();
    for _ in 0..10 {
        store.allocate(64, 1).unwrap();
    }
    assert!(store.allocation_timestamps().unwrap().is_empty());
    assert_eq!(store.allocation_log().unwrap(), vec![AllocationKind::Data { record_size: 64, count: 10 }]);
}

#[test]
fn test_linked_stores_record_no_timestamps() {
    let dir = temp_dir();
    let linked_traits = RECORDS | TraceStoreTraits::LINKED_STORE;
    let context = write_session(
        dir.path(),
        &[descriptor("Records", RECORDS), StoreDescriptor::new(1, "Linked", linked_traits, 1 << 16)],
    );
    for store in context.stores().iter() {
        for _ in 0..5 {
            store.allocate(64, 1).unwrap();
        }
    }

    let linked = context.store(TraceStoreId(1)).unwrap();
    assert!(linked.allocation_timestamps().unwrap().is_empty());
    assert_eq!(linked.totals().number_of_allocations, 5);
    assert_eq!(context.store(STORE).unwrap().allocation_timestamps().unwrap().len(), 5);
}

/// Session whose `:Allocation` satellite holds exactly one map of log entries
fn starved_log_session(dir: &std::path::Path, hard: bool) -> (TraceContext, Arc<ToggleAllocator>) {
    let allocator = Arc::new(ToggleAllocator::default());
    let session = config(dir)
        .with_initial_map_count(2)
        .no_prefaulting(true)
        .disable_allocation_timestamps(true)
        .hard_metadata_failures(hard);
    let context = TraceContext::builder(session)
        .allocator(allocator.clone())
        .stores(&[StoreDescriptor::new(0, "Records", RECORDS, 1 << 20).without_coalescing()])
        .build()
        .unwrap();
    context.wait_for_pipeline();
    allocator.fail(true);
    (context, allocator)
}

/// Log entries that fit one 64KB map of the `:Allocation` satellite
const LOG_ENTRIES_PER_MAP: u64 = (1 << 16) / 16;

#[test]
fn test_lost_log_entry_keeps_the_allocation() {
    let dir = temp_dir();
    let (context, _allocator) = starved_log_session(dir.path(), false);
    let store = context.store(STORE).unwrap();

    for _ in 0..LOG_ENTRIES_PER_MAP {
        assert!(store.allocate(16, 1).is_some());
    }
    assert_eq!(store.stats().failed_metadata_writes, 0);

    let unlogged = store.allocate(16, 1).unwrap();
    assert_eq!(unlogged.file_offset, 16 * LOG_ENTRIES_PER_MAP);
    let stats = store.stats();
    assert_eq!(stats.failed_metadata_writes, 1);
    assert_eq!(stats.dropped_records, 0);
    assert_eq!(store.allocation_log().unwrap().len() as u64, LOG_ENTRIES_PER_MAP);
    assert_eq!(store.totals().number_of_allocations, LOG_ENTRIES_PER_MAP);
}

#[test]
fn test_hard_metadata_failures_drop_the_allocation() {
    let dir = temp_dir();
    let (context, _allocator) = starved_log_session(dir.path(), true);
    let store = context.store(STORE).unwrap();

    for _ in 0..LOG_ENTRIES_PER_MAP {
        assert!(store.allocate(16, 1).is_some());
    }
    assert!(store.allocate(16, 1).is_none());

    let stats = store.stats();
    assert_eq!(stats.failed_metadata_writes, 1);
    assert_eq!(stats.dropped_records, 1);
    assert_eq!(store.allocation_log().unwrap().len() as u64, LOG_ENTRIES_PER_MAP);
}

#[test]
fn test_store_backed_allocator() {
    let dir = temp_dir();
    let context = write_session(dir.path(), &[descriptor("Heap", RECORDS)]);
    let allocator = TraceStoreAllocator::new(Arc::clone(context.store(STORE).unwrap()));

    let block = allocator.calloc(4, 32).unwrap();
    // SAFETY: 128 bytes were just allocated.
    let bytes = unsafe { std::slice::from_raw_parts(block.as_ptr(), 128) };
    assert!(bytes.iter().all(|&b| b == 0));

    assert!(allocator.malloc(48).is_some());
    assert!(allocator.aligned_malloc(16, 16).is_some());
    assert!(allocator.aligned_offset_malloc(16, 16, 8).is_none());
    assert!(allocator.aligned_malloc(16, 24).is_none());
    assert!(allocator.realloc(block, 256).is_none());
    allocator.free(block);
    assert_eq!(allocator.store().totals().number_of_allocations, 3);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_allocations_are_disjoint_and_accounted(sizes in prop::collection::vec(1u64..3000, 1..80)) {
        let dir = temp_dir();
        let context = write_session(dir.path(), &[descriptor("Records", RECORDS)]);
        let store = context.store(STORE).unwrap();
        let mapping_size = store.mapping_size();

        let allocations: Vec<_> = sizes.iter().filter_map(|&size| store.allocate(size, 1)).collect();
        prop_assert_eq!(allocations.len(), sizes.len());

        for pair in allocations.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            prop_assert!(prev.file_offset + align16(prev.len) <= next.file_offset);
            prop_assert_eq!(next.ptr.as_ptr() as usize % 16, 0);

            let same_map = prev.file_offset / mapping_size == next.file_offset / mapping_size
                && (prev.file_offset + prev.len - 1) / mapping_size == next.file_offset / mapping_size;
            if same_map {
                prop_assert_eq!(
                    next.ptr.as_ptr() as u64 - prev.ptr.as_ptr() as u64,
                    next.file_offset - prev.file_offset
                );
            }
        }

        let paddings = allocations.iter().filter(|a| a.padding > 0).count() as u64;
        let padding: u64 = allocations.iter().map(|a| a.padding).sum();
        let data: u64 = allocations.iter().map(|a| align16(a.len)).sum();
        let totals = store.totals();
        prop_assert_eq!(totals.number_of_allocations, allocations.len() as u64 + paddings);
        prop_assert_eq!(totals.allocation_size, data + padding);
        prop_assert_eq!(store.allocation_log().unwrap(), expected_log(&allocations));
    }
}
