/*!
 * Pipeline Tests
 * Preparation, consumption, retirement and descriptor accounting across maps
 */

use crate::common::{config, descriptor, temp_dir, write_session, FaultyPlatform, ToggleAllocator, RECORDS, SMALL_MAP};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use trace_store::{MetadataKind, StoreDescriptor, TraceContext, TraceStore, TraceStoreId, TraceStoreTraits};

const STORE: TraceStoreId = TraceStoreId(0);

const STREAMING: TraceStoreTraits = RECORDS.union(TraceStoreTraits::STREAMING_WRITE);

#[test]
fn test_maps_retire_two_generations_behind() {
    let dir = temp_dir();
    let context = write_session(dir.path(), &[descriptor("Events", STREAMING)]);
    let store = context.store(STORE).unwrap();

    assert_eq!(store.generation(), 1);
    for _ in 0..(8 * SMALL_MAP / 4096) {
        store.allocate(4000, 1).unwrap();
        let generation = store.generation();
        if generation > 2 {
            assert_eq!(store.last_retired_generation(), generation - 2);
        } else {
            assert_eq!(store.last_retired_generation(), 0);
        }
    }
    assert!(store.generation() >= 8);
}

#[test]
fn test_descriptors_are_conserved() {
    let dir = temp_dir();
    let context = write_session(dir.path(), &[descriptor("Events", STREAMING), descriptor2()]);

    for store in context.stores().iter() {
        for index in 0..200u64 {
            store.allocate(1000 + index * 7, 1).unwrap();
        }
    }
    context.wait_for_pipeline();

    for store in context.stores().iter() {
        let census = store.census();
        assert!(census.is_conserved(), "{}: {:?}", store.name(), census);
        for kind in MetadataKind::ALL {
            let satellite = store.satellite(kind).unwrap();
            assert!(satellite.census().is_conserved(), "{}: {:?}", satellite.name(), satellite.census());
        }
    }
}

fn descriptor2() -> StoreDescriptor {
    StoreDescriptor::new(1, "Tables", RECORDS, SMALL_MAP)
}

#[test]
fn test_non_streaming_maps_stay_mapped() {
    let dir = temp_dir();
    let context = write_session(dir.path(), &[descriptor("Tables", RECORDS)]);
    let store = context.store(STORE).unwrap();

    let first = store.allocate(512, 1).unwrap();
    // SAFETY: first allocation is 512 writable bytes.
    unsafe { first.ptr.as_ptr().write(0xAB) };
    for _ in 0..(4 * SMALL_MAP / 512) {
        store.allocate(512, 1).unwrap();
    }
    context.wait_for_pipeline();

    assert!(store.census().retained >= 2);
    // SAFETY: retained maps are unmapped only at rundown.
    assert_eq!(unsafe { first.ptr.as_ptr().read() }, 0xAB);
}

#[test]
fn test_address_ledger_tracks_each_map() {
    let dir = temp_dir();
    let context = write_session(dir.path(), &[descriptor("Events", STREAMING)]);
    let store = context.store(STORE).unwrap();

    for _ in 0..(3 * SMALL_MAP / 4096) {
        store.allocate(4096, 1).unwrap();
    }
    context.wait_for_pipeline();

    let records = store.address_records().unwrap();
    assert!(records.len() >= 3);
    for (index, record) in records.iter().enumerate() {
        assert_eq!(record.mapped_sequence_id, index as u32);
        assert_eq!(record.file_offset, index as u64 * SMALL_MAP);
        assert_eq!(record.mapped_size, SMALL_MAP);
        assert_eq!(record.process_id, std::process::id());
        assert_ne!(record.base_address, 0);
        assert!(record.timestamp.prepared >= record.timestamp.requested);
    }
    let consumed = records.iter().filter(|r| r.timestamp.consumed != 0).count();
    assert!(consumed >= 3);
}

#[test]
fn test_exhausted_descriptors_drop_the_crossing_allocation() {
    let dir = temp_dir();
    let allocator = Arc::new(ToggleAllocator::default());
    let context = TraceContext::builder(config(dir.path()).with_initial_map_count(2).no_prefaulting(true))
        .allocator(allocator.clone())
        .stores(&[descriptor("Events", RECORDS)])
        .build()
        .unwrap();
    let store = context.store(STORE).unwrap();
    context.wait_for_pipeline();
    allocator.fail(true);

    let fits = SMALL_MAP / 4000;
    for _ in 0..fits {
        assert!(store.allocate(4000, 1).is_some());
    }
    assert!(store.allocate(4000, 1).is_none());

    let stats = store.stats();
    assert_eq!(stats.dropped_records, 1);
    assert_eq!(stats.exhausted_free_memory_maps, 1);
    assert_eq!(store.totals().number_of_allocations, fits);

    allocator.fail(false);
    assert!(store.allocate(4000, 1).is_some());
}

#[test]
fn test_exactly_filled_map_counts_exhaustion_once() {
    let dir = temp_dir();
    let allocator = Arc::new(ToggleAllocator::default());
    let context = TraceContext::builder(config(dir.path()).with_initial_map_count(2).no_prefaulting(true))
        .allocator(allocator.clone())
        .stores(&[descriptor("Events", RECORDS)])
        .build()
        .unwrap();
    let store = context.store(STORE).unwrap();
    context.wait_for_pipeline();
    allocator.fail(true);

    let fits = SMALL_MAP / 4096;
    for _ in 0..fits {
        assert!(store.allocate(4096, 1).is_some());
    }
    assert_eq!(store.stats().exhausted_free_memory_maps, 0);
    assert_eq!(store.stats().dropped_records, 0);

    assert!(store.allocate(4096, 1).is_none());
    let stats = store.stats();
    assert_eq!(stats.dropped_records, 1);
    assert_eq!(stats.exhausted_free_memory_maps, 1);

    allocator.fail(false);
    let resumed = store.allocate(4096, 1).unwrap();
    assert_eq!(resumed.file_offset % SMALL_MAP, 0);
    assert_eq!(store.totals().number_of_allocations, fits + 1 + padding_entries(store));
}

#[test]
fn test_taken_preferred_address_falls_back_to_any_address() {
    let dir = temp_dir();
    let platform = Arc::new(FaultyPlatform::default());
    let context = TraceContext::builder(config(dir.path()))
        .platform(platform.clone())
        .stores(&[descriptor("Events", STREAMING)])
        .build()
        .unwrap();
    let store = context.store(STORE).unwrap();
    context.wait_for_pipeline();
    platform.refuse_preferred(1);

    let count = 3 * SMALL_MAP / 4096;
    for _ in 0..count {
        assert!(store.allocate(4096, 1).is_some());
    }
    context.wait_for_pipeline();

    assert_eq!(platform.refused(), 1);
    let stats = store.stats();
    assert!(stats.preferred_address_unavailable >= 1);
    assert_eq!(stats.dropped_records, 0);
    assert_eq!(stats.failed_preparations, 0);
    assert!(store.generation() >= 3);
    assert!(store.address_records().unwrap().iter().all(|record| record.base_address != 0));
}

#[test]
fn test_blocking_store_waits_for_slow_preparation() {
    let dir = temp_dir();
    let platform = Arc::new(FaultyPlatform::default());
    let context = TraceContext::builder(config(dir.path()))
        .platform(platform.clone())
        .stores(&[descriptor("Performance", RECORDS)])
        .build()
        .unwrap();
    let store = context.store(STORE).unwrap();
    context.wait_for_pipeline();
    platform.set_delay(Duration::from_millis(100));

    for _ in 0..4 {
        assert!(store.allocate(40 * 1024, 1).is_some());
    }

    let stats = store.stats();
    assert_eq!(stats.dropped_records, 0);
    assert!(stats.blocked_allocations >= 1);
    assert!(stats.allocations_outpacing_next_memory_map_preparation >= 1);
    assert_eq!(store.totals().number_of_allocations, 4 + padding_entries(store));
}

fn padding_entries(store: &TraceStore) -> u64 {
    store
        .allocation_log()
        .unwrap()
        .iter()
        .filter(|entry| entry.is_padding())
        .count() as u64
}

#[test]
fn test_non_blocking_store_drops_when_outpaced() {
    let dir = temp_dir();
    let platform = Arc::new(FaultyPlatform::default());
    let traits = TraceStoreTraits::VARYING_RECORD_SIZE | TraceStoreTraits::MULTIPLE_RECORDS;
    let context = TraceContext::builder(config(dir.path()))
        .platform(platform.clone())
        .stores(&[descriptor("Events", traits)])
        .build()
        .unwrap();
    let store = context.store(STORE).unwrap();
    context.wait_for_pipeline();
    platform.set_delay(Duration::from_millis(200));

    let results: Vec<bool> = (0..4).map(|_| store.allocate(40 * 1024, 1).is_some()).collect();
    assert!(results.iter().any(|ok| !ok));

    let stats = store.stats();
    assert!(stats.dropped_records >= 1);
    assert_eq!(stats.blocked_allocations, 0);
    let successes = results.iter().filter(|ok| **ok).count() as u64;
    assert_eq!(store.totals().number_of_allocations, successes + padding_entries(store));
}

#[test]
fn test_rundown_truncates_to_end_of_file() {
    let dir = temp_dir();
    let context = write_session(dir.path(), &[descriptor("Events", STREAMING)]);
    let store = Arc::clone(context.store(STORE).unwrap());
    for _ in 0..10 {
        store.allocate(1000, 1).unwrap();
    }
    let end = store.totals().end_of_file;
    let path = store.path().to_path_buf();

    context.rundown();
    assert!(!store.is_bound());
    assert_eq!(std::fs::metadata(&path).unwrap().len(), end);

    context.rundown();
    drop(context);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), end);
}
