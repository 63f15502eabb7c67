/*!
 * Readonly Tests
 * Reloading recorded sessions: enumeration, streaming, relocation and rejection
 */

use crate::common::{config, descriptor, fill, read_session, temp_dir, write_session, RECORDS, SMALL_MAP, STREAMING_RECORDS};
use pretty_assertions::assert_eq;
use trace_store::store::{FieldRelocation, RecordLocation};
use trace_store::{StoreDescriptor, TraceContext, TraceStoreError, TraceStoreId, TraceStoreTraits};

const STORE: TraceStoreId = TraceStoreId(0);

#[test]
fn test_records_survive_a_reload() {
    let dir = temp_dir();
    let descriptors = [descriptor("Records", RECORDS)];

    let (expected, writer_totals, writer_timestamps) = {
        let context = write_session(dir.path(), &descriptors);
        let store = context.store(STORE).unwrap();
        let mut expected = Vec::new();
        for index in 0..300u64 {
            let allocation = store.allocate(200 + index % 5 * 300, 1).unwrap();
            fill(&allocation, (index % 251) as u8);
            expected.push(RecordLocation {
                offset: allocation.file_offset,
                size: allocation.len,
            });
        }
        (expected, store.totals(), store.allocation_timestamps().unwrap())
    };

    let context = read_session(dir.path(), &descriptors);
    let store = context.store(STORE).unwrap();
    assert!(store.is_readonly());
    assert_eq!(store.record_locations().unwrap(), expected);

    let totals = store.totals();
    assert_eq!(totals.number_of_allocations, writer_totals.number_of_allocations);
    assert_eq!(totals.allocation_size, writer_totals.allocation_size);
    assert_eq!(totals.end_of_file, writer_totals.end_of_file);
    assert_eq!(writer_timestamps.len(), 300);
    assert_eq!(store.allocation_timestamps().unwrap(), writer_timestamps);

    for (index, location) in expected.iter().enumerate() {
        let bytes = store.read_record(*location).unwrap();
        assert_eq!(bytes.len() as u64, location.size);
        assert!(bytes.iter().all(|&b| b == (index % 251) as u8), "record {} corrupted", index);
        let within_one_map = location.offset / SMALL_MAP == (location.end() - 1) / SMALL_MAP;
        assert_eq!(store.record_address(*location).is_some(), within_one_map, "record {}", index);
    }
    assert!(store.translator().is_some());
}

#[test]
fn test_streaming_reader_visits_every_record() {
    let dir = temp_dir();
    let descriptors = [descriptor("Events", STREAMING_RECORDS)];
    {
        let context = write_session(dir.path(), &descriptors);
        let store = context.store(STORE).unwrap();
        for index in 0..150u8 {
            let allocation = store.allocate(1000, 1).unwrap();
            fill(&allocation, index);
        }
    }

    let context = read_session(dir.path(), &descriptors);
    let store = context.store(STORE).unwrap();
    assert!(store.translator().is_none());
    assert_eq!(store.census().readonly, 0);
    assert_eq!(store.record_address(RecordLocation { offset: 0, size: 1000 }), None);

    let mut seen = Vec::new();
    let visited = store
        .stream_records(|location, bytes| {
            assert_eq!(location.size, 1000);
            assert!(bytes.iter().all(|&b| b == bytes[0]));
            seen.push(bytes[0]);
            true
        })
        .unwrap();
    assert_eq!(visited, 150);
    assert_eq!(seen, (0..150u8).collect::<Vec<_>>());

    let stopped = store.stream_records(|location, _| location.offset < 9 * 1008).unwrap();
    assert_eq!(stopped, 10);
}

#[test]
fn test_stream_records_requires_readonly_bind() {
    let dir = temp_dir();
    let context = write_session(dir.path(), &[descriptor("Events", STREAMING_RECORDS)]);
    let store = context.store(STORE).unwrap();
    assert!(matches!(
        store.stream_records(|_, _| true),
        Err(TraceStoreError::InvalidArgument(_))
    ));
}

#[test]
fn test_pointers_are_relocated_into_reloaded_stores() {
    const NAME_FIELD: &[FieldRelocation] = &[FieldRelocation::new(0, TraceStoreId(0))];
    let dir = temp_dir();
    let descriptors = [
        StoreDescriptor::new(0, "Strings", RECORDS, SMALL_MAP),
        StoreDescriptor::new(1, "Entries", RECORDS, SMALL_MAP).with_relocations(NAME_FIELD),
    ];

    let (name_location, entry_location, empty_location) = {
        let context = write_session(dir.path(), &descriptors);
        let strings = context.store(TraceStoreId(0)).unwrap();
        let entries = context.store(TraceStoreId(1)).unwrap();

        let name = strings.allocate(6, 1).unwrap();
        // SAFETY: six writable bytes.
        unsafe { std::ptr::copy_nonoverlapping(b"hello\0".as_ptr(), name.ptr.as_ptr(), 6) };

        let entry = entries.allocate(16, 1).unwrap();
        let mut raw = [0u8; 16];
        raw[..8].copy_from_slice(&(name.ptr.as_ptr() as usize as u64).to_ne_bytes());
        raw[8..].copy_from_slice(&42u64.to_ne_bytes());
        // SAFETY: sixteen writable bytes.
        unsafe { std::ptr::copy_nonoverlapping(raw.as_ptr(), entry.ptr.as_ptr(), 16) };

        let empty = entries.allocate(16, 1).unwrap();
        let location = |a: trace_store::Allocation| RecordLocation {
            offset: a.file_offset,
            size: a.len,
        };
        (location(name), location(entry), location(empty))
    };

    let context = TraceContext::builder(config(dir.path()).readonly(true).ignore_preferred_addresses(true))
        .stores(&descriptors)
        .build()
        .unwrap();
    let strings = context.store(TraceStoreId(0)).unwrap();
    let entries = context.store(TraceStoreId(1)).unwrap();
    assert_eq!(entries.relocations().unwrap().fields, NAME_FIELD.to_vec());

    let mut record = entries.read_record(entry_location).unwrap();
    assert_eq!(context.relocate_record(TraceStoreId(1), &mut record).unwrap(), 1);

    let pointer = u64::from_ne_bytes(record[..8].try_into().unwrap());
    let reloaded = strings.record_address(name_location).unwrap();
    assert_eq!(pointer, reloaded as u64);
    assert_eq!(u64::from_ne_bytes(record[8..].try_into().unwrap()), 42);
    // SAFETY: the reloaded view of the string store is still mapped.
    let name = unsafe { std::slice::from_raw_parts(pointer as usize as *const u8, 5) };
    assert_eq!(name, b"hello");

    let mut null = entries.read_record(empty_location).unwrap();
    assert_eq!(context.relocate_record(TraceStoreId(1), &mut null).unwrap(), 0);
}

#[test]
fn test_single_record_store_reloads() {
    let dir = temp_dir();
    let descriptors = [descriptor("Table", TraceStoreTraits::SINGLE_RECORD)];
    {
        let context = write_session(dir.path(), &descriptors);
        let header = context.store(STORE).unwrap().allocate(256, 1).unwrap();
        fill(&header, 0x5A);
    }

    let context = read_session(dir.path(), &descriptors);
    let store = context.store(STORE).unwrap();
    let locations = store.record_locations().unwrap();
    assert_eq!(locations, vec![RecordLocation { offset: 0, size: 256 }]);
    assert_eq!(store.read_record(locations[0]).unwrap(), vec![0x5A; 256]);
}

#[test]
fn test_readonly_stores_refuse_allocations() {
    let dir = temp_dir();
    let descriptors = [descriptor("Records", RECORDS)];
    drop(write_session(dir.path(), &descriptors));

    let context = read_session(dir.path(), &descriptors);
    let store = context.store(STORE).unwrap();
    assert!(store.allocate(64, 1).is_none());
    assert!(store.try_allocate_records(64, 1).is_none());
    assert_eq!(store.totals().number_of_allocations, 0);
}

#[test]
fn test_trait_mismatch_fails_the_bind() {
    let dir = temp_dir();
    drop(write_session(dir.path(), &[descriptor("Records", RECORDS)]));

    let changed = [descriptor("Records", RECORDS | TraceStoreTraits::CONCURRENT_ALLOCATIONS)];
    let result = TraceContext::builder(config(dir.path()).readonly(true))
        .stores(&changed)
        .build();
    assert!(matches!(result, Err(TraceStoreError::TraitViolation(_))));
}

#[test]
fn test_readonly_session_requires_a_directory() {
    let dir = temp_dir();
    let missing = dir.path().join("never-recorded");
    let result = TraceContext::builder(config(&missing).readonly(true))
        .stores(&[descriptor("Records", RECORDS)])
        .build();
    assert!(matches!(result, Err(TraceStoreError::Io { .. })));
    assert!(!missing.exists());
}
