/*!
 * Session Tests
 * Binding, callbacks, registry rundown and store layout of whole sessions
 */

use crate::common::{config, descriptor, temp_dir, write_session, RECORDS};
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use trace_store::session::{store_path, EVENT_STORE, FUNCTION_TABLE_STORE, STRING_BUFFER_STORE};
use trace_store::{
    MetadataKind, RundownRegistry, StoreKind, TraceContext, TraceSessionConfig, TraceStoreError, TraceStoreId,
    TraceStoreTraits, DEFAULT_TRACE_STORES,
};

const STORE: TraceStoreId = TraceStoreId(0);

#[test]
fn test_single_record_store_returns_its_base() {
    let dir = temp_dir();
    let context = write_session(dir.path(), &[descriptor("Header", TraceStoreTraits::SINGLE_RECORD)]);
    let store = context.store(STORE).unwrap();

    let (base, offset) = store.active_map().unwrap();
    let header = store.allocate(64, 1).unwrap();
    assert_eq!(header.ptr.as_ptr() as usize, base);
    assert_eq!(header.file_offset, offset);
}

#[test]
#[should_panic(expected = "allocated twice")]
fn test_single_record_store_allocated_twice_panics() {
    let dir = temp_dir();
    let context = write_session(dir.path(), &[descriptor("Header", TraceStoreTraits::SINGLE_RECORD)]);
    let store = context.store(STORE).unwrap();
    store.allocate(64, 1).unwrap();
    store.allocate(64, 1);
}

#[test]
fn test_every_store_gets_seven_satellites() {
    let dir = temp_dir();
    let context = write_session(dir.path(), &[descriptor("Records", RECORDS)]);
    let store = context.store(STORE).unwrap();

    assert_eq!(store.kind(), StoreKind::Primary);
    assert!(store.is_bound());
    assert!(store.path().exists());
    assert_eq!(MetadataKind::ALL.len(), 7);
    for kind in MetadataKind::ALL {
        let satellite = store.satellite(kind).unwrap();
        assert!(satellite.is_metadata());
        assert!(satellite.is_bound(), "{} not bound", satellite.name());
        assert_eq!(satellite.kind(), StoreKind::Metadata(kind));
        assert_eq!(satellite.path(), store_path(dir.path(), "Records", StoreKind::Metadata(kind)));
        assert!(satellite.path().exists());
    }
    assert_eq!(
        store.info().traits.load(Ordering::Relaxed),
        u64::from(RECORDS.bits())
    );
}

#[test]
fn test_default_session_records_and_reloads() {
    let dir = temp_dir();
    {
        let context = TraceContext::new(config(dir.path())).unwrap();
        assert_eq!(context.stores().len(), DEFAULT_TRACE_STORES.len());

        let events = context.store(EVENT_STORE).unwrap();
        for _ in 0..1000 {
            events.allocate(32, 1).unwrap();
        }
        let strings = context.store_by_name("TraceStringBuffer").unwrap();
        assert_eq!(strings.id(), STRING_BUFFER_STORE);
        strings.allocate(17, 1).unwrap();
        context.store(FUNCTION_TABLE_STORE).unwrap().allocate(128, 1).unwrap();
    }

    let context = TraceContext::new(config(dir.path()).readonly(true)).unwrap();
    let events = context.store(EVENT_STORE).unwrap();
    assert_eq!(events.record_locations().unwrap().len(), 1000);
    assert_eq!(events.stream_records(|_, _| true).unwrap(), 1000);
    assert_eq!(context.store(STRING_BUFFER_STORE).unwrap().record_locations().unwrap().len(), 1);
    assert_eq!(context.store(FUNCTION_TABLE_STORE).unwrap().totals().number_of_allocations, 1);
}

#[test]
fn test_bind_complete_callback_runs_once_per_store() {
    let dir = temp_dir();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let context = TraceContext::builder(config(dir.path()))
        .stores(&[descriptor("Records", RECORDS)])
        .on_bind_complete(STORE, move |store| {
            assert_eq!(store.name(), "Records");
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .build()
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(context.store(STORE).unwrap().is_bound());
}

#[test]
fn test_failing_bind_callback_fails_the_session() {
    let dir = temp_dir();
    let result = TraceContext::builder(config(dir.path()))
        .stores(&[descriptor("Records", RECORDS)])
        .on_bind_complete(STORE, |_| Err(TraceStoreError::InvalidArgument("table rejected".into())))
        .build();

    match result {
        Err(TraceStoreError::InvalidArgument(reason)) => assert_eq!(reason, "table rejected"),
        other => panic!("unexpected bind result: {:?}", other.map(|c| c.session_id())),
    }
}

#[test]
fn test_invalid_sessions_are_rejected() {
    let dir = temp_dir();
    let empty = TraceContext::builder(config(dir.path())).stores(&[]).build();
    assert!(matches!(empty, Err(TraceStoreError::InvalidArgument(_))));

    let duplicate = TraceContext::builder(config(dir.path()))
        .stores(&[descriptor("A", RECORDS), descriptor("B", RECORDS)])
        .build();
    assert!(matches!(duplicate, Err(TraceStoreError::InvalidArgument(_))));

    let invalid_traits = TraceContext::builder(config(dir.path()))
        .stores(&[descriptor("Bad", TraceStoreTraits::STREAMING_WRITE)])
        .build();
    assert!(matches!(invalid_traits, Err(TraceStoreError::TraitViolation(_))));

    let bad_config = TraceContext::builder(config(dir.path()).with_initial_map_count(3))
        .stores(&[descriptor("Records", RECORDS)])
        .build();
    assert!(matches!(bad_config, Err(TraceStoreError::InvalidArgument(_))));
}

#[test]
fn test_mapping_size_override_applies_to_primaries() {
    let dir = temp_dir();
    let context = TraceContext::builder(config(dir.path()).with_mapping_size(1 << 17))
        .stores(&[descriptor("Records", RECORDS)])
        .build()
        .unwrap();
    let store = context.store(STORE).unwrap();
    assert_eq!(store.mapping_size(), 1 << 17);
    assert_eq!(store.satellite(MetadataKind::Allocation).unwrap().mapping_size(), 1 << 16);
}

#[test]
fn test_sessions_get_distinct_ids() {
    let first = temp_dir();
    let second = temp_dir();
    let a = write_session(first.path(), &[descriptor("Records", RECORDS)]);
    let b = write_session(second.path(), &[descriptor("Records", RECORDS)]);
    assert_ne!(a.session_id(), b.session_id());
}

#[test]
fn test_explicit_registry_runs_sessions_down() {
    let dir = temp_dir();
    let registry = Arc::new(RundownRegistry::new());
    let context = TraceContext::builder(config(dir.path()))
        .registry(Arc::clone(&registry))
        .stores(&[descriptor("Records", RECORDS)])
        .build()
        .unwrap();
    assert_eq!(registry.len(), 1);

    assert_eq!(registry.rundown_all(), 1);
    assert!(!context.store(STORE).unwrap().is_bound());
    assert!(registry.is_empty());
    drop(context);
}

#[test]
fn test_dropped_session_leaves_the_registry() {
    let dir = temp_dir();
    let registry = Arc::new(RundownRegistry::new());
    let context = TraceContext::builder(config(dir.path()))
        .registry(Arc::clone(&registry))
        .stores(&[descriptor("Records", RECORDS)])
        .build()
        .unwrap();
    drop(context);
    assert!(registry.is_empty());
    assert_eq!(registry.rundown_all(), 0);
}

#[test]
#[serial]
fn test_global_registry() {
    let dir = temp_dir();
    let global = RundownRegistry::global();
    let before = global.len();
    let context = TraceContext::builder(config(dir.path()))
        .registry(RundownRegistry::global())
        .stores(&[descriptor("Records", RECORDS)])
        .build()
        .unwrap();
    assert_eq!(global.len(), before + 1);

    assert!(global.rundown_all() >= 1);
    assert!(!context.store(STORE).unwrap().is_bound());
}

#[test]
#[serial]
fn test_config_from_env() {
    std::env::set_var("TRACE_STORE_DIR", "/var/trace");
    std::env::set_var("TRACE_STORE_THREADS", "3");
    std::env::set_var("TRACE_STORE_NO_PREFAULT", "true");
    let config = TraceSessionConfig::from_env();
    std::env::remove_var("TRACE_STORE_DIR");
    std::env::remove_var("TRACE_STORE_THREADS");
    std::env::remove_var("TRACE_STORE_NO_PREFAULT");

    assert_eq!(config.directory, std::path::PathBuf::from("/var/trace"));
    assert_eq!(config.thread_count, 3);
    assert!(config.no_prefaulting);
}
