/*!
 * Shared fixtures for trace store integration tests
 */

#![allow(dead_code)]

use nix::errno::Errno;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use trace_store::core::types::ProcessorInfo;
use trace_store::platform::{MapViewError, MappedView, ViewAccess};
use trace_store::store::MemoryMap;
use trace_store::{
    Allocation, AllocationKind, Allocator, Platform, StoreDescriptor, SystemAllocator, SystemPlatform, TraceContext,
    TraceSessionConfig, TraceStoreTraits,
};

/// Mapping size small enough that a few hundred records cross maps
pub const SMALL_MAP: u64 = 64 * 1024;

pub const RECORDS: TraceStoreTraits = TraceStoreTraits::VARYING_RECORD_SIZE
    .union(TraceStoreTraits::MULTIPLE_RECORDS)
    .union(TraceStoreTraits::BLOCKING_ALLOCATIONS);

pub const STREAMING_RECORDS: TraceStoreTraits = RECORDS
    .union(TraceStoreTraits::STREAMING_WRITE)
    .union(TraceStoreTraits::STREAMING_READ);

pub fn descriptor(name: &'static str, traits: TraceStoreTraits) -> StoreDescriptor {
    StoreDescriptor::new(0, name, traits, SMALL_MAP)
}

pub fn config(dir: &Path) -> TraceSessionConfig {
    TraceSessionConfig::new(dir).with_thread_count(2)
}

/// Bind a writable session over `descriptors`
pub fn write_session(dir: &Path, descriptors: &[StoreDescriptor]) -> TraceContext {
    TraceContext::builder(config(dir))
        .stores(descriptors)
        .build()
        .expect("writable session should bind")
}

/// Bind a readonly session over a directory written by `write_session`
pub fn read_session(dir: &Path, descriptors: &[StoreDescriptor]) -> TraceContext {
    TraceContext::builder(config(dir).readonly(true))
        .stores(descriptors)
        .build()
        .expect("readonly session should bind")
}

pub fn temp_dir() -> TempDir {
    tempfile::tempdir().expect("temporary directory")
}

#[inline]
pub fn align16(size: u64) -> u64 {
    (size + 15) & !15
}

/// Fill an allocation with `byte`
pub fn fill(allocation: &Allocation, byte: u8) {
    // SAFETY: the allocation is `len` writable bytes of a live view.
    unsafe { std::ptr::write_bytes(allocation.ptr.as_ptr(), byte, allocation.len as usize) };
}

/// The allocation log a sequence of single-record allocations must produce
pub fn expected_log(allocations: &[Allocation]) -> Vec<AllocationKind> {
    let mut log = Vec::new();
    for allocation in allocations {
        if allocation.padding > 0 {
            log.push(AllocationKind::Padding {
                bytes: allocation.padding,
            });
        }
        match log.last_mut() {
            Some(AllocationKind::Data { record_size, count }) if *record_size == allocation.len => *count += 1,
            _ => log.push(AllocationKind::Data {
                record_size: allocation.len,
                count: 1,
            }),
        }
    }
    log
}

// ============================================================================
// Failing Allocator
// ============================================================================

/// System allocator that refuses every request while `failing` is set
#[derive(Debug, Default)]
pub struct ToggleAllocator {
    pub failing: AtomicBool,
}

impl ToggleAllocator {
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Allocator for ToggleAllocator {
    fn allocate_maps(&self, count: usize) -> Option<Vec<Box<MemoryMap>>> {
        if self.failing.load(Ordering::SeqCst) {
            return None;
        }
        SystemAllocator.allocate_maps(count)
    }
}

// ============================================================================
// Faulty Platform
// ============================================================================

/// System platform with injectable view mapping faults
///
/// Every view mapping first sleeps for `delay_ms`. While `refusals` is
/// positive, each mapping at a preferred address fails as taken and
/// decrements it.
#[derive(Debug, Default)]
pub struct FaultyPlatform {
    inner: SystemPlatform,
    pub delay_ms: AtomicU64,
    refusals: AtomicU32,
    refused: AtomicU32,
}

impl FaultyPlatform {
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Report the next `count` preferred addresses as unavailable
    pub fn refuse_preferred(&self, count: u32) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    /// Preferred addresses refused so far
    pub fn refused(&self) -> u32 {
        self.refused.load(Ordering::SeqCst)
    }
}

impl Platform for FaultyPlatform {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn extend_file(&self, file: &File, len: u64) -> io::Result<()> {
        self.inner.extend_file(file, len)
    }

    fn file_len(&self, file: &File) -> io::Result<u64> {
        self.inner.file_len(file)
    }

    fn truncate_file(&self, file: &File, len: u64) -> io::Result<()> {
        self.inner.truncate_file(file, len)
    }

    fn map_view(
        &self,
        file: &File,
        offset: u64,
        len: usize,
        access: ViewAccess,
        preferred: Option<usize>,
    ) -> Result<MappedView, MapViewError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if let Some(address) = preferred {
            let taken = self
                .refusals
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if taken {
                self.refused.fetch_add(1, Ordering::SeqCst);
                return Err(MapViewError::AddressUnavailable { preferred: address });
            }
        }
        self.inner.map_view(file, offset, len, access, preferred)
    }

    fn flush_view(&self, view: &MappedView) -> Result<(), Errno> {
        self.inner.flush_view(view)
    }

    fn unmap_view(&self, view: MappedView) -> Result<(), Errno> {
        self.inner.unmap_view(view)
    }

    fn prefault(&self, address: usize) {
        self.inner.prefault(address)
    }

    fn current_processor(&self) -> ProcessorInfo {
        self.inner.current_processor()
    }

    fn process_id(&self) -> u32 {
        self.inner.process_id()
    }
}
