/*!
 * Persisted Store Info
 *
 * End of file, session time, stats and totals of a store. Primary stores
 * keep theirs in the single record of their `:Info` satellite; satellites
 * keep theirs in one slot of the `:MetadataInfo` array. Until that memory
 * is bound every store counts into a local copy.
 */

use crate::core::time::SessionTime;
use crate::core::types::MetadataKind;
use serde::{Deserialize, Serialize};
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

// ============================================================================
// Mapped Layout
// ============================================================================

#[repr(C)]
#[derive(Debug, Default)]
pub struct TraceStoreEof {
    pub end_of_file: AtomicU64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct TraceStoreTime {
    pub frequency: AtomicU64,
    pub start_unix_nanos: AtomicU64,
    pub start_ticks: AtomicU64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct TraceStoreStats {
    pub dropped_records: AtomicU64,
    pub exhausted_free_memory_maps: AtomicU64,
    pub allocations_outpacing_next_memory_map_preparation: AtomicU64,
    pub preferred_address_unavailable: AtomicU64,
    pub readonly_preferred_address_unavailable: AtomicU64,
    pub blocked_allocations: AtomicU64,
    pub suspended_allocations: AtomicU64,
    pub elapsed_suspension_ticks: AtomicU64,
    pub failed_preparations: AtomicU64,
    pub failed_metadata_writes: AtomicU64,
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct TraceStoreTotals {
    pub number_of_allocations: AtomicU64,
    pub allocation_size: AtomicU64,
}

/// Everything persisted about one store
#[repr(C)]
#[derive(Debug, Default)]
pub struct TraceStoreInfo {
    pub size_of_struct: AtomicU64,
    pub eof: TraceStoreEof,
    pub time: TraceStoreTime,
    pub stats: TraceStoreStats,
    pub totals: TraceStoreTotals,
    pub traits: AtomicU64,
}

/// Per-satellite info array stored in a primary store's `:MetadataInfo`
#[repr(C)]
#[derive(Debug, Default)]
pub struct MetadataInfo {
    pub entries: [TraceStoreInfo; MetadataKind::COUNT],
}

pub const TRACE_STORE_INFO_SIZE: usize = size_of::<TraceStoreInfo>();
pub const METADATA_INFO_SIZE: usize = size_of::<MetadataInfo>();

impl MetadataInfo {
    #[inline]
    pub fn entry(&self, kind: MetadataKind) -> &TraceStoreInfo {
        &self.entries[kind.index()]
    }
}

// ============================================================================
// Snapshots
// ============================================================================

/// Copy of a store's stats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub dropped_records: u64,
    pub exhausted_free_memory_maps: u64,
    pub allocations_outpacing_next_memory_map_preparation: u64,
    pub preferred_address_unavailable: u64,
    pub readonly_preferred_address_unavailable: u64,
    pub blocked_allocations: u64,
    pub suspended_allocations: u64,
    pub elapsed_suspension_ticks: u64,
    pub failed_preparations: u64,
    pub failed_metadata_writes: u64,
}

/// Copy of a store's totals and end of file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalsSnapshot {
    pub number_of_allocations: u64,
    pub allocation_size: u64,
    pub end_of_file: u64,
}

impl TraceStoreStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            dropped_records: load(&self.dropped_records),
            exhausted_free_memory_maps: load(&self.exhausted_free_memory_maps),
            allocations_outpacing_next_memory_map_preparation: load(
                &self.allocations_outpacing_next_memory_map_preparation,
            ),
            preferred_address_unavailable: load(&self.preferred_address_unavailable),
            readonly_preferred_address_unavailable: load(&self.readonly_preferred_address_unavailable),
            blocked_allocations: load(&self.blocked_allocations),
            suspended_allocations: load(&self.suspended_allocations),
            elapsed_suspension_ticks: load(&self.elapsed_suspension_ticks),
            failed_preparations: load(&self.failed_preparations),
            failed_metadata_writes: load(&self.failed_metadata_writes),
        }
    }

    fn counters(&self) -> [&AtomicU64; 10] {
        [
            &self.dropped_records,
            &self.exhausted_free_memory_maps,
            &self.allocations_outpacing_next_memory_map_preparation,
            &self.preferred_address_unavailable,
            &self.readonly_preferred_address_unavailable,
            &self.blocked_allocations,
            &self.suspended_allocations,
            &self.elapsed_suspension_ticks,
            &self.failed_preparations,
            &self.failed_metadata_writes,
        ]
    }
}

impl TraceStoreInfo {
    pub fn totals_snapshot(&self) -> TotalsSnapshot {
        TotalsSnapshot {
            number_of_allocations: self.totals.number_of_allocations.load(Ordering::Relaxed),
            allocation_size: self.totals.allocation_size.load(Ordering::Relaxed),
            end_of_file: self.eof.end_of_file.load(Ordering::Acquire),
        }
    }

    pub fn session_time(&self) -> SessionTime {
        SessionTime {
            frequency: self.time.frequency.load(Ordering::Relaxed),
            start_unix_nanos: self.time.start_unix_nanos.load(Ordering::Relaxed),
            start_ticks: self.time.start_ticks.load(Ordering::Relaxed),
        }
    }

    pub fn set_session_time(&self, time: SessionTime) {
        self.time.frequency.store(time.frequency, Ordering::Relaxed);
        self.time.start_unix_nanos.store(time.start_unix_nanos, Ordering::Relaxed);
        self.time.start_ticks.store(time.start_ticks, Ordering::Relaxed);
    }

    /// Raise the end of file to `end` if it is further along
    #[inline]
    pub fn advance_eof(&self, end: u64) {
        self.eof.end_of_file.fetch_max(end, Ordering::AcqRel);
    }

    /// Add every counter of `other` into `self`
    fn merge_from(&self, other: &TraceStoreInfo) {
        for (dst, src) in self.stats.counters().iter().zip(other.stats.counters()) {
            dst.fetch_add(src.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        self.totals
            .number_of_allocations
            .fetch_add(other.totals.number_of_allocations.load(Ordering::Relaxed), Ordering::Relaxed);
        self.totals
            .allocation_size
            .fetch_add(other.totals.allocation_size.load(Ordering::Relaxed), Ordering::Relaxed);
        self.advance_eof(other.eof.end_of_file.load(Ordering::Acquire));
    }

    /// Overwrite every field of `self` with `other`
    fn copy_from(&self, other: &TraceStoreInfo) {
        for (dst, src) in self.stats.counters().iter().zip(other.stats.counters()) {
            dst.store(src.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        self.totals
            .number_of_allocations
            .store(other.totals.number_of_allocations.load(Ordering::Relaxed), Ordering::Relaxed);
        self.totals
            .allocation_size
            .store(other.totals.allocation_size.load(Ordering::Relaxed), Ordering::Relaxed);
        self.eof
            .end_of_file
            .store(other.eof.end_of_file.load(Ordering::Acquire), Ordering::Release);
        self.set_session_time(other.session_time());
        self.traits.store(other.traits.load(Ordering::Relaxed), Ordering::Relaxed);
    }
}

// ============================================================================
// Binding
// ============================================================================

/// Where a store's info currently lives
///
/// Starts out pointing at a boxed local copy; `bind` redirects it to mapped
/// memory and `unbind` copies the mapped values back before the view goes.
#[derive(Debug)]
pub struct InfoBinding {
    bound: AtomicPtr<TraceStoreInfo>,
    local: Box<TraceStoreInfo>,
}

impl InfoBinding {
    pub fn new() -> Self {
        let local = Box::<TraceStoreInfo>::default();
        local
            .size_of_struct
            .store(TRACE_STORE_INFO_SIZE as u64, Ordering::Relaxed);
        Self {
            bound: AtomicPtr::new(std::ptr::null_mut()),
            local,
        }
    }

    #[inline]
    pub fn get(&self) -> &TraceStoreInfo {
        let ptr = self.bound.load(Ordering::Acquire);
        if ptr.is_null() {
            &self.local
        } else {
            // SAFETY: bound pointers stay valid until `unbind`, which runs
            // before the backing view is unmapped.
            unsafe { &*ptr }
        }
    }

    #[inline]
    pub fn is_bound(&self) -> bool {
        !self.bound.load(Ordering::Acquire).is_null()
    }

    /// Redirect to mapped info
    ///
    /// With `merge`, counts accumulated locally are added into the mapped
    /// record (write sessions); without it the mapped record is taken as is
    /// (readonly sessions).
    ///
    /// # Safety
    /// `target` must point at a `TraceStoreInfo` inside a view that outlives
    /// the binding, i.e. until `unbind` is called.
    pub unsafe fn bind(&self, target: NonNull<TraceStoreInfo>, merge: bool) {
        let target_ref = target.as_ref();
        if merge {
            target_ref.merge_from(&self.local);
            let traits = self.local.traits.load(Ordering::Relaxed);
            if traits != 0 {
                target_ref.traits.store(traits, Ordering::Relaxed);
            }
            target_ref
                .size_of_struct
                .store(TRACE_STORE_INFO_SIZE as u64, Ordering::Relaxed);
        }
        self.bound.store(target.as_ptr(), Ordering::Release);
    }

    /// Copy mapped values back into the local record and detach
    pub fn unbind(&self) {
        let ptr = self.bound.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if !ptr.is_null() {
            // SAFETY: the caller unbinds before unmapping the view.
            let mapped = unsafe { &*ptr };
            self.local.copy_from(mapped);
        }
    }
}

impl Default for InfoBinding {
    fn default() -> Self {
        Self::new()
    }
}
