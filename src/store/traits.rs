/*!
 * Store Traits
 *
 * Static per-store-kind behaviour bits, their invariants, and the runtime
 * mode flags derived from them at bind time.
 */

use crate::core::errors::{TraceStoreError, TraceStoreResult};
use crate::core::types::{MetadataKind, StoreKind};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Fixed behaviour of a store kind, persisted in its `:Info` record
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct TraceStoreTraits: u32 {
        const VARYING_RECORD_SIZE              = 1 << 0;
        const RECORD_SIZE_IS_ALWAYS_POWER_OF_2 = 1 << 1;
        const MULTIPLE_RECORDS                 = 1 << 2;
        const STREAMING_WRITE                  = 1 << 3;
        const STREAMING_READ                   = 1 << 4;
        const FREQUENT_ALLOCATIONS             = 1 << 5;
        const BLOCKING_ALLOCATIONS             = 1 << 6;
        const LINKED_STORE                     = 1 << 7;
        const COALESCED_ALLOCATIONS            = 1 << 8;
        const CONCURRENT_ALLOCATIONS           = 1 << 9;
        const WANTS_PAGE_ALIGNMENT             = 1 << 10;
        const PREVENT_PAGE_SPILL               = 1 << 11;
        const NO_ALLOCATION_ALIGNMENT          = 1 << 12;
        const SINGLE_RECORD                    = 1 << 13;
    }
}

bitflags! {
    /// Runtime mode of a bound store
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StoreFlags: u32 {
        const READONLY                   = 1 << 0;
        const NO_PREFAULTING             = 1 << 1;
        const NO_RETIRE                  = 1 << 2;
        const NO_TRUNCATE                = 1 << 3;
        const HAS_RELOCATIONS            = 1 << 4;
        const IGNORE_PREFERRED_ADDRESSES = 1 << 5;
        const HARD_METADATA_FAILURES     = 1 << 6;
        const COPY_ON_WRITE              = 1 << 7;
        const NO_COALESCING              = 1 << 8;
        const NO_ALLOCATION_TIMESTAMPS   = 1 << 9;
    }
}

impl TraceStoreTraits {
    #[inline]
    pub fn is_single_record(self) -> bool {
        self.contains(Self::SINGLE_RECORD)
    }

    #[inline]
    pub fn is_blocking(self) -> bool {
        self.contains(Self::BLOCKING_ALLOCATIONS)
    }

    #[inline]
    pub fn is_concurrent(self) -> bool {
        self.contains(Self::CONCURRENT_ALLOCATIONS)
    }

    /// Forward padding applies to this store
    #[inline]
    pub fn prevents_page_spill(self) -> bool {
        self.contains(Self::PREVENT_PAGE_SPILL | Self::MULTIPLE_RECORDS)
            && !self.contains(Self::RECORD_SIZE_IS_ALWAYS_POWER_OF_2)
    }

    #[inline]
    pub fn wants_page_alignment(self) -> bool {
        self.contains(Self::WANTS_PAGE_ALIGNMENT)
    }

    /// Allocation sizes are used as given, without rounding up
    #[inline]
    pub fn skips_alignment(self) -> bool {
        self.contains(Self::NO_ALLOCATION_ALIGNMENT)
    }

    /// Check every trait invariant for a store of `kind`
    pub fn validate(self, kind: StoreKind) -> TraceStoreResult<()> {
        let is_metadata = kind.is_metadata();
        let fail = |rule: &str| Err(TraceStoreError::TraitViolation(format!("{:?}: {}", self, rule)));

        if self.contains(Self::VARYING_RECORD_SIZE) && !self.contains(Self::MULTIPLE_RECORDS) {
            return fail("VaryingRecordSize requires MultipleRecords");
        }

        if !self.contains(Self::MULTIPLE_RECORDS)
            && self.intersects(Self::STREAMING_WRITE | Self::STREAMING_READ)
        {
            return fail("streaming requires MultipleRecords");
        }

        if self.contains(Self::SINGLE_RECORD) && self.contains(Self::MULTIPLE_RECORDS) {
            return fail("SingleRecord excludes MultipleRecords");
        }

        if self.contains(Self::LINKED_STORE) && !self.contains(Self::BLOCKING_ALLOCATIONS) {
            return fail("LinkedStore requires BlockingAllocations");
        }

        let needs_multiple = Self::FREQUENT_ALLOCATIONS
            | Self::COALESCED_ALLOCATIONS
            | Self::CONCURRENT_ALLOCATIONS
            | Self::WANTS_PAGE_ALIGNMENT
            | Self::PREVENT_PAGE_SPILL
            | Self::NO_ALLOCATION_ALIGNMENT;
        if self.intersects(needs_multiple) && !self.contains(Self::MULTIPLE_RECORDS) {
            return fail("allocation shaping traits require MultipleRecords");
        }

        let primary_only = Self::COALESCED_ALLOCATIONS
            | Self::CONCURRENT_ALLOCATIONS
            | Self::WANTS_PAGE_ALIGNMENT
            | Self::PREVENT_PAGE_SPILL
            | Self::NO_ALLOCATION_ALIGNMENT;
        if is_metadata && self.intersects(primary_only) {
            return fail("allocation shaping traits are illegal on metadata stores");
        }

        if self.contains(Self::RECORD_SIZE_IS_ALWAYS_POWER_OF_2)
            && self.intersects(Self::PREVENT_PAGE_SPILL | Self::NO_ALLOCATION_ALIGNMENT)
        {
            return fail("power of 2 record sizes exclude page spill prevention and unaligned allocations");
        }

        if self.contains(Self::WANTS_PAGE_ALIGNMENT | Self::PREVENT_PAGE_SPILL) {
            return fail("WantsPageAlignment excludes PreventPageSpill");
        }

        Ok(())
    }

    /// Static traits of each satellite store kind
    pub const fn for_metadata(kind: MetadataKind) -> Self {
        match kind {
            MetadataKind::MetadataInfo | MetadataKind::Info => Self::SINGLE_RECORD,
            MetadataKind::Allocation | MetadataKind::AllocationTimestamp | MetadataKind::Address => {
                Self::MULTIPLE_RECORDS
                    .union(Self::STREAMING_WRITE)
                    .union(Self::STREAMING_READ)
            }
            MetadataKind::Relocation | MetadataKind::Bitmap => {
                Self::VARYING_RECORD_SIZE.union(Self::MULTIPLE_RECORDS)
            }
        }
    }
}

impl StoreFlags {
    /// Flags implied by `traits` for a store opened in the given mode
    pub fn derive(traits: TraceStoreTraits, readonly: bool) -> Self {
        let mut flags = StoreFlags::empty();
        if readonly {
            flags |= StoreFlags::READONLY;
            if !traits.contains(TraceStoreTraits::STREAMING_READ) {
                flags |= StoreFlags::NO_RETIRE;
            }
        } else if !traits.contains(TraceStoreTraits::STREAMING_WRITE) {
            flags |= StoreFlags::NO_RETIRE;
        }
        if traits.is_single_record() {
            flags |= StoreFlags::NO_PREFAULTING | StoreFlags::NO_TRUNCATE;
        }
        flags
    }
}
