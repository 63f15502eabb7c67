/*!
 * Address Ledger
 *
 * One record per memory map ever requested by a primary store, appended to
 * the store's `:Address` satellite. Records carry the preferred and actual
 * base address of the view, who asked for it and who mapped it, and a
 * timestamp for each lifecycle phase with the time spent between phases.
 *
 * Readonly sessions read the ledger back in one pass to learn which slices
 * of the file were mapped where.
 */

use super::TraceStore;
use crate::core::errors::{TraceStoreError, TraceStoreResult};
use crate::core::types::{MetadataKind, ProcessorInfo};
use crate::platform::{FallibleRegion, InPageError, MappedRecord};
use std::mem::size_of;
use std::sync::atomic::Ordering;
use tracing::warn;

// ============================================================================
// Record Layout
// ============================================================================

/// Timestamps of each lifecycle phase, zero until reached
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressTimestamps {
    pub requested: i64,
    pub prepared: i64,
    pub consumed: i64,
    pub retired: i64,
    pub released: i64,
}

/// Time spent between consecutive phases
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressElapsed {
    pub awaiting_preparation: i64,
    pub awaiting_consumption: i64,
    pub active: i64,
    pub awaiting_release: i64,
}

/// Persisted ledger entry, 128 bytes
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressRecord {
    pub preferred_base_address: u64,
    pub base_address: u64,
    pub file_offset: u64,
    pub mapped_size: u64,
    pub process_id: u32,
    pub requesting_thread_id: u32,
    pub fulfilling_thread_id: u32,
    pub mapped_sequence_id: u32,
    pub requesting_processor: u16,
    pub fulfilling_processor: u16,
    pub requesting_numa_node: u8,
    pub fulfilling_numa_node: u8,
    pub reserved: [u8; 2],
    pub timestamp: AddressTimestamps,
    pub elapsed: AddressElapsed,
}

pub const ADDRESS_RECORD_SIZE: usize = size_of::<AddressRecord>();

const _: () = assert!(ADDRESS_RECORD_SIZE == 128);

// SAFETY: repr(C), integers only.
unsafe impl MappedRecord for AddressRecord {}

/// Lifecycle phases stamped into an address record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AddressPhase {
    Requested,
    Prepared,
    Consumed,
    Retired,
    Released,
}

impl AddressRecord {
    /// Stamp `phase` at `ticks` and derive its elapsed duration
    ///
    /// Timestamps never go backwards in phase order.
    pub fn stamp(&mut self, phase: AddressPhase, ticks: i64) {
        let ts = &mut self.timestamp;
        let elapsed = &mut self.elapsed;
        let (slot, previous, duration) = match phase {
            AddressPhase::Requested => (&mut ts.requested, None, None),
            AddressPhase::Prepared => (&mut ts.prepared, Some(ts.requested), Some(&mut elapsed.awaiting_preparation)),
            AddressPhase::Consumed => (&mut ts.consumed, Some(ts.prepared), Some(&mut elapsed.awaiting_consumption)),
            AddressPhase::Retired => (&mut ts.retired, Some(ts.consumed), Some(&mut elapsed.active)),
            AddressPhase::Released => (&mut ts.released, Some(ts.retired), Some(&mut elapsed.awaiting_release)),
        };

        let ticks = match previous {
            Some(previous) => ticks.max(previous),
            None => ticks,
        };
        *slot = ticks;
        if let (Some(previous), Some(duration)) = (previous, duration) {
            *duration = if previous == 0 { 0 } else { ticks - previous };
        }
    }

    pub fn stamp_fulfilling(&mut self, processor: ProcessorInfo) {
        self.fulfilling_thread_id = processor.thread_id;
        self.fulfilling_processor = processor.processor;
        self.fulfilling_numa_node = processor.numa_node;
    }

    /// One past the last byte this map covered in the original process
    #[inline]
    pub fn end_address(&self) -> u64 {
        self.base_address + self.mapped_size
    }
}

// ============================================================================
// Mapped Slot
// ============================================================================

/// Handle on an address record living in the `:Address` satellite
#[derive(Debug, Clone)]
pub struct AddressSlot {
    region: FallibleRegion,
}

impl AddressSlot {
    pub(crate) fn new(region: FallibleRegion) -> Self {
        Self { region }
    }

    pub fn load(&self) -> Result<AddressRecord, InPageError> {
        self.region.read(0)
    }

    pub fn store(&self, record: &AddressRecord) -> Result<(), InPageError> {
        self.region.write(0, *record)
    }

    /// Read, modify and write back the record
    pub fn update(&self, f: impl FnOnce(&mut AddressRecord)) -> Result<AddressRecord, InPageError> {
        let mut record = self.load()?;
        f(&mut record);
        self.store(&record)?;
        Ok(record)
    }
}

// ============================================================================
// Ledger Operations
// ============================================================================

impl TraceStore {
    /// Append a zeroed address record stamped with the requesting thread
    ///
    /// Only primary stores keep a ledger; calling this on a satellite is a
    /// programming error.
    pub(crate) fn load_next_address(&self) -> Option<AddressSlot> {
        assert!(
            !self.is_metadata(),
            "store {}: metadata stores have no address ledger",
            self.name
        );

        let ledger = self.satellite(MetadataKind::Address)?;
        let allocation = ledger.allocate_metadata_record(ADDRESS_RECORD_SIZE)?;
        let slot = AddressSlot::new(allocation);

        let processor = self.platform.current_processor();
        let mut record = AddressRecord {
            process_id: self.platform.process_id(),
            requesting_thread_id: processor.thread_id,
            requesting_processor: processor.processor,
            requesting_numa_node: processor.numa_node,
            mapped_sequence_id: self.mapped_sequence.fetch_add(1, Ordering::AcqRel),
            ..Default::default()
        };
        record.stamp(AddressPhase::Requested, self.clock.now());

        match slot.store(&record) {
            Ok(()) => Some(slot),
            Err(error) => {
                warn!(store = %self.name, %error, "failed to write address record");
                self.note_metadata_failure();
                None
            }
        }
    }

    /// Stamp `phase` into a map's address record, tolerating a lost record
    pub(crate) fn stamp_address(&self, slot: Option<&AddressSlot>, phase: AddressPhase, f: impl FnOnce(&mut AddressRecord)) {
        let Some(slot) = slot else {
            return;
        };
        let now = self.clock.now();
        let result = slot.update(|record| {
            f(record);
            record.stamp(phase, now);
        });
        if let Err(error) = result {
            warn!(store = %self.name, ?phase, %error, "failed to stamp address record");
            self.note_metadata_failure();
        }
    }

    /// Stamp the final release of a map's view
    pub(crate) fn finalize_address_times(&self, slot: Option<&AddressSlot>) {
        self.stamp_address(slot, AddressPhase::Released, |_| {});
    }

    /// Every address record persisted by the store, in allocation order
    pub fn address_records(&self) -> TraceStoreResult<Vec<AddressRecord>> {
        if self.is_metadata() {
            return Err(TraceStoreError::InvalidArgument(format!(
                "{} is a metadata store and has no address ledger",
                self.name
            )));
        }
        let ledger = self.satellite(MetadataKind::Address).ok_or_else(|| TraceStoreError::BindFailed {
            store: self.name.clone(),
            reason: "address ledger not bound".into(),
        })?;
        ledger.read_metadata_array::<AddressRecord>(ADDRESS_RECORD_SIZE)
    }
}
