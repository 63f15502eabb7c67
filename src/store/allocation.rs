/*!
 * Allocation Log
 *
 * Every primary store appends one record per run of same-size allocations
 * to its `:Allocation` satellite. Consecutive allocations of the same record
 * size are coalesced into a single record by bumping its count; bytes
 * skipped between allocations (page spill prevention, page alignment, the
 * unused tail of a map that could not be mapped contiguously) are logged as
 * padding so the log accounts for every byte of the file.
 *
 * Unless disabled, each allocation also appends the time it was requested
 * and its record count to the `:AllocationTimestamp` satellite. These
 * entries are never coalesced.
 */

use super::TraceStore;
use crate::core::errors::{TraceStoreError, TraceStoreResult};
use crate::core::types::MetadataKind;
use crate::platform::{FallibleRegion, MappedRecord};
use std::mem::size_of;
use tracing::warn;

/// On-disk count marking a padding record
const PADDING_SENTINEL: i64 = -1;

/// Persisted log entry, 16 bytes
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationRecord {
    pub record_size: u64,
    pub number_of_records: i64,
}

pub const ALLOCATION_RECORD_SIZE: usize = size_of::<AllocationRecord>();

// SAFETY: repr(C), integers only.
unsafe impl MappedRecord for AllocationRecord {}

/// Persisted timestamp entry, 16 bytes
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationTimestamp {
    /// Session clock ticks when the allocation was requested
    pub timestamp: i64,
    pub number_of_records: u64,
}

pub const ALLOCATION_TIMESTAMP_SIZE: usize = size_of::<AllocationTimestamp>();

// SAFETY: repr(C), integers only.
unsafe impl MappedRecord for AllocationTimestamp {}

/// Decoded log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationKind {
    Data { record_size: u64, count: u64 },
    Padding { bytes: u64 },
}

impl AllocationKind {
    /// Bytes of the file covered by the entry
    #[inline]
    pub fn total_bytes(&self) -> u64 {
        match *self {
            AllocationKind::Data { record_size, count } => record_size * count,
            AllocationKind::Padding { bytes } => bytes,
        }
    }

    #[inline]
    pub fn is_padding(&self) -> bool {
        matches!(self, AllocationKind::Padding { .. })
    }
}

impl From<AllocationKind> for AllocationRecord {
    fn from(kind: AllocationKind) -> Self {
        match kind {
            AllocationKind::Data { record_size, count } => AllocationRecord {
                record_size,
                number_of_records: i64::try_from(count).unwrap_or(i64::MAX),
            },
            AllocationKind::Padding { bytes } => AllocationRecord {
                record_size: bytes,
                number_of_records: PADDING_SENTINEL,
            },
        }
    }
}

impl From<AllocationRecord> for AllocationKind {
    fn from(record: AllocationRecord) -> Self {
        if record.number_of_records == PADDING_SENTINEL {
            AllocationKind::Padding {
                bytes: record.record_size,
            }
        } else {
            AllocationKind::Data {
                record_size: record.record_size,
                count: record.number_of_records.max(0) as u64,
            }
        }
    }
}

/// Writer-side state of the log
#[derive(Debug, Default)]
pub(crate) struct AllocationLog {
    /// Last record appended, with the mapped memory it lives in
    current: Option<(FallibleRegion, AllocationKind)>,
}

/// How much of one allocation made it into the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AllocationLogged {
    Complete,
    /// The padding entry was written, the data entry was not
    PaddingOnly,
    Nothing,
}

impl TraceStore {
    /// Log one allocation, preceded by `padding` skipped bytes
    ///
    /// A partial result is not an allocation failure: the primary
    /// allocation has already been committed when this runs.
    pub(crate) fn record_allocation(&self, padding: u64, record_size: u64, count: u64) -> AllocationLogged {
        if self.is_readonly() || self.is_metadata() {
            panic!("store {}: allocations are only logged for writable primary stores", self.name);
        }

        let mut log = self.allocation_log.lock();

        if padding > 0 && !self.append_allocation(&mut log, AllocationKind::Padding { bytes: padding }) {
            return AllocationLogged::Nothing;
        }
        let partial = if padding > 0 {
            AllocationLogged::PaddingOnly
        } else {
            AllocationLogged::Nothing
        };

        if self.coalesces_allocations() {
            if let Some((region, AllocationKind::Data { record_size: size, count: current })) = log.current.as_mut() {
                if *size == record_size {
                    let updated = AllocationKind::Data {
                        record_size,
                        count: *current + count,
                    };
                    match region.write(0, AllocationRecord::from(updated)) {
                        Ok(()) => {
                            *current += count;
                            return AllocationLogged::Complete;
                        }
                        Err(error) => {
                            warn!(store = %self.name, %error, "failed to coalesce allocation record");
                            log.current = None;
                            self.note_metadata_failure();
                            return partial;
                        }
                    }
                }
            }
        }

        if self.append_allocation(&mut log, AllocationKind::Data { record_size, count }) {
            AllocationLogged::Complete
        } else {
            partial
        }
    }

    fn append_allocation(&self, log: &mut AllocationLog, kind: AllocationKind) -> bool {
        let Some(log_store) = self.satellite(MetadataKind::Allocation) else {
            return false;
        };
        let Some(region) = log_store.allocate_metadata_record(ALLOCATION_RECORD_SIZE) else {
            warn!(store = %self.name, "allocation log exhausted");
            log.current = None;
            self.note_metadata_failure();
            return false;
        };
        if let Err(error) = region.write(0, AllocationRecord::from(kind)) {
            warn!(store = %self.name, %error, "failed to write allocation record");
            log.current = None;
            self.note_metadata_failure();
            return false;
        }
        log.current = Some((region, kind));
        true
    }

    /// Append the request time of one logged allocation, best effort
    pub(crate) fn record_allocation_timestamp(&self, timestamp: i64, count: u64) {
        let Some(stamps) = self.satellite(MetadataKind::AllocationTimestamp) else {
            return;
        };
        let Some(region) = stamps.allocate_metadata_record(ALLOCATION_TIMESTAMP_SIZE) else {
            warn!(store = %self.name, "allocation timestamps exhausted");
            self.note_metadata_failure();
            return;
        };
        let entry = AllocationTimestamp {
            timestamp,
            number_of_records: count,
        };
        if let Err(error) = region.write(0, entry) {
            warn!(store = %self.name, %error, "failed to write allocation timestamp");
            self.note_metadata_failure();
        }
    }

    fn log_satellite(&self, kind: MetadataKind) -> TraceStoreResult<&TraceStore> {
        self.satellite(kind).map(|store| &**store).ok_or_else(|| TraceStoreError::BindFailed {
            store: self.name.clone(),
            reason: format!("{} satellite not bound", kind),
        })
    }

    /// Every entry of the persisted allocation log
    pub fn allocation_log(&self) -> TraceStoreResult<Vec<AllocationKind>> {
        let records = self
            .log_satellite(MetadataKind::Allocation)?
            .read_metadata_array::<AllocationRecord>(ALLOCATION_RECORD_SIZE)?;
        Ok(records.into_iter().map(AllocationKind::from).collect())
    }

    /// Every persisted allocation timestamp, in allocation order
    pub fn allocation_timestamps(&self) -> TraceStoreResult<Vec<AllocationTimestamp>> {
        self.log_satellite(MetadataKind::AllocationTimestamp)?
            .read_metadata_array::<AllocationTimestamp>(ALLOCATION_TIMESTAMP_SIZE)
    }
}
