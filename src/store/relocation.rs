/*!
 * Relocation
 *
 * A store whose records embed pointers into other stores declares which
 * byte offsets hold them. The table is persisted to the store's
 * `:Relocation` satellite when the store is bound for writing and read back
 * on readonly binds, where every reloaded map may sit at a different base.
 *
 * On-disk layout: `{ size_of_struct: u32, number_of_relocations: u32 }`
 * followed by `{ offset: u32, target: u32 }` entries.
 */

use super::TraceStore;
use crate::core::errors::{TraceStoreError, TraceStoreResult};
use crate::core::types::{MetadataKind, TraceStoreId};
use crate::platform::FallibleRegion;
use serde::{Deserialize, Serialize};
use std::mem::size_of;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use tracing::debug;

const HEADER_SIZE: usize = 2 * size_of::<u32>();
const ENTRY_SIZE: usize = 2 * size_of::<u32>();

/// One pointer-sized field of a record pointing into `target`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRelocation {
    pub offset: u32,
    pub target: TraceStoreId,
}

impl FieldRelocation {
    pub const fn new(offset: u32, target: TraceStoreId) -> Self {
        Self { offset, target }
    }
}

/// Pointer fields of a store's records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocationTable {
    pub fields: Vec<FieldRelocation>,
}

impl RelocationTable {
    pub fn new(fields: &[FieldRelocation]) -> Self {
        Self {
            fields: fields.to_vec(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Bytes the table occupies on disk
    pub fn persisted_size(&self) -> usize {
        HEADER_SIZE + self.fields.len() * ENTRY_SIZE
    }
}

// ============================================================================
// Address Translation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TranslatedRange {
    original: u64,
    actual: u64,
    len: u64,
}

/// Maps addresses of the recording process onto a reloaded store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressTranslator {
    ranges: Vec<TranslatedRange>,
}

impl AddressTranslator {
    /// Build from `(original base, actual base, length)` triples
    pub fn new(ranges: impl IntoIterator<Item = (u64, u64, u64)>) -> Self {
        let mut ranges: Vec<_> = ranges
            .into_iter()
            .filter(|&(original, _, len)| original != 0 && len != 0)
            .map(|(original, actual, len)| TranslatedRange { original, actual, len })
            .collect();
        ranges.sort_by_key(|range| range.original);
        Self { ranges }
    }

    pub fn translate(&self, original: u64) -> Option<u64> {
        let index = self.ranges.partition_point(|range| range.original <= original);
        let range = self.ranges.get(index.checked_sub(1)?)?;
        let delta = original - range.original;
        (delta < range.len).then(|| range.actual + delta)
    }

    /// Every range reloaded at its original address
    pub fn is_identity(&self) -> bool {
        self.ranges.iter().all(|range| range.original == range.actual)
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

// ============================================================================
// Persistence
// ============================================================================

impl TraceStore {
    /// Persisted relocation table of the store, if it has one
    pub fn relocations(&self) -> Option<&RelocationTable> {
        if self.is_readonly() {
            self.loaded_relocations.get().and_then(Option::as_ref)
        } else {
            self.relocations.as_ref().filter(|table| !table.is_empty())
        }
    }

    /// Address translation of a reloaded non-streaming store
    pub fn translator(&self) -> Option<&AddressTranslator> {
        self.translator.get()
    }

    /// Copy the relocation table into the `:Relocation` satellite
    pub(crate) fn save_relocation_info(&self) -> TraceStoreResult<()> {
        let Some(table) = self.relocations.as_ref().filter(|table| !table.is_empty()) else {
            return Ok(());
        };
        let satellite = self.relocation_satellite()?;
        let size = table.persisted_size();
        let allocation = satellite
            .allocate(size as u64, 1)
            .ok_or_else(|| TraceStoreError::ExhaustedFreeMemoryMaps(satellite.name.clone()))?;

        // SAFETY: the allocation is `size` bytes of a live writable view of
        // the satellite's file.
        let region = unsafe {
            FallibleRegion::new(
                allocation.ptr,
                size,
                Arc::clone(satellite.file()?),
                allocation.file_offset,
            )
        };
        region.write(0, HEADER_SIZE as u32)?;
        region.write(4, table.fields.len() as u32)?;
        for (index, field) in table.fields.iter().enumerate() {
            let at = HEADER_SIZE + index * ENTRY_SIZE;
            region.write(at, field.offset)?;
            region.write(at + 4, u32::from(field.target.0))?;
        }

        debug!(store = %self.name, relocations = table.fields.len(), "relocation info saved");
        Ok(())
    }

    /// Read the persisted relocation table back; an empty table is `None`
    pub(crate) fn load_relocation_info(&self) -> TraceStoreResult<Option<RelocationTable>> {
        let satellite = self.relocation_satellite()?;
        let file = satellite.file()?;
        let end = satellite.info().totals_snapshot().end_of_file;
        if end < HEADER_SIZE as u64 {
            return Ok(None);
        }

        let corrupt = |reason: String| TraceStoreError::CorruptMetadata {
            store: satellite.name.clone(),
            reason,
        };
        let read_u32 = |offset: u64| -> TraceStoreResult<u32> {
            let mut raw = [0u8; 4];
            file.read_exact_at(&mut raw, offset)
                .map_err(|e| TraceStoreError::io(&satellite.path, e))?;
            Ok(u32::from_ne_bytes(raw))
        };

        let header_size = read_u32(0)?;
        let count = read_u32(4)?;
        if header_size as usize != HEADER_SIZE {
            return Err(corrupt(format!("relocation header size {}", header_size)));
        }
        if count == 0 {
            return Ok(None);
        }
        if HEADER_SIZE as u64 + u64::from(count) * ENTRY_SIZE as u64 > end {
            return Err(corrupt(format!("{} relocations exceed end of file {}", count, end)));
        }

        let mut fields = Vec::with_capacity(count as usize);
        for index in 0..u64::from(count) {
            let at = HEADER_SIZE as u64 + index * ENTRY_SIZE as u64;
            let offset = read_u32(at)?;
            let target = u16::try_from(read_u32(at + 4)?)
                .map_err(|_| corrupt(format!("relocation {} targets an invalid store", index)))?;
            fields.push(FieldRelocation::new(offset, TraceStoreId(target)));
        }
        Ok(Some(RelocationTable { fields }))
    }

    fn relocation_satellite(&self) -> TraceStoreResult<&Arc<TraceStore>> {
        self.satellite(MetadataKind::Relocation)
            .ok_or_else(|| TraceStoreError::BindFailed {
                store: self.name.clone(),
                reason: "relocation store not bound".into(),
            })
    }

    /// Rewrite the pointer fields of `record` for the reloaded stores
    ///
    /// `lookup` resolves a target store id to its translator. Null pointers
    /// and pointers outside every recorded range are left as they are.
    /// Returns the number of fields rewritten.
    pub fn relocate_record<'t, F>(&self, record: &mut [u8], lookup: F) -> TraceStoreResult<usize>
    where
        F: Fn(TraceStoreId) -> Option<&'t AddressTranslator>,
    {
        let Some(table) = self.relocations() else {
            return Ok(0);
        };

        const WIDTH: usize = size_of::<usize>();
        let len = record.len();
        let mut rewritten = 0;
        for field in &table.fields {
            let start = field.offset as usize;
            let bytes = record.get_mut(start..start + WIDTH).ok_or_else(|| {
                TraceStoreError::InvalidArgument(format!(
                    "relocation at offset {} outside record of {} bytes",
                    start, len
                ))
            })?;

            let mut raw = [0u8; WIDTH];
            raw.copy_from_slice(bytes);
            let value = usize::from_ne_bytes(raw) as u64;
            if value == 0 {
                continue;
            }

            let Some(actual) = lookup(field.target).and_then(|translator| translator.translate(value)) else {
                continue;
            };
            bytes.copy_from_slice(&(actual as usize).to_ne_bytes());
            rewritten += 1;
        }
        Ok(rewritten)
    }
}
