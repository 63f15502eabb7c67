/*!
 * Record Reader
 *
 * Enumerates the records of a store by walking its persisted allocation
 * log, and reads them back either through the views of a readonly bind or
 * straight from the file.
 *
 * Streaming readonly stores are never mapped up front: `stream_records`
 * maps one recorded slice at a time and unmaps it before the next.
 */

use super::memory_map::MemoryMap;
use super::traits::{StoreFlags, TraceStoreTraits};
use super::{AllocationKind, TraceStore};
use crate::core::errors::{TraceStoreError, TraceStoreResult};
use crate::core::limits::ALLOCATION_ALIGNMENT;
use crate::platform::{MappedRecord, ViewAccess};
use serde::{Deserialize, Serialize};
use std::mem::size_of;
use std::os::unix::fs::FileExt;
use tracing::{debug, warn};

/// Position of one record within a store's file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLocation {
    pub offset: u64,
    pub size: u64,
}

impl RecordLocation {
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// File slice mapped by one step of a streaming read
#[derive(Debug, Clone, Copy)]
struct StreamSlice {
    offset: u64,
    len: u64,
    preferred: usize,
}

/// Address of `location` inside the one view covering all of it
fn view_address(maps: &[Box<MemoryMap>], location: RecordLocation) -> Option<usize> {
    let index = maps.partition_point(|map| map.file_offset <= location.offset);
    let map = maps.get(index.checked_sub(1)?)?;
    let map_end = map.file_offset + map.mapping_size;
    (map.view.is_some() && map.contains_offset(location.offset) && location.end() <= map_end)
        .then(|| map.base_address + (location.offset - map.file_offset) as usize)
}

impl TraceStore {
    /// Every record of the store in allocation order
    pub fn record_locations(&self) -> TraceStoreResult<Vec<RecordLocation>> {
        let unaligned = self.traits.contains(TraceStoreTraits::NO_ALLOCATION_ALIGNMENT);
        let mut locations = Vec::new();
        let mut offset = 0u64;

        for entry in self.allocation_log()? {
            match entry {
                AllocationKind::Padding { bytes } => offset += bytes,
                AllocationKind::Data { record_size, count } => {
                    let stride = if unaligned {
                        record_size
                    } else {
                        let alignment = ALLOCATION_ALIGNMENT as u64;
                        (record_size + alignment - 1) & !(alignment - 1)
                    };
                    for index in 0..count {
                        locations.push(RecordLocation {
                            offset: offset + index * stride,
                            size: record_size,
                        });
                    }
                    offset += stride * count;
                }
            }
        }
        Ok(locations)
    }

    /// Run `f` over the bytes of one record
    ///
    /// Records inside a single readonly view are borrowed from it; anything
    /// else is read from the file.
    pub fn with_record<R>(&self, location: RecordLocation, f: impl FnOnce(&[u8]) -> R) -> TraceStoreResult<R> {
        let maps = self.readonly_maps.read();
        if let Some(start) = view_address(&maps, location) {
            // SAFETY: the range lies inside a view that is only unmapped
            // under the write lock held by rundown.
            let bytes = unsafe { std::slice::from_raw_parts(start as *const u8, location.size as usize) };
            return Ok(f(bytes));
        }
        drop(maps);

        let bytes = self.read_file_at(location.offset, location.size as usize)?;
        Ok(f(&bytes))
    }

    /// Copy of one record
    pub fn read_record(&self, location: RecordLocation) -> TraceStoreResult<Vec<u8>> {
        self.with_record(location, <[u8]>::to_vec)
    }

    /// Address a record was reloaded at, for readonly non-streaming stores
    ///
    /// `None` unless the whole record lies inside one view: a record
    /// allocated across two contiguous write maps is split over two
    /// separately placed views on reload.
    pub fn record_address(&self, location: RecordLocation) -> Option<usize> {
        view_address(&self.readonly_maps.read(), location)
    }

    /// Bytes of the file, bypassing any view
    pub(crate) fn read_file_at(&self, offset: u64, len: usize) -> TraceStoreResult<Vec<u8>> {
        let mut bytes = vec![0u8; len];
        self.file()?
            .read_exact_at(&mut bytes, offset)
            .map_err(|e| TraceStoreError::io(&self.path, e))?;
        Ok(bytes)
    }

    /// Array of fixed-size records from the start of a metadata store
    pub(crate) fn read_metadata_array<T: MappedRecord>(&self, record_size: usize) -> TraceStoreResult<Vec<T>> {
        assert_eq!(record_size, size_of::<T>(), "metadata record size mismatch");
        let end = self.info().totals_snapshot().end_of_file;
        let count = (end / record_size as u64) as usize;
        let bytes = self.read_file_at(0, count * record_size)?;
        Ok(bytes
            .chunks_exact(record_size)
            // SAFETY: `T` is valid for every bit pattern and the chunk holds
            // exactly `size_of::<T>()` bytes.
            .map(|chunk| unsafe { std::ptr::read_unaligned(chunk.as_ptr().cast::<T>()) })
            .collect())
    }

    // ========================================================================
    // Streaming
    // ========================================================================

    fn stream_slices(&self, file_len: u64) -> TraceStoreResult<Vec<StreamSlice>> {
        let mut slices: Vec<StreamSlice> = self
            .address_records()?
            .into_iter()
            .filter(|record| record.mapped_size > 0 && record.file_offset < file_len)
            .map(|record| StreamSlice {
                offset: record.file_offset,
                len: record.mapped_size.min(file_len - record.file_offset),
                preferred: record.base_address as usize,
            })
            .collect();
        slices.sort_by_key(|slice| slice.offset);
        slices.dedup_by_key(|slice| slice.offset);

        if slices.is_empty() && file_len > 0 {
            let mut offset = 0;
            while offset < file_len {
                let len = self.mapping_size.min(file_len - offset);
                slices.push(StreamSlice {
                    offset,
                    len,
                    preferred: 0,
                });
                offset += len;
            }
        }
        Ok(slices)
    }

    /// Visit every record, one mapped slice at a time
    ///
    /// `f` returns `false` to stop early. Returns the number of records
    /// visited.
    pub fn stream_records<F>(&self, mut f: F) -> TraceStoreResult<u64>
    where
        F: FnMut(RecordLocation, &[u8]) -> bool,
    {
        if !self.is_readonly() {
            return Err(TraceStoreError::InvalidArgument(format!(
                "{} is not bound readonly",
                self.name
            )));
        }

        let locations = self.record_locations()?;
        if !self.traits.contains(TraceStoreTraits::STREAMING_READ) {
            let mut visited = 0;
            for location in locations {
                visited += 1;
                if !self.with_record(location, |bytes| f(location, bytes))? {
                    break;
                }
            }
            return Ok(visited);
        }

        let file = self.file()?;
        let file_len = self
            .platform
            .file_len(file)
            .map_err(|e| TraceStoreError::io(&self.path, e))?;
        let access = if self.flags.contains(StoreFlags::COPY_ON_WRITE) {
            ViewAccess::CopyOnWrite
        } else {
            ViewAccess::ReadOnly
        };

        let mut visited = 0u64;
        let mut next = 0usize;
        for slice in self.stream_slices(file_len)? {
            let slice_end = slice.offset + slice.len;
            let first = next;
            while next < locations.len() && locations[next].offset < slice_end {
                next += 1;
            }
            let group = &locations[first..next];
            if group.is_empty() {
                continue;
            }

            // Extend the view over a record straddling the slice end.
            let view_end = group
                .iter()
                .map(RecordLocation::end)
                .max()
                .unwrap_or(slice_end)
                .max(slice_end)
                .min(file_len);
            let preferred = (slice.preferred != 0).then_some(slice.preferred);
            let view = self.map_slice(file, slice.offset, (view_end - slice.offset) as usize, access, preferred)?;
            debug!(store = %self.name, offset = slice.offset, records = group.len(), "streaming slice mapped");

            let mut keep_going = true;
            for location in group {
                if location.end() > view_end {
                    warn!(store = %self.name, offset = location.offset, "record beyond end of file");
                    continue;
                }
                let start = view.address() + (location.offset - slice.offset) as usize;
                // SAFETY: start..start + size lies inside `view`, which is
                // unmapped only after this loop.
                let bytes = unsafe { std::slice::from_raw_parts(start as *const u8, location.size as usize) };
                visited += 1;
                if !f(*location, bytes) {
                    keep_going = false;
                    break;
                }
            }

            if let Err(errno) = self.platform.unmap_view(view) {
                warn!(store = %self.name, offset = slice.offset, %errno, "failed to unmap streaming slice");
            }
            if !keep_going {
                return Ok(visited);
            }
        }

        for location in &locations[next..] {
            if location.end() > file_len {
                break;
            }
            let bytes = self.read_file_at(location.offset, location.size as usize)?;
            visited += 1;
            if !f(*location, &bytes) {
                break;
            }
        }
        Ok(visited)
    }
}
