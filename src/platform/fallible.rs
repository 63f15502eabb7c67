/*!
 * Fallible Mapped Memory Access
 *
 * Reading a mapped page whose backing file was truncated raises SIGBUS.
 * Ledger records are therefore accessed through `FallibleRegion`, which
 * checks the access against both the view bounds and the length of the
 * backing file before touching memory, and reports violations as
 * `InPageError` instead of faulting.
 *
 * The file length is not queried per access. `BackingFile` caches the
 * length the store itself last extended or truncated the file to, which is
 * the only way the engine changes it.
 */

use std::fs::File;
use std::mem::{align_of, size_of};
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Failure of a checked mapped memory access
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InPageError {
    #[error("access of {len} bytes at offset {offset} outside region of {region_len} bytes")]
    OutOfRegion {
        offset: usize,
        len: usize,
        region_len: usize,
    },

    #[error("access ending at file offset {end} beyond backing file length {file_len}")]
    BeyondEndOfFile { end: u64, file_len: u64 },

    #[error("misaligned access at 0x{address:x} (alignment {alignment})")]
    Misaligned { address: usize, alignment: usize },
}

/// A store's open file together with its last known length
#[derive(Debug)]
pub struct BackingFile {
    file: File,
    len: AtomicU64,
}

impl BackingFile {
    pub fn new(file: File, len: u64) -> Self {
        Self {
            file,
            len: AtomicU64::new(len),
        }
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record that the file was extended to at least `len` bytes
    pub fn extended(&self, len: u64) {
        self.len.fetch_max(len, Ordering::AcqRel);
    }

    /// Record that the file was cut to exactly `len` bytes
    pub fn truncated(&self, len: u64) {
        self.len.store(len, Ordering::Release);
    }
}

impl Deref for BackingFile {
    type Target = File;

    fn deref(&self) -> &File {
        &self.file
    }
}

/// Types that may be read from or written to mapped bytes
///
/// # Safety
/// Implementors must be `repr(C)` (or primitive) and valid for every bit
/// pattern, including all zeroes.
pub unsafe trait MappedRecord: Copy + 'static {}

unsafe impl MappedRecord for u8 {}
unsafe impl MappedRecord for u32 {}
unsafe impl MappedRecord for u64 {}
unsafe impl MappedRecord for i64 {}
unsafe impl MappedRecord for usize {}

/// A window of mapped memory tied to the file slice backing it
#[derive(Debug, Clone)]
pub struct FallibleRegion {
    base: NonNull<u8>,
    len: usize,
    file: Arc<BackingFile>,
    file_offset: u64,
}

// SAFETY: the region is a pointer into a shared mapping; callers serialize
// writes to any given record.
unsafe impl Send for FallibleRegion {}
unsafe impl Sync for FallibleRegion {}

impl FallibleRegion {
    /// # Safety
    /// `base..base + len` must stay mapped from `file` at `file_offset` for
    /// as long as the region is used.
    pub unsafe fn new(base: NonNull<u8>, len: usize, file: Arc<BackingFile>, file_offset: u64) -> Self {
        Self {
            base,
            len,
            file,
            file_offset,
        }
    }

    #[inline]
    pub fn address(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    fn check<T>(&self, offset: usize) -> Result<NonNull<u8>, InPageError> {
        let len = size_of::<T>();
        let end = offset.checked_add(len).filter(|end| *end <= self.len);
        if end.is_none() {
            return Err(InPageError::OutOfRegion {
                offset,
                len,
                region_len: self.len,
            });
        }

        let address = self.address() + offset;
        if address % align_of::<T>() != 0 {
            return Err(InPageError::Misaligned {
                address,
                alignment: align_of::<T>(),
            });
        }

        let file_len = self.file.len();
        let file_end = self.file_offset + (offset + len) as u64;
        if file_end > file_len {
            return Err(InPageError::BeyondEndOfFile {
                end: file_end,
                file_len,
            });
        }

        // SAFETY: offset + len <= self.len, checked above.
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) })
    }

    /// Read a `T` at `offset` bytes into the region
    pub fn read<T: MappedRecord>(&self, offset: usize) -> Result<T, InPageError> {
        let ptr = self.check::<T>(offset)?;
        // SAFETY: bounds, alignment and backing were checked; T is valid for
        // any bit pattern.
        Ok(unsafe { ptr.cast::<T>().as_ptr().read_volatile() })
    }

    /// Write `value` at `offset` bytes into the region
    pub fn write<T: MappedRecord>(&self, offset: usize, value: T) -> Result<(), InPageError> {
        let ptr = self.check::<T>(offset)?;
        // SAFETY: as in `read`; the region was created over a writable view.
        unsafe { ptr.cast::<T>().as_ptr().write_volatile(value) };
        Ok(())
    }
}

/// Read a `T` from the start of `region`
#[inline]
pub fn read_mapped<T: MappedRecord>(region: &FallibleRegion) -> Result<T, InPageError> {
    region.read(0)
}

/// Write `value` to the start of `region`
#[inline]
pub fn write_mapped<T: MappedRecord>(region: &FallibleRegion, value: T) -> Result<(), InPageError> {
    region.write(0, value)
}
