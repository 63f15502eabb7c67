/*!
 * Platform Capabilities
 *
 * The engine never calls the OS directly. Everything that extends files,
 * maps views, primes pages or asks which processor a thread runs on goes
 * through the `Platform` trait so tests can substitute slow or failing
 * implementations.
 *
 * - `SystemPlatform`: Linux implementation over `nix::sys::mman`
 * - `Allocator`: growth of memory map descriptor pools
 * - `fallible`: `Result`-returning access to mapped ledger records
 * - `ThreadPool`: process-wide worker pool for asynchronous work items
 */

mod allocator;
pub mod fallible;
mod system;
mod threadpool;

pub use allocator::{Allocator, SystemAllocator};
pub use fallible::{BackingFile, FallibleRegion, InPageError, MappedRecord};
pub use system::SystemPlatform;
pub use threadpool::ThreadPool;

use crate::core::types::ProcessorInfo;
use nix::errno::Errno;
use std::fs::File;
use std::io;
use std::ptr::NonNull;
use thiserror::Error;

// ============================================================================
// Views
// ============================================================================

/// Protection and sharing of a mapped view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewAccess {
    /// Shared read/write, writes reach the file
    ReadWrite,
    /// Private read/write, writes never reach the file
    CopyOnWrite,
    /// Shared readonly
    ReadOnly,
}

impl ViewAccess {
    #[inline]
    pub fn is_writable(self) -> bool {
        !matches!(self, ViewAccess::ReadOnly)
    }
}

/// A live mapping of a slice of a file
///
/// Views are released explicitly through `Platform::unmap_view`; dropping
/// one leaks the mapping.
#[derive(Debug)]
pub struct MappedView {
    base: NonNull<u8>,
    len: usize,
    access: ViewAccess,
}

// SAFETY: a view is plain address-space metadata; synchronization of the
// mapped bytes is the responsibility of the store owning the view.
unsafe impl Send for MappedView {}
unsafe impl Sync for MappedView {}

impl MappedView {
    /// # Safety
    /// `base..base + len` must be a mapping created by the caller.
    pub unsafe fn from_raw(base: NonNull<u8>, len: usize, access: ViewAccess) -> Self {
        Self { base, len, access }
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
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
    pub fn access(&self) -> ViewAccess {
        self.access
    }

    #[inline]
    pub fn contains(&self, address: usize) -> bool {
        address >= self.address() && address < self.address() + self.len
    }
}

/// View mapping failure
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapViewError {
    #[error("preferred address 0x{preferred:x} unavailable")]
    AddressUnavailable { preferred: usize },

    #[error("mapping failed: {0}")]
    Os(Errno),
}

// ============================================================================
// Platform Trait
// ============================================================================

/// OS capability object consumed by the engine
pub trait Platform: Send + Sync + 'static {
    /// Page size used for spill prevention, page alignment and prefaulting
    fn page_size(&self) -> usize;

    /// Grow `file` to at least `len` bytes
    fn extend_file(&self, file: &File, len: u64) -> io::Result<()>;

    /// Current length of `file`
    fn file_len(&self, file: &File) -> io::Result<u64>;

    /// Set `file` to exactly `len` bytes
    fn truncate_file(&self, file: &File, len: u64) -> io::Result<()>;

    /// Map `len` bytes of `file` at `offset`
    ///
    /// With a `preferred` address the view must land exactly there or the
    /// call fails with `MapViewError::AddressUnavailable`.
    fn map_view(
        &self,
        file: &File,
        offset: u64,
        len: usize,
        access: ViewAccess,
        preferred: Option<usize>,
    ) -> Result<MappedView, MapViewError>;

    /// Write dirty pages of a shared view back to its file
    fn flush_view(&self, view: &MappedView) -> Result<(), Errno>;

    /// Release a view
    fn unmap_view(&self, view: MappedView) -> Result<(), Errno>;

    /// Ask the kernel to fault in the page containing `address`
    ///
    /// Must be harmless if the page has been unmapped in the meantime.
    fn prefault(&self, address: usize);

    /// Thread, processor and NUMA node of the calling thread
    fn current_processor(&self) -> ProcessorInfo;

    /// Id of the current process
    fn process_id(&self) -> u32;
}
