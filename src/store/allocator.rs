/*!
 * Store-Backed Allocator
 *
 * Heap-style entry points over a store for subsystems that build their own
 * tables inside trace memory. Memory is append-only: `realloc` always fails
 * and `free` does nothing.
 */

use super::TraceStore;
use std::ptr::NonNull;
use std::sync::Arc;

/// malloc/calloc facade over one store
#[derive(Debug, Clone)]
pub struct TraceStoreAllocator {
    store: Arc<TraceStore>,
}

impl TraceStoreAllocator {
    pub fn new(store: Arc<TraceStore>) -> Self {
        Self { store }
    }

    #[inline]
    pub fn store(&self) -> &Arc<TraceStore> {
        &self.store
    }

    pub fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.store.allocate_records(size as u64, 1)
    }

    /// Store memory comes from freshly extended file pages and is always zero
    pub fn calloc(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        self.store.allocate_records(size as u64, count as u64)
    }

    pub fn try_malloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.store.try_allocate_records(size as u64, 1)
    }

    pub fn try_calloc(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        self.store.try_allocate_records(size as u64, count as u64)
    }

    /// Allocate only if the cursor already satisfies `alignment`
    pub fn aligned_malloc(&self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        self.aligned_offset_malloc(size, alignment, 0)
    }

    /// Allocate only if `cursor + offset` is a multiple of `alignment`
    ///
    /// The cursor is never advanced to reach the alignment.
    pub fn aligned_offset_malloc(&self, size: usize, alignment: usize, offset: usize) -> Option<NonNull<u8>> {
        if !alignment.is_power_of_two() {
            return None;
        }
        let cursor = self.store.next_address()?;
        if (cursor + offset) & (alignment - 1) != 0 {
            return None;
        }
        self.malloc(size)
    }

    pub fn realloc(&self, _ptr: NonNull<u8>, _size: usize) -> Option<NonNull<u8>> {
        None
    }

    pub fn free(&self, _ptr: NonNull<u8>) {}
}
