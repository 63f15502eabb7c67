/*!
 * Descriptor Allocator
 * Heap allocation of memory map descriptors when a pool grows
 */

use crate::store::memory_map::MemoryMap;

/// Allocator used for every non trace store heap allocation the engine makes
pub trait Allocator: Send + Sync + 'static {
    /// Allocate `count` zeroed descriptors
    ///
    /// Returns `None` when memory is exhausted; the caller treats this as
    /// a dropped record, never as a panic.
    fn allocate_maps(&self, count: usize) -> Option<Vec<Box<MemoryMap>>>;
}

/// Global heap allocator with fallible reservation
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl Allocator for SystemAllocator {
    fn allocate_maps(&self, count: usize) -> Option<Vec<Box<MemoryMap>>> {
        let mut maps = Vec::new();
        maps.try_reserve_exact(count).ok()?;
        maps.extend((0..count).map(|_| Box::<MemoryMap>::default()));
        Some(maps)
    }
}
