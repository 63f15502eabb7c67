/*!
 * Memory Map Pool
 *
 * Per-store free list of reusable descriptors plus the queues descriptors
 * travel through (prepare, ready, close, prefault). Every queue is a
 * lock-free `SegQueue`; a descriptor is a `Box` that lives in exactly one
 * queue or is held by exactly one owner at a time.
 *
 * # Performance
 *
 * - Acquire/release are a single lock-free pop/push after warm-up
 * - Growth allocates a batch through the store's `Allocator`
 */

use super::memory_map::MemoryMap;
use crate::core::limits::*;
use crate::core::types::StoreKind;
use crate::platform::Allocator;
use crate::store::traits::TraceStoreTraits;
use crossbeam_queue::SegQueue;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Queues a descriptor can sit in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapQueue {
    Free,
    Prepare,
    Ready,
    Close,
    Prefault,
}

/// Where every descriptor of a store currently is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolCensus {
    pub total: u32,
    pub outstanding: u32,
    pub free: usize,
    pub prepare: usize,
    pub ready: usize,
    pub close: usize,
    pub prefault: usize,
}

/// Descriptors for a store of `kind` with `traits`
///
/// Single record stores and readonly satellites need exactly one.
pub fn required_map_count(traits: TraceStoreTraits, kind: StoreKind, readonly: bool) -> u32 {
    let metadata = kind.is_metadata();
    if traits.is_single_record() || (readonly && metadata) {
        return 1;
    }

    let count = match (readonly, metadata) {
        (true, _) if traits.contains(TraceStoreTraits::STREAMING_READ) => INITIAL_STREAMING_READER_MAPS,
        (true, true) => INITIAL_NON_STREAMING_METADATA_READER_MAPS,
        (true, false) => INITIAL_NON_STREAMING_READER_MAPS,
        (false, _) if traits.contains(TraceStoreTraits::STREAMING_WRITE) => INITIAL_STREAMING_WRITER_MAPS,
        (false, true) => INITIAL_NON_STREAMING_METADATA_WRITER_MAPS,
        (false, false) => INITIAL_NON_STREAMING_WRITER_MAPS,
    };

    if traits.contains(TraceStoreTraits::FREQUENT_ALLOCATIONS) {
        count * FREQUENT_ALLOCATOR_MAP_MULTIPLIER
    } else {
        count
    }
}

/// Descriptor pool and queues of one store
pub struct MemoryMapPool {
    free: SegQueue<Box<MemoryMap>>,
    prepare: SegQueue<Box<MemoryMap>>,
    ready: SegQueue<Box<MemoryMap>>,
    close: SegQueue<Box<MemoryMap>>,
    prefault: SegQueue<Box<MemoryMap>>,
    /// Descriptors ever created
    total: AtomicU32,
    /// Descriptors not on the free list
    outstanding: AtomicU32,
    growth_count: u32,
    single: bool,
    allocator: Arc<dyn Allocator>,
}

impl MemoryMapPool {
    pub fn new(allocator: Arc<dyn Allocator>, growth_count: u32) -> Self {
        Self {
            free: SegQueue::new(),
            prepare: SegQueue::new(),
            ready: SegQueue::new(),
            close: SegQueue::new(),
            prefault: SegQueue::new(),
            total: AtomicU32::new(0),
            outstanding: AtomicU32::new(0),
            growth_count,
            single: growth_count == 1,
            allocator,
        }
    }

    fn queue(&self, queue: MapQueue) -> &SegQueue<Box<MemoryMap>> {
        match queue {
            MapQueue::Free => &self.free,
            MapQueue::Prepare => &self.prepare,
            MapQueue::Ready => &self.ready,
            MapQueue::Close => &self.close,
            MapQueue::Prefault => &self.prefault,
        }
    }

    /// Allocate `desired` descriptors, returning one and freeing the rest
    ///
    /// `desired` must be a power of two. Returns `None` if the allocator is
    /// exhausted.
    pub fn create_maps(&self, desired: u32) -> Option<Box<MemoryMap>> {
        assert!(
            desired.is_power_of_two(),
            "memory map count {} is not a power of two",
            desired
        );
        if self.single && self.total.load(Ordering::Acquire) > 0 {
            panic!("single map pool asked to grow");
        }

        let Some(mut maps) = self.allocator.allocate_maps(desired as usize) else {
            warn!(desired, "memory map allocation failed");
            return None;
        };
        let first = maps.pop()?;

        self.total.fetch_add(maps.len() as u32 + 1, Ordering::AcqRel);
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        for map in maps {
            self.free.push(map);
        }
        debug!(desired, total = self.total(), "memory maps created");
        Some(first)
    }

    /// Take a descriptor, growing the pool if the free list is empty
    pub fn acquire(&self) -> Option<Box<MemoryMap>> {
        if let Some(map) = self.try_acquire_spare() {
            return Some(map);
        }
        if self.single && self.total() > 0 {
            return None;
        }
        self.create_maps(self.growth_count)
    }

    /// Take a descriptor only if one is already free
    pub fn try_acquire_spare(&self) -> Option<Box<MemoryMap>> {
        let map = self.free.pop()?;
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Some(map)
    }

    /// Zero a descriptor and put it back on the free list
    ///
    /// Returns `true` when this was the last outstanding descriptor.
    pub fn release(&self, mut map: Box<MemoryMap>) -> bool {
        map.reset();
        self.free.push(map);
        let previous = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "released more descriptors than acquired");
        previous == 1
    }

    /// Hand a held descriptor to `queue`
    #[inline]
    pub fn push(&self, queue: MapQueue, map: Box<MemoryMap>) {
        debug_assert_ne!(queue, MapQueue::Free, "use release for the free list");
        self.queue(queue).push(map);
    }

    /// Take the oldest descriptor from `queue`
    #[inline]
    pub fn pop(&self, queue: MapQueue) -> Option<Box<MemoryMap>> {
        debug_assert_ne!(queue, MapQueue::Free, "use acquire for the free list");
        self.queue(queue).pop()
    }

    #[inline]
    pub fn len(&self, queue: MapQueue) -> usize {
        self.queue(queue).len()
    }

    /// Descriptors created per growth step
    #[inline]
    pub fn growth_count(&self) -> u32 {
        self.growth_count
    }

    #[inline]
    pub fn total(&self) -> u32 {
        self.total.load(Ordering::Acquire)
    }

    #[inline]
    pub fn outstanding(&self) -> u32 {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn census(&self) -> PoolCensus {
        PoolCensus {
            total: self.total(),
            outstanding: self.outstanding(),
            free: self.len(MapQueue::Free),
            prepare: self.len(MapQueue::Prepare),
            ready: self.len(MapQueue::Ready),
            close: self.len(MapQueue::Close),
            prefault: self.len(MapQueue::Prefault),
        }
    }
}

impl std::fmt::Debug for MemoryMapPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryMapPool").field("census", &self.census()).finish()
    }
}
