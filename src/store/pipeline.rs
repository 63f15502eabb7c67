/*!
 * Memory Map Pipeline
 *
 * Moves descriptors through prepare, consume, retire and close. The calling
 * thread only ever consumes: it pops a map a worker prepared ahead of time,
 * queues preparation of the slice after it and hands the map from two
 * generations ago to a close worker.
 *
 * # Generation Ring
 *
 * Active, pending and retiring maps live in a ring of three slots indexed
 * by generation. Activating generation `G` retires generation `G - 2`, so a
 * map superseded a moment ago stays mapped for one more generation.
 */

use super::address::AddressPhase;
use super::memory_map::{MapState, MemoryMap};
use super::pool::MapQueue;
use super::traits::StoreFlags;
use super::TraceStore;
use crate::core::errors::{TraceStoreError, TraceStoreResult};
use crate::core::limits::{GENERATION_RING_CAPACITY, PREFAULT_PAGES_AFTER_PREPARE};
use crate::platform::{MapViewError, MappedView, ViewAccess};
use std::fs::File;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

// ============================================================================
// Active State
// ============================================================================

/// Hot path state of a store, guarded by the store's `active` lock
#[derive(Debug, Default)]
pub(crate) struct ActiveState {
    ring: [Option<Box<MemoryMap>>; GENERATION_RING_CAPACITY],
    /// Generation of the active map, zero before the first consume
    generation: u64,
    last_retired_generation: u64,
    /// File offset one past the last allocation the log accounts for
    pub(crate) logical_end: u64,
    pub(crate) single_allocated: bool,
}

impl ActiveState {
    #[inline]
    fn slot(generation: u64) -> usize {
        (generation % GENERATION_RING_CAPACITY as u64) as usize
    }

    #[inline]
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub(crate) fn last_retired_generation(&self) -> u64 {
        self.last_retired_generation
    }

    #[inline]
    pub(crate) fn active(&self) -> Option<&MemoryMap> {
        if self.generation == 0 {
            return None;
        }
        self.ring[Self::slot(self.generation)].as_deref()
    }

    #[inline]
    pub(crate) fn active_mut(&mut self) -> Option<&mut MemoryMap> {
        if self.generation == 0 {
            return None;
        }
        self.ring[Self::slot(self.generation)].as_deref_mut()
    }

    fn get_mut(&mut self, generation: u64) -> Option<&mut MemoryMap> {
        self.ring[Self::slot(generation)]
            .as_deref_mut()
            .filter(|map| map.generation == generation)
    }

    fn take(&mut self, generation: u64) -> Option<Box<MemoryMap>> {
        let slot = &mut self.ring[Self::slot(generation)];
        if slot.as_ref().is_some_and(|map| map.generation == generation) {
            slot.take()
        } else {
            None
        }
    }

    fn install(&mut self, map: Box<MemoryMap>) {
        let slot = &mut self.ring[Self::slot(map.generation)];
        assert!(slot.is_none(), "generation ring slot still occupied");
        *slot = Some(map);
    }

    /// Descriptors currently held by the ring
    pub(crate) fn occupied(&self) -> usize {
        self.ring.iter().filter(|slot| slot.is_some()).count()
    }

    /// Empty the ring, oldest generation first
    fn drain(&mut self) -> Vec<Box<MemoryMap>> {
        let mut maps: Vec<_> = self.ring.iter_mut().filter_map(Option::take).collect();
        maps.sort_by_key(|map| map.generation);
        self.generation = 0;
        maps
    }
}

// ============================================================================
// Preparation
// ============================================================================

impl TraceStore {
    /// Extend the file, map the descriptor's slice and prime its first pages
    pub(crate) fn prepare_memory_map(&self, map: &mut MemoryMap) -> TraceStoreResult<()> {
        let file = Arc::clone(self.file()?);
        let end = map.file_offset + map.mapping_size;
        self.platform
            .extend_file(&file, end)
            .map_err(|e| TraceStoreError::io(&self.path, e))?;
        file.extended(end);

        let len = usize::try_from(map.mapping_size)
            .map_err(|_| TraceStoreError::InvalidArgument(format!("mapping size {} too large", map.mapping_size)))?;
        let preferred = (map.preferred_base_address != 0).then_some(map.preferred_base_address);
        let view = self.map_slice(&file, map.file_offset, len, ViewAccess::ReadWrite, preferred)?;

        if self.prefaulting() {
            self.prime_pages(&view);
        }

        map.base_address = view.address();
        map.next_address = map.base_address;
        map.view = Some(view);

        let (preferred, base, offset, size) = (
            map.preferred_base_address as u64,
            map.base_address as u64,
            map.file_offset,
            map.mapping_size,
        );
        let processor = self.platform.current_processor();
        self.stamp_address(map.address.as_ref(), AddressPhase::Prepared, |record| {
            record.preferred_base_address = preferred;
            record.base_address = base;
            record.file_offset = offset;
            record.mapped_size = size;
            record.stamp_fulfilling(processor);
        });

        trace!(store = %self.name, offset, size, base, "memory map prepared");
        Ok(())
    }

    /// Map a slice, falling back to any address if the preferred one is taken
    pub(crate) fn map_slice(
        &self,
        file: &File,
        offset: u64,
        len: usize,
        access: ViewAccess,
        preferred: Option<usize>,
    ) -> TraceStoreResult<MappedView> {
        let stats = &self.info().stats;
        let unavailable = if self.is_readonly() {
            &stats.readonly_preferred_address_unavailable
        } else {
            &stats.preferred_address_unavailable
        };

        let preferred = match preferred {
            Some(_) if self.flags.contains(StoreFlags::IGNORE_PREFERRED_ADDRESSES) => {
                unavailable.fetch_add(1, Ordering::Relaxed);
                None
            }
            other => other,
        };

        match self.platform.map_view(file, offset, len, access, preferred) {
            Ok(view) => Ok(view),
            Err(MapViewError::AddressUnavailable { preferred }) => {
                unavailable.fetch_add(1, Ordering::Relaxed);
                debug!(store = %self.name, preferred, offset, "preferred address unavailable");
                self.platform
                    .map_view(file, offset, len, access, None)
                    .map_err(view_error)
            }
            Err(error) => Err(view_error(error)),
        }
    }

    fn prime_pages(&self, view: &MappedView) {
        let page = self.platform.page_size();
        let pages = (view.len() / page).min(PREFAULT_PAGES_AFTER_PREPARE);
        for index in 0..pages {
            // SAFETY: the page lies inside the view just mapped, which lies
            // inside the extended file.
            unsafe {
                std::ptr::read_volatile(view.base().as_ptr().add(index * page));
            }
        }
    }

    // ========================================================================
    // Consumption
    // ========================================================================

    /// Make the next prepared map active and queue preparation of the one after
    ///
    /// Returns `false` when no descriptor could be found for the following
    /// slice or, for non-blocking stores, when no prepared map is ready.
    pub(crate) fn consume_next(&self, state: &mut ActiveState) -> bool {
        if self.traits.is_single_record() && state.generation > 0 {
            panic!("store {}: single record stores never consume a second map", self.name);
        }

        let stats = &self.info().stats;
        let Some(prepare) = self.pool.acquire() else {
            stats.exhausted_free_memory_maps.fetch_add(1, Ordering::Relaxed);
            warn!(store = %self.name, "exhausted free memory maps");
            return false;
        };

        let next = match self.pool.pop(MapQueue::Ready) {
            Some(next) => next,
            None => {
                stats
                    .allocations_outpacing_next_memory_map_preparation
                    .fetch_add(1, Ordering::Relaxed);

                if !self.traits.is_blocking() {
                    debug!(store = %self.name, "next memory map not ready");
                    self.release_map(prepare);
                    return false;
                }

                stats.blocked_allocations.fetch_add(1, Ordering::Relaxed);
                loop {
                    if self.preparation_failed.load(Ordering::Acquire) {
                        warn!(store = %self.name, "preparation failed while blocked");
                        self.release_map(prepare);
                        return false;
                    }
                    self.events.next_map_available.wait();
                    if let Some(next) = self.pool.pop(MapQueue::Ready) {
                        break next;
                    }
                }
            }
        };

        self.advance_to(state, prepare, next);
        true
    }

    /// Move to the next map as soon as the active one filled up exactly
    ///
    /// Never blocks and counts nothing: if no descriptor or prepared map is
    /// at hand, the next allocation crossing the end goes through
    /// `consume_next` and accounts for it there.
    pub(crate) fn consume_ready(&self, state: &mut ActiveState) -> bool {
        let Some(prepare) = self.pool.acquire() else {
            return false;
        };
        let Some(next) = self.pool.pop(MapQueue::Ready) else {
            self.release_map(prepare);
            return false;
        };
        self.advance_to(state, prepare, next);
        true
    }

    fn advance_to(&self, state: &mut ActiveState, mut prepare: Box<MemoryMap>, next: Box<MemoryMap>) {
        prepare.file_offset = next.file_offset + next.mapping_size;
        prepare.mapping_size = self.mapping_size;
        prepare.preferred_base_address = next.base_address + next.mapping_size as usize;

        self.activate(state, next);

        if !self.is_metadata() {
            prepare.address = self.load_next_address();
        }
        prepare.transition(MapState::Preparing);
        self.pool.push(MapQueue::Prepare, prepare);
        if !self.submit_work(prepare_work) {
            prepare_work(self);
        }
    }

    /// Install a prepared map as the new active generation
    pub(crate) fn activate(&self, state: &mut ActiveState, mut map: Box<MemoryMap>) {
        let generation = state.generation + 1;
        map.transition(MapState::Active);
        map.generation = generation;
        self.stamp_address(map.address.as_ref(), AddressPhase::Consumed, |_| {});

        if let Some(previous) = state.get_mut(generation - 1) {
            previous.transition(MapState::PendingRetirement);
        }
        if generation > 2 {
            if let Some(retiring) = state.take(generation - 2) {
                state.last_retired_generation = generation - 2;
                self.retire(retiring);
            }
        }

        trace!(
            store = %self.name,
            generation,
            offset = map.file_offset,
            base = map.base_address,
            "memory map consumed"
        );
        state.install(map);
        state.generation = generation;
    }

    fn retire(&self, mut map: Box<MemoryMap>) {
        self.stamp_address(map.address.as_ref(), AddressPhase::Retired, |_| {});

        if self.flags.contains(StoreFlags::NO_RETIRE) {
            map.transition(MapState::Retained);
            self.non_retired.lock().push(map);
            return;
        }

        trace!(store = %self.name, generation = map.generation, offset = map.file_offset, "memory map retired");
        self.pool.push(MapQueue::Close, map);
        if !self.submit_work(close_work) {
            close_work(self);
        }
    }

    /// Zero a descriptor and return it to the free pool
    pub(crate) fn release_map(&self, map: Box<MemoryMap>) {
        if self.pool.release(map) {
            self.events.all_maps_free.set();
        }
    }

    /// Flush and unmap a descriptor's view, logging failures
    pub(crate) fn unmap_quietly(&self, map: &mut MemoryMap) {
        let Some(view) = map.view.take() else {
            return;
        };
        if let Err(errno) = self.platform.flush_view(&view) {
            warn!(store = %self.name, offset = map.file_offset, %errno, "failed to flush view");
            self.last_error.store(errno as i32, Ordering::Relaxed);
        }
        if let Err(errno) = self.platform.unmap_view(view) {
            warn!(store = %self.name, offset = map.file_offset, %errno, "failed to unmap view");
            self.last_error.store(errno as i32, Ordering::Relaxed);
        }
    }

    // ========================================================================
    // Prefaulting
    // ========================================================================

    /// Fault in the page at `address` on a worker, if a spare descriptor exists
    pub(crate) fn submit_prefault(&self, address: usize) {
        let Some(mut map) = self.pool.try_acquire_spare() else {
            return;
        };
        map.transition(MapState::Prefault);
        map.next_address = address;
        self.pool.push(MapQueue::Prefault, map);
        if !self.submit_work(prefault_work) {
            prefault_work(self);
        }
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Generation of the active map, zero before the first consume
    pub fn generation(&self) -> u64 {
        self.active.lock().generation()
    }

    /// Generation most recently handed to retirement
    pub fn last_retired_generation(&self) -> u64 {
        self.active.lock().last_retired_generation()
    }

    /// Cursor of the active map
    pub fn next_address(&self) -> Option<usize> {
        self.active.lock().active().map(|map| map.next_address)
    }

    /// Base address and file offset of the active map
    pub fn active_map(&self) -> Option<(usize, u64)> {
        self.active
            .lock()
            .active()
            .map(|map| (map.base_address, map.file_offset))
    }

    /// Whether every descriptor handed out has come back to the free pool
    pub fn all_maps_free(&self) -> bool {
        self.events.all_maps_free.is_set()
    }

    // ========================================================================
    // Rundown
    // ========================================================================

    /// Synchronously release every view the store holds
    ///
    /// Skips the asynchronous retirement handshake and tolerates failures.
    /// The session's workers must be idle.
    pub(crate) fn rundown(&self) {
        if self.rundown_complete.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut maps = self.active.lock().drain();
        maps.append(&mut self.non_retired.lock());
        maps.append(&mut self.readonly_maps.write());
        for queue in [MapQueue::Ready, MapQueue::Prepare, MapQueue::Close, MapQueue::Prefault] {
            while let Some(map) = self.pool.pop(queue) {
                maps.push(map);
            }
        }

        self.info.unbind();

        let count = maps.len();
        for mut map in maps {
            if matches!(map.state, MapState::Active | MapState::PendingRetirement) {
                self.stamp_address(map.address.as_ref(), AddressPhase::Retired, |_| {});
            }
            if map.view.is_some() {
                self.finalize_address_times(map.address.as_ref());
            }
            self.unmap_quietly(&mut map);
            self.release_map(map);
        }

        if !self.is_readonly() && !self.flags.contains(StoreFlags::NO_TRUNCATE) {
            if let Ok(file) = self.file() {
                let end = self.info().totals_snapshot().end_of_file;
                match self.platform.truncate_file(file, end) {
                    Ok(()) => file.truncated(end),
                    Err(error) => warn!(store = %self.name, end, %error, "failed to truncate to end of file"),
                }
            }
        }

        self.bound.store(false, Ordering::Release);
        info!(store = %self.name, maps = count, "store run down");
    }
}

fn view_error(error: MapViewError) -> TraceStoreError {
    match error {
        MapViewError::AddressUnavailable { preferred } => TraceStoreError::PreferredAddressUnavailable(preferred),
        MapViewError::Os(errno) => TraceStoreError::MapView {
            operation: "map",
            errno,
        },
    }
}

// ============================================================================
// Work Items
// ============================================================================

fn prepare_work(store: &TraceStore) {
    let Some(mut map) = store.pool.pop(MapQueue::Prepare) else {
        return;
    };

    match store.prepare_memory_map(&mut map) {
        Ok(()) => {
            map.transition(MapState::Prepared);
            store.preparation_failed.store(false, Ordering::Release);
            store.pool.push(MapQueue::Ready, map);
        }
        Err(error) => {
            store.set_last_error(&error);
            store
                .info()
                .stats
                .failed_preparations
                .fetch_add(1, Ordering::Relaxed);
            warn!(store = %store.name, offset = map.file_offset, %error, "memory map preparation failed");
            store.preparation_failed.store(true, Ordering::Release);
            map.transition(MapState::Free);
            store.release_map(map);
        }
    }
    store.events.next_map_available.set();
}

fn close_work(store: &TraceStore) {
    let Some(mut map) = store.pool.pop(MapQueue::Close) else {
        return;
    };
    map.transition(MapState::Closing);
    store.unmap_quietly(&mut map);
    store.finalize_address_times(map.address.as_ref());
    trace!(store = %store.name, offset = map.file_offset, "memory map closed");
    map.transition(MapState::Free);
    store.release_map(map);
}

fn prefault_work(store: &TraceStore) {
    let Some(mut map) = store.pool.pop(MapQueue::Prefault) else {
        return;
    };
    store.platform.prefault(map.next_address);
    map.next_address = 0;
    map.transition(MapState::Free);
    store.release_map(map);
}
