/*!
 * Allocation Engine
 *
 * Carves records out of the active map. Crossing the end of a map consumes
 * the next prepared one; if none is ready the allocation is dropped (or, for
 * blocking stores, the caller parks until a worker delivers it).
 *
 * # Policies
 *
 * - `Plain`: single producer, no extra locking
 * - `Concurrent`: the whole call runs under the store's critical section
 * - `Suspended`: callers park until allocations are resumed
 *
 * `try_allocate_records` never parks and cannot tell contention,
 * suspension and exhaustion apart. Callers cap their retries and then fall
 * back to `allocate_records`.
 */

use super::allocation::AllocationLogged;
use super::traits::StoreFlags;
use super::TraceStore;
use crate::core::limits::ALLOCATION_ALIGNMENT;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use tracing::warn;

/// Allocation dispatch selected per store
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorPolicy {
    Plain = 0,
    Concurrent = 1,
    Suspended = 2,
}

impl AllocatorPolicy {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => AllocatorPolicy::Concurrent,
            2 => AllocatorPolicy::Suspended,
            _ => AllocatorPolicy::Plain,
        }
    }
}

/// A successful allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub ptr: NonNull<u8>,
    /// Offset of the first byte within the store's file
    pub file_offset: u64,
    /// Requested bytes, `record_size * count`
    pub len: u64,
    /// Bytes skipped in front of the allocation
    pub padding: u64,
}

#[inline]
fn align_up(value: u64, alignment: u64) -> Option<u64> {
    value.checked_add(alignment - 1).map(|v| v & !(alignment - 1))
}

impl TraceStore {
    // ========================================================================
    // Entry Points
    // ========================================================================

    /// Allocate `count` records of `record_size` bytes
    ///
    /// Returns `None` if the record was dropped. The memory stays mapped at
    /// least until two further maps have been consumed.
    #[inline]
    pub fn allocate_records(&self, record_size: u64, count: u64) -> Option<NonNull<u8>> {
        self.allocate(record_size, count).map(|allocation| allocation.ptr)
    }

    /// Like `allocate_records`, also reporting where the bytes landed
    pub fn allocate(&self, record_size: u64, count: u64) -> Option<Allocation> {
        let page_aligned = self.traits.wants_page_alignment();
        self.dispatch(self.policy(), record_size, count, page_aligned)
    }

    /// Allocate starting on a fresh page; the tail of the last page is never
    /// shared with another allocation
    pub fn allocate_page_aligned(&self, record_size: u64, count: u64) -> Option<Allocation> {
        self.dispatch(self.policy(), record_size, count, true)
    }

    /// Fail fast if the critical section is contended or allocations are
    /// suspended
    pub fn try_allocate_records(&self, record_size: u64, count: u64) -> Option<NonNull<u8>> {
        if self.policy() == AllocatorPolicy::Suspended {
            return None;
        }
        let _guard = self.critical_section.try_lock()?;
        let page_aligned = self.traits.wants_page_alignment();
        self.allocate_core(record_size, count, page_aligned)
            .map(|allocation| allocation.ptr)
    }

    /// Park every subsequent allocation until `resume_allocations`
    pub fn suspend_allocations(&self) {
        self.events.resume_allocations.reset();
        self.policy
            .store(AllocatorPolicy::Suspended as u8, Ordering::Release);
    }

    pub fn resume_allocations(&self) {
        self.policy.store(self.base_policy() as u8, Ordering::Release);
        self.events.resume_allocations.set();
    }

    #[inline]
    pub fn policy(&self) -> AllocatorPolicy {
        AllocatorPolicy::from_u8(self.policy.load(Ordering::Acquire))
    }

    fn base_policy(&self) -> AllocatorPolicy {
        if self.traits.is_concurrent() {
            AllocatorPolicy::Concurrent
        } else {
            AllocatorPolicy::Plain
        }
    }

    fn dispatch(&self, policy: AllocatorPolicy, record_size: u64, count: u64, page_aligned: bool) -> Option<Allocation> {
        match policy {
            AllocatorPolicy::Plain => self.allocate_core(record_size, count, page_aligned),
            AllocatorPolicy::Concurrent => {
                let _guard = self.critical_section.lock();
                self.allocate_core(record_size, count, page_aligned)
            }
            AllocatorPolicy::Suspended => {
                let stats = &self.info().stats;
                let started = self.clock.now();
                stats.suspended_allocations.fetch_add(1, Ordering::Relaxed);
                self.events.resume_allocations.wait();
                let elapsed = self.clock.now().saturating_sub(started).max(0) as u64;
                stats
                    .elapsed_suspension_ticks
                    .fetch_add(elapsed, Ordering::Relaxed);
                self.dispatch(self.policy(), record_size, count, page_aligned)
            }
        }
    }

    // ========================================================================
    // Core
    // ========================================================================

    /// Bytes the log accounts for and bytes the cursor advances by
    fn footprint(&self, size: u64, page_aligned: bool, page: u64) -> Option<(u64, u64)> {
        let logged = if self.traits.skips_alignment() {
            size
        } else {
            align_up(size, ALLOCATION_ALIGNMENT as u64)?
        };
        let advance = if page_aligned { align_up(size, page)? } else { logged };
        Some((logged, advance))
    }

    /// Record size and count as written to the allocation log
    ///
    /// A batch of unaligned records is logged as one record covering the
    /// whole batch, so readers can step by the aligned record size.
    fn log_shape(&self, record_size: u64, count: u64) -> (u64, u64) {
        let aligned = record_size % ALLOCATION_ALIGNMENT as u64 == 0;
        if count > 1 && !aligned && !self.traits.skips_alignment() {
            (record_size * count, 1)
        } else {
            (record_size, count)
        }
    }

    /// Where an allocation starting from `cursor` is placed
    fn placement(&self, cursor: usize, size: u64, page_aligned: bool, page: usize) -> usize {
        let next_page = (cursor + page - 1) & !(page - 1);
        if page_aligned {
            return next_page;
        }
        if self.traits.prevents_page_spill() {
            let within_page = cursor & (page - 1);
            if within_page != 0 && within_page as u64 + size > page as u64 {
                return next_page;
            }
        }
        cursor
    }

    pub(crate) fn allocate_core(&self, record_size: u64, count: u64, page_aligned: bool) -> Option<Allocation> {
        if record_size == 0 || count == 0 {
            return None;
        }
        if self.is_readonly() {
            warn!(store = %self.name, "allocation attempted on readonly store");
            return None;
        }

        let page = self.platform.page_size();
        let size = record_size.checked_mul(count)?;
        let (logged_size, advance) = self.footprint(size, page_aligned, page as u64)?;
        let stats = &self.info().stats;
        if advance > self.mapping_size {
            stats.dropped_records.fetch_add(1, Ordering::Relaxed);
            warn!(store = %self.name, size, mapping_size = self.mapping_size, "allocation larger than a memory map");
            return None;
        }

        let mut state = self.active.lock();
        if self.traits.is_single_record() {
            assert!(
                !state.single_allocated,
                "store {}: single record store allocated twice",
                self.name
            );
        }

        let requested_at = (!self.is_metadata() && self.records_allocation_timestamps()).then(|| self.clock.now());

        let active = state.active()?;
        let (base, end, offset) = (active.base_address, active.end_address(), active.file_offset);
        let start = self.placement(active.next_address, size, page_aligned, page);

        let (address, file_offset) = if start + advance as usize <= end {
            (start, offset + (start - base) as u64)
        } else {
            if !self.consume_next(&mut state) {
                stats.dropped_records.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            let next = state.active()?;
            if next.base_address == end {
                (start, offset + (start - base) as u64)
            } else {
                (next.base_address, next.file_offset)
            }
        };

        let cursor = address + advance as usize;
        let map_end = {
            let active = state.active_mut()?;
            active.next_address = cursor;
            active.end_address()
        };

        debug_assert!(file_offset >= state.logical_end, "allocation behind the logical end");
        let padding = file_offset - state.logical_end;
        if self.traits.is_single_record() {
            state.single_allocated = true;
        }

        let logged = if self.is_metadata() {
            AllocationLogged::Complete
        } else {
            let (log_size, log_count) = self.log_shape(record_size, count);
            self.record_allocation(padding, log_size, log_count)
        };

        let totals = &self.info().totals;
        let count_padding = || {
            if padding > 0 {
                totals.number_of_allocations.fetch_add(1, Ordering::Relaxed);
                totals.allocation_size.fetch_add(padding, Ordering::Relaxed);
            }
        };
        match logged {
            AllocationLogged::Complete => {
                count_padding();
                totals.number_of_allocations.fetch_add(1, Ordering::Relaxed);
                totals.allocation_size.fetch_add(logged_size, Ordering::Relaxed);
                state.logical_end = file_offset + logged_size;
            }
            AllocationLogged::PaddingOnly => {
                count_padding();
                state.logical_end = file_offset;
            }
            AllocationLogged::Nothing => {}
        }
        if let (Some(timestamp), AllocationLogged::Complete) = (requested_at, logged) {
            self.record_allocation_timestamp(timestamp, count);
        }
        self.info().advance_eof(file_offset + advance);

        if self.prefaulting() {
            let next_page = (address & !(page - 1)) + page;
            if cursor > next_page && next_page + page < map_end {
                self.submit_prefault(next_page + page);
            }
        }

        if cursor == map_end && !self.traits.is_single_record() {
            self.consume_ready(&mut state);
        }
        drop(state);

        if logged != AllocationLogged::Complete && self.flags.contains(StoreFlags::HARD_METADATA_FAILURES) {
            stats.dropped_records.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        // SAFETY: `address` lies inside a live view of at least `advance` bytes.
        let ptr = unsafe { NonNull::new_unchecked(address as *mut u8) };
        Some(Allocation {
            ptr,
            file_offset,
            len: size,
            padding,
        })
    }
}
