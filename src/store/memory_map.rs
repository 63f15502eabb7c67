/*!
 * Memory Map Descriptor
 *
 * A reusable description of one mapped slice of a store's file. The OS view
 * is created and destroyed every cycle; the descriptor itself returns to
 * its store's free pool and is reused.
 */

use super::address::AddressSlot;
use crate::platform::MappedView;

/// Lifecycle state of a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MapState {
    #[default]
    Free,
    Preparing,
    Prepared,
    Active,
    PendingRetirement,
    Closing,
    /// Kept mapped until rundown (stores that never retire)
    Retained,
    /// Borrowed to carry a prefault address
    Prefault,
    /// Mapped for a readonly session
    Readonly,
}

impl MapState {
    /// Legal transitions of the map lifecycle
    pub fn can_transition_to(self, next: MapState) -> bool {
        use MapState::*;
        matches!(
            (self, next),
            (Free, Preparing)
                | (Free, Prefault)
                | (Prefault, Free)
                | (Preparing, Prepared)
                | (Preparing, Readonly)
                | (Preparing, Free)
                | (Prepared, Active)
                | (Prepared, Free)
                | (Active, PendingRetirement)
                | (PendingRetirement, Closing)
                | (PendingRetirement, Retained)
                | (Closing, Free)
                | (Retained, Free)
                | (Readonly, Free)
                | (Active, Free)
                | (PendingRetirement, Free)
        )
    }
}

/// Descriptor of one mapped slice
#[derive(Debug, Default)]
pub struct MemoryMap {
    pub(crate) file_offset: u64,
    pub(crate) mapping_size: u64,
    pub(crate) base_address: usize,
    pub(crate) preferred_base_address: usize,
    pub(crate) next_address: usize,
    pub(crate) view: Option<MappedView>,
    pub(crate) address: Option<AddressSlot>,
    pub(crate) state: MapState,
    pub(crate) generation: u64,
    pub(crate) sequence_id: u32,
}

impl MemoryMap {
    /// Move to `next`, panicking on an illegal transition
    #[inline]
    pub(crate) fn transition(&mut self, next: MapState) {
        assert!(
            self.state.can_transition_to(next),
            "illegal memory map transition {:?} -> {:?} (offset {})",
            self.state,
            next,
            self.file_offset
        );
        self.state = next;
    }

    #[inline]
    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    #[inline]
    pub fn mapping_size(&self) -> u64 {
        self.mapping_size
    }

    #[inline]
    pub fn base_address(&self) -> usize {
        self.base_address
    }

    #[inline]
    pub fn preferred_base_address(&self) -> usize {
        self.preferred_base_address
    }

    #[inline]
    pub fn state(&self) -> MapState {
        self.state
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// One past the last mapped byte
    #[inline]
    pub fn end_address(&self) -> usize {
        self.base_address + self.mapping_size as usize
    }

    /// Bytes left between the cursor and the end of the view
    #[inline]
    pub fn remaining(&self) -> usize {
        self.end_address().saturating_sub(self.next_address)
    }

    #[inline]
    pub fn contains_address(&self, address: usize) -> bool {
        address >= self.base_address && address < self.end_address()
    }

    #[inline]
    pub fn contains_offset(&self, offset: u64) -> bool {
        offset >= self.file_offset && offset < self.file_offset + self.mapping_size
    }

    /// File offset of a mapped address
    #[inline]
    pub fn offset_of(&self, address: usize) -> u64 {
        self.file_offset + (address - self.base_address) as u64
    }

    /// Descriptor has no view, no ledger slot and no geometry
    pub fn is_zeroed(&self) -> bool {
        self.view.is_none()
            && self.address.is_none()
            && self.file_offset == 0
            && self.mapping_size == 0
            && self.base_address == 0
            && self.next_address == 0
            && self.state == MapState::Free
    }

    /// Return the descriptor to its pristine state
    ///
    /// The view must already have been released.
    pub(crate) fn reset(&mut self) {
        debug_assert!(self.view.is_none(), "resetting a descriptor with a live view");
        *self = MemoryMap::default();
    }
}
