/*!
 * Store Descriptors
 * Static description of the primary stores a session creates
 */

use crate::core::limits::{DEFAULT_EVENT_MAPPING_SIZE, DEFAULT_TABLE_MAPPING_SIZE, DEFAULT_TRACE_STORE_MAPPING_SIZE};
use crate::core::types::TraceStoreId;
use crate::store::{FieldRelocation, TraceStoreTraits};

/// One primary store of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreDescriptor {
    pub id: TraceStoreId,
    /// Base file name, without extension
    pub name: &'static str,
    pub traits: TraceStoreTraits,
    pub mapping_size: u64,
    /// Pointer fields of the store's records
    pub relocations: &'static [FieldRelocation],
    /// Merge consecutive same-size allocations into one log entry
    pub coalesce_allocations: bool,
}

impl StoreDescriptor {
    pub const fn new(id: u16, name: &'static str, traits: TraceStoreTraits, mapping_size: u64) -> Self {
        Self {
            id: TraceStoreId(id),
            name,
            traits,
            mapping_size,
            relocations: &[],
            coalesce_allocations: true,
        }
    }

    pub const fn with_relocations(mut self, relocations: &'static [FieldRelocation]) -> Self {
        self.relocations = relocations;
        self
    }

    pub const fn without_coalescing(mut self) -> Self {
        self.coalesce_allocations = false;
        self
    }
}

pub const EVENT_STORE: TraceStoreId = TraceStoreId(0);
pub const STRING_BUFFER_STORE: TraceStoreId = TraceStoreId(1);
pub const FUNCTION_TABLE_STORE: TraceStoreId = TraceStoreId(2);
pub const FUNCTION_TABLE_ENTRY_STORE: TraceStoreId = TraceStoreId(3);
pub const PATH_TABLE_STORE: TraceStoreId = TraceStoreId(4);
pub const PATH_TABLE_ENTRY_STORE: TraceStoreId = TraceStoreId(5);
pub const MODULE_TABLE_STORE: TraceStoreId = TraceStoreId(6);
pub const PERFORMANCE_STORE: TraceStoreId = TraceStoreId(7);

// Table entries lead with a pointer to their name in the string buffer.
const ENTRY_NAME_RELOCATIONS: &[FieldRelocation] = &[FieldRelocation::new(0, STRING_BUFFER_STORE)];
const MODULE_RELOCATIONS: &[FieldRelocation] = &[
    FieldRelocation::new(0, STRING_BUFFER_STORE),
    FieldRelocation::new(8, PATH_TABLE_ENTRY_STORE),
];

const STREAMING: TraceStoreTraits = TraceStoreTraits::MULTIPLE_RECORDS
    .union(TraceStoreTraits::STREAMING_WRITE)
    .union(TraceStoreTraits::STREAMING_READ);

/// Primary stores of a default recording session
pub const DEFAULT_TRACE_STORES: [StoreDescriptor; 8] = [
    StoreDescriptor::new(
        0,
        "TraceEvent",
        STREAMING
            .union(TraceStoreTraits::FREQUENT_ALLOCATIONS)
            .union(TraceStoreTraits::RECORD_SIZE_IS_ALWAYS_POWER_OF_2),
        DEFAULT_EVENT_MAPPING_SIZE,
    ),
    StoreDescriptor::new(
        1,
        "TraceStringBuffer",
        TraceStoreTraits::VARYING_RECORD_SIZE
            .union(TraceStoreTraits::MULTIPLE_RECORDS)
            .union(TraceStoreTraits::PREVENT_PAGE_SPILL),
        DEFAULT_TRACE_STORE_MAPPING_SIZE,
    ),
    StoreDescriptor::new(2, "TraceFunctionTable", TraceStoreTraits::SINGLE_RECORD, DEFAULT_TABLE_MAPPING_SIZE),
    StoreDescriptor::new(
        3,
        "TraceFunctionTableEntry",
        TraceStoreTraits::MULTIPLE_RECORDS.union(TraceStoreTraits::CONCURRENT_ALLOCATIONS),
        DEFAULT_TRACE_STORE_MAPPING_SIZE,
    )
    .with_relocations(ENTRY_NAME_RELOCATIONS),
    StoreDescriptor::new(4, "TracePathTable", TraceStoreTraits::SINGLE_RECORD, DEFAULT_TABLE_MAPPING_SIZE),
    StoreDescriptor::new(
        5,
        "TracePathTableEntry",
        TraceStoreTraits::MULTIPLE_RECORDS.union(TraceStoreTraits::CONCURRENT_ALLOCATIONS),
        DEFAULT_TRACE_STORE_MAPPING_SIZE,
    )
    .with_relocations(ENTRY_NAME_RELOCATIONS),
    StoreDescriptor::new(
        6,
        "TraceModuleTable",
        TraceStoreTraits::VARYING_RECORD_SIZE.union(TraceStoreTraits::MULTIPLE_RECORDS),
        DEFAULT_TABLE_MAPPING_SIZE,
    )
    .with_relocations(MODULE_RELOCATIONS),
    StoreDescriptor::new(
        7,
        "TracePerformance",
        STREAMING.union(TraceStoreTraits::LINKED_STORE).union(TraceStoreTraits::BLOCKING_ALLOCATIONS),
        DEFAULT_TRACE_STORE_MAPPING_SIZE,
    )
    .without_coalescing(),
];
