/*!
 * Trace Store Limits and Constants
 *
 * Centralized location for every mapping size, pool count and alignment
 * used by the engine.
 *
 * - Performance-critical constants are marked with [PERF]
 * - Values that end up on disk are marked with [LAYOUT]
 */

// =============================================================================
// PAGE AND ALIGNMENT
// =============================================================================

/// Page size assumed when the OS cannot be queried (4KB)
pub const FALLBACK_PAGE_SIZE: usize = 4096;

/// Alignment of every non page-aligned allocation (16 bytes)
/// [LAYOUT] Matches the largest scalar alignment a record may need
pub const ALLOCATION_ALIGNMENT: usize = 16;

/// Number of pages primed after a view is mapped
/// [PERF] Absorbs the first faults before the map becomes active
pub const PREFAULT_PAGES_AFTER_PREPARE: usize = 2;

// =============================================================================
// DEFAULT MAPPING SIZES
// =============================================================================

/// Primary trace store mapping size (2MB)
/// [PERF] Large enough that preparation rarely lags consumption
pub const DEFAULT_TRACE_STORE_MAPPING_SIZE: u64 = 1 << 21;

/// Event store mapping size (8MB)
/// Events are allocated in tight loops
pub const DEFAULT_EVENT_MAPPING_SIZE: u64 = 1 << 23;

/// Allocation log mapping size (64KB)
pub const DEFAULT_ALLOCATION_MAPPING_SIZE: u64 = 1 << 16;

/// Allocation timestamp mapping size (64KB)
pub const DEFAULT_ALLOCATION_TIMESTAMP_MAPPING_SIZE: u64 = 1 << 16;

/// Address ledger mapping size (64KB)
/// [LAYOUT] 512 address records per map
pub const DEFAULT_ADDRESS_MAPPING_SIZE: u64 = 1 << 16;

/// Relocation table mapping size (64KB)
pub const DEFAULT_RELOCATION_MAPPING_SIZE: u64 = 1 << 16;

/// Bitmap store mapping size (64KB)
pub const DEFAULT_BITMAP_MAPPING_SIZE: u64 = 1 << 16;

/// Info and MetadataInfo mapping size (64KB)
/// [LAYOUT] Single-record files keep this length on disk
pub const DEFAULT_INFO_MAPPING_SIZE: u64 = 1 << 16;

/// Mapping size of single-record and table primary stores (64KB)
pub const DEFAULT_TABLE_MAPPING_SIZE: u64 = 1 << 16;

// =============================================================================
// MEMORY MAP POOL COUNTS
// =============================================================================

/// Descriptors for non-streaming readonly primary stores
pub const INITIAL_NON_STREAMING_READER_MAPS: u32 = 128;

/// Descriptors for non-streaming readonly metadata stores
pub const INITIAL_NON_STREAMING_METADATA_READER_MAPS: u32 = 64;

/// Descriptors for non-streaming writable primary stores
pub const INITIAL_NON_STREAMING_WRITER_MAPS: u32 = 256;

/// Descriptors for non-streaming writable metadata stores
pub const INITIAL_NON_STREAMING_METADATA_WRITER_MAPS: u32 = 128;

/// Descriptors for streaming readonly stores
pub const INITIAL_STREAMING_READER_MAPS: u32 = 64;

/// Descriptors for streaming writable stores
pub const INITIAL_STREAMING_WRITER_MAPS: u32 = 64;

/// Multiplier applied to stores with frequent allocations
/// [PERF] Keeps the free pool from running dry under bursty producers
pub const FREQUENT_ALLOCATOR_MAP_MULTIPLIER: u32 = 8;

/// Slots in the active map generation ring (active, pending, retiring)
pub const GENERATION_RING_CAPACITY: usize = 3;

// =============================================================================
// THREAD POOL
// =============================================================================

/// Upper bound on worker threads regardless of processor count
pub const MAX_WORKER_THREADS: usize = 64;

/// Prefix for worker thread names
pub const WORKER_THREAD_PREFIX: &str = "trace-store-worker";

/// Interval at which a session bind checks for lost bind work (50ms)
pub const BIND_POLL_INTERVAL_MS: u64 = 50;

// =============================================================================
// FILE NAMES
// =============================================================================

/// Extension of every primary store file
pub const TRACE_STORE_FILE_EXTENSION: &str = "dat";
