/*!
 * Trace Store
 *
 * Append-only, memory-mapped recording of trace data. Allocation carves
 * records out of the active view of a store's file while worker threads
 * prepare the next views ahead of time; every store keeps satellite
 * metadata (allocation log, address ledger, relocation table, info) that
 * lets a later session reload the data at different base addresses.
 */

pub mod config;
pub mod core;
pub mod monitoring;
pub mod platform;
pub mod session;
pub mod store;

// Re-exports
pub use config::TraceSessionConfig;
pub use crate::core::errors::{TraceStoreError, TraceStoreResult};
pub use crate::core::types::{MetadataKind, StoreKind, TraceStoreId};
pub use monitoring::init_tracing;
pub use platform::{Allocator, Platform, SystemAllocator, SystemPlatform};
pub use session::{RundownRegistry, StoreDescriptor, TraceContext, TraceStores, DEFAULT_TRACE_STORES};
pub use store::{
    Allocation, AllocationKind, AllocationTimestamp, RecordLocation, StoreFlags, TraceStore, TraceStoreAllocator,
    TraceStoreTraits,
};
