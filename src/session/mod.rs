/*!
 * Trace Sessions
 *
 * A session is one directory of store files recorded or reloaded
 * together. `TraceContext` binds every primary store with its satellites
 * and runs them down on drop; `RundownRegistry` lets a host run down every
 * live session at once.
 */

mod context;
mod descriptor;
mod registry;
mod stores;

pub use context::{TraceContext, TraceContextBuilder};
pub use descriptor::{
    StoreDescriptor, DEFAULT_TRACE_STORES, EVENT_STORE, FUNCTION_TABLE_ENTRY_STORE, FUNCTION_TABLE_STORE,
    MODULE_TABLE_STORE, PATH_TABLE_ENTRY_STORE, PATH_TABLE_STORE, PERFORMANCE_STORE, STRING_BUFFER_STORE,
};
pub use registry::{Registration, Rundown, RundownRegistry};
pub use stores::{store_path, TraceStores};
