/*!
 * Error Types
 * Centralized error handling with thiserror and miette
 */

use miette::Diagnostic;
use nix::errno::Errno;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used by every fallible trace store operation
pub type TraceStoreResult<T> = Result<T, TraceStoreError>;

/// Trace store errors with miette diagnostics
///
/// The allocation hot path never returns these: a dropped record is reported
/// as `None` and the cause lands in the store's persisted stats.
#[derive(Error, Debug, Diagnostic)]
pub enum TraceStoreError {
    #[error("Invalid argument: {0}")]
    #[diagnostic(
        code(trace_store::invalid_argument),
        help("Record sizes and counts must be non-zero and fit in the mapping size.")
    )]
    InvalidArgument(String),

    #[error("I/O error on {}: {source}", path.display())]
    #[diagnostic(
        code(trace_store::io),
        help("Check that the session directory exists and the disk is not full.")
    )]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to {operation} view: {errno}")]
    #[diagnostic(
        code(trace_store::map_view),
        help("The kernel refused the mapping. Check address space limits (ulimit -v) and vm.max_map_count.")
    )]
    MapView {
        operation: &'static str,
        errno: Errno,
    },

    #[error("Preferred base address 0x{0:x} unavailable")]
    #[diagnostic(
        code(trace_store::preferred_address_unavailable),
        help("Another mapping occupies the address. The view is retried without a preference.")
    )]
    PreferredAddressUnavailable(usize),

    #[error("Exhausted free memory maps for store {0}")]
    #[diagnostic(
        code(trace_store::exhausted_free_memory_maps),
        help("The descriptor pool could not grow. Increase the initial map count.")
    )]
    ExhaustedFreeMemoryMaps(String),

    #[error("Next memory map not ready for store {0}")]
    #[diagnostic(
        code(trace_store::next_memory_map_not_ready),
        help("Allocations outpaced preparation. Increase the mapping size or enable blocking allocations.")
    )]
    NextMemoryMapNotReady(String),

    #[error("In-page error: {0}")]
    #[diagnostic(
        code(trace_store::in_page_error),
        help("The backing file was truncated or its I/O failed while mapped.")
    )]
    InPageError(#[from] crate::platform::InPageError),

    #[error("Failed to bind store {store}: {reason}")]
    #[diagnostic(
        code(trace_store::bind_failed),
        help("Inspect earlier log lines for the failing metadata store.")
    )]
    BindFailed { store: String, reason: String },

    #[error("Trait violation: {0}")]
    #[diagnostic(
        code(trace_store::trait_violation),
        help("The trait combination is illegal or does not match the persisted traits.")
    )]
    TraitViolation(String),

    #[error("Store {0} is readonly")]
    #[diagnostic(
        code(trace_store::readonly),
        help("Allocations are only possible on stores bound for writing.")
    )]
    Readonly(String),

    #[error("Corrupt metadata in {store}: {reason}")]
    #[diagnostic(
        code(trace_store::corrupt_metadata),
        help("The metadata files do not describe the primary file. Re-record the session.")
    )]
    CorruptMetadata { store: String, reason: String },
}

impl TraceStoreError {
    /// Wrap an `io::Error` with the path it occurred on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TraceStoreError::Io {
            path: path.into(),
            source,
        }
    }

    /// Errno carried by the error, if it came from the OS
    pub fn errno(&self) -> Option<i32> {
        match self {
            TraceStoreError::Io { source, .. } => source.raw_os_error(),
            TraceStoreError::MapView { errno, .. } => Some(*errno as i32),
            _ => None,
        }
    }
}
