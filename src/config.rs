/*!
 * Session Configuration
 *
 * Runtime options of a trace session. Defaults suit recording; readonly
 * sessions flip `readonly` and usually nothing else.
 */

use crate::core::errors::{TraceStoreError, TraceStoreResult};
use crate::core::limits::MAX_WORKER_THREADS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_thread_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_WORKER_THREADS)
}

fn default_copy_on_write() -> bool {
    true
}

/// Trace session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceSessionConfig {
    /// Directory holding every store file of the session
    pub directory: PathBuf,
    /// Worker threads of the session's pool
    pub thread_count: usize,
    pub readonly: bool,
    /// Map readonly slices wherever the kernel places them
    pub ignore_preferred_addresses: bool,
    pub no_prefaulting: bool,
    /// Replaces the mapping size of every primary store
    pub mapping_size_override: Option<u64>,
    /// Descriptors created per pool growth step; must be a power of two
    pub initial_map_count_override: Option<u32>,
    /// Fail the primary allocation when its allocation log entry is lost
    pub hard_metadata_failures: bool,
    /// Readonly primary views are private copy-on-write mappings
    #[serde(default = "default_copy_on_write")]
    pub copy_on_write: bool,
    /// Skip the `:AllocationTimestamp` satellite of every primary store
    pub disable_allocation_timestamps: bool,
}

impl Default for TraceSessionConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            thread_count: default_thread_count(),
            readonly: false,
            ignore_preferred_addresses: false,
            no_prefaulting: false,
            mapping_size_override: None,
            initial_map_count_override: None,
            hard_metadata_failures: false,
            copy_on_write: true,
            disable_allocation_timestamps: false,
        }
    }
}

impl TraceSessionConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    /// Configuration read from `TRACE_STORE_DIR`, `TRACE_STORE_THREADS` and
    /// `TRACE_STORE_NO_PREFAULT`, defaults for anything unset
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("TRACE_STORE_DIR") {
            config.directory = PathBuf::from(dir);
        }
        if let Some(threads) = std::env::var("TRACE_STORE_THREADS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
        {
            config.thread_count = threads;
        }
        if let Ok(v) = std::env::var("TRACE_STORE_NO_PREFAULT") {
            config.no_prefaulting = v == "1" || v.eq_ignore_ascii_case("true");
        }
        config
    }

    pub fn from_json(json: &str) -> TraceStoreResult<Self> {
        serde_json::from_str(json).map_err(|e| TraceStoreError::InvalidArgument(format!("session config: {}", e)))
    }

    pub fn to_json(&self) -> TraceStoreResult<String> {
        serde_json::to_string(self).map_err(|e| TraceStoreError::InvalidArgument(format!("session config: {}", e)))
    }

    pub fn with_directory(mut self, directory: impl AsRef<Path>) -> Self {
        self.directory = directory.as_ref().to_path_buf();
        self
    }

    pub fn with_thread_count(mut self, threads: usize) -> Self {
        self.thread_count = threads;
        self
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn ignore_preferred_addresses(mut self, ignore: bool) -> Self {
        self.ignore_preferred_addresses = ignore;
        self
    }

    pub fn no_prefaulting(mut self, disabled: bool) -> Self {
        self.no_prefaulting = disabled;
        self
    }

    pub fn with_mapping_size(mut self, size: u64) -> Self {
        self.mapping_size_override = Some(size);
        self
    }

    pub fn with_initial_map_count(mut self, count: u32) -> Self {
        self.initial_map_count_override = Some(count);
        self
    }

    pub fn hard_metadata_failures(mut self, hard: bool) -> Self {
        self.hard_metadata_failures = hard;
        self
    }

    pub fn copy_on_write(mut self, enabled: bool) -> Self {
        self.copy_on_write = enabled;
        self
    }

    pub fn disable_allocation_timestamps(mut self, disabled: bool) -> Self {
        self.disable_allocation_timestamps = disabled;
        self
    }

    /// Reject options the engine cannot honour on a system with `page_size`
    pub fn validate(&self, page_size: usize) -> TraceStoreResult<()> {
        let invalid = |reason: String| Err(TraceStoreError::InvalidArgument(reason));

        if self.thread_count == 0 || self.thread_count > MAX_WORKER_THREADS {
            return invalid(format!(
                "thread count {} outside 1..={}",
                self.thread_count, MAX_WORKER_THREADS
            ));
        }
        if let Some(size) = self.mapping_size_override {
            if size == 0 || size % page_size as u64 != 0 {
                return invalid(format!("mapping size {} is not a multiple of the page size {}", size, page_size));
            }
        }
        if let Some(count) = self.initial_map_count_override {
            if !count.is_power_of_two() {
                return invalid(format!("initial map count {} is not a power of two", count));
            }
        }
        Ok(())
    }
}
