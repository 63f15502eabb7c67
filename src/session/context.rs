/*!
 * Trace Context
 *
 * Owns the thread pool, the store set and the bind protocol of one
 * session. Each primary store is bound in three stages chained through
 * the thread pool:
 *
 * 1. its `:MetadataInfo` directory
 * 2. the six remaining satellites, in parallel
 * 3. the primary store itself
 *
 * Groups of different primary stores bind independently. `build` returns
 * once every group finished, successfully or not.
 */

use super::descriptor::{StoreDescriptor, DEFAULT_TRACE_STORES};
use super::registry::{Registration, Rundown, RundownRegistry};
use super::stores::TraceStores;
use crate::config::TraceSessionConfig;
use crate::core::errors::{TraceStoreError, TraceStoreResult};
use crate::core::limits::BIND_POLL_INTERVAL_MS;
use crate::core::sync::Event;
use crate::core::time::SessionClock;
use crate::core::types::{MetadataKind, TraceStoreId};
use crate::monitoring::{generate_session_id, span_session};
use crate::platform::{Allocator, Platform, SystemAllocator, SystemPlatform, ThreadPool};
use crate::store::{BindCompleteFn, StoreEnvironment, TraceStore};
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

// ============================================================================
// Bind Protocol
// ============================================================================

/// Completion tracking across every store group of a session
struct BindProgress {
    remaining: AtomicUsize,
    failures: Mutex<Vec<TraceStoreError>>,
    complete: Event,
}

impl BindProgress {
    fn new(groups: usize) -> Self {
        let complete = Event::manual(groups == 0);
        Self {
            remaining: AtomicUsize::new(groups),
            failures: Mutex::new(Vec::new()),
            complete,
        }
    }

    fn finish_group(&self, result: TraceStoreResult<()>) {
        if let Err(error) = result {
            self.failures.lock().push(error);
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.complete.set();
        }
    }
}

/// Bind of one primary store and its satellites
struct GroupBind {
    primary: Arc<TraceStore>,
    satellites_remaining: AtomicUsize,
    failure: Mutex<Option<TraceStoreError>>,
    progress: Arc<BindProgress>,
    threadpool: Arc<ThreadPool>,
}

fn pool_closed(store: &TraceStore) -> TraceStoreError {
    TraceStoreError::BindFailed {
        store: store.name().to_string(),
        reason: "thread pool shut down".into(),
    }
}

fn missing_satellite(store: &TraceStore, kind: MetadataKind) -> TraceStoreError {
    TraceStoreError::BindFailed {
        store: store.name().to_string(),
        reason: format!("{} store missing", kind),
    }
}

impl GroupBind {
    fn bind_metadata_info(self: Arc<Self>) {
        let Some(directory) = self.primary.satellite(MetadataKind::MetadataInfo).cloned() else {
            let error = missing_satellite(&self.primary, MetadataKind::MetadataInfo);
            self.progress.finish_group(Err(error));
            return;
        };
        directory.bind(Box::new(move |result| match result {
            Ok(()) => self.bind_satellites(),
            Err(error) => self.progress.finish_group(Err(error)),
        }));
    }

    fn bind_satellites(self: Arc<Self>) {
        for kind in MetadataKind::REMAINING {
            let Some(store) = self.primary.satellite(kind).cloned() else {
                self.satellite_bound(Err(missing_satellite(&self.primary, kind)));
                continue;
            };
            let group = Arc::clone(&self);
            let submitted = self.threadpool.submit(move || {
                let done = Arc::clone(&group);
                store.bind(Box::new(move |result| done.satellite_bound(result)));
            });
            if !submitted {
                self.satellite_bound(Err(pool_closed(&self.primary)));
            }
        }
    }

    fn satellite_bound(self: &Arc<Self>, result: TraceStoreResult<()>) {
        if let Err(error) = result {
            self.failure.lock().get_or_insert(error);
        }
        if self.satellites_remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if let Some(error) = self.failure.lock().take() {
            self.progress.finish_group(Err(error));
            return;
        }

        let group = Arc::clone(self);
        let submitted = self.threadpool.submit(move || {
            let primary = Arc::clone(&group.primary);
            primary.bind(Box::new(move |result| group.progress.finish_group(result)));
        });
        if !submitted {
            self.progress.finish_group(Err(pool_closed(&self.primary)));
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Stores and workers of a session, shared with the rundown registry
struct SessionCore {
    session_id: Uuid,
    stores: TraceStores,
    threadpool: Arc<ThreadPool>,
    rundown_complete: AtomicBool,
}

impl SessionCore {
    fn bind_all(&self) -> TraceStoreResult<()> {
        let progress = Arc::new(BindProgress::new(self.stores.len()));
        for primary in self.stores.iter() {
            let group = Arc::new(GroupBind {
                primary: Arc::clone(primary),
                satellites_remaining: AtomicUsize::new(MetadataKind::REMAINING.len()),
                failure: Mutex::new(None),
                progress: Arc::clone(&progress),
                threadpool: Arc::clone(&self.threadpool),
            });
            if !self.threadpool.submit(move || group.bind_metadata_info()) {
                progress.finish_group(Err(pool_closed(primary)));
            }
        }

        let interval = Duration::from_millis(BIND_POLL_INTERVAL_MS);
        while !progress.complete.wait_timeout(interval) {
            // Every stage signals before its job returns, so an idle pool
            // with an unsignaled event means a stage panicked.
            if self.threadpool.pending() == 0 && !progress.complete.is_set() {
                return Err(TraceStoreError::BindFailed {
                    store: self.session_id.to_string(),
                    reason: format!("{} bind stages lost to panics", self.threadpool.panicked_jobs()),
                });
            }
        }

        let mut failures = std::mem::take(&mut *progress.failures.lock());
        if failures.is_empty() {
            return Ok(());
        }
        for extra in &failures[1..] {
            error!(session = %self.session_id, error = %extra, "additional store bind failure");
        }
        Err(failures.swap_remove(0))
    }

    fn rundown(&self) {
        if self.rundown_complete.swap(true, Ordering::AcqRel) {
            return;
        }
        self.threadpool.wait_idle();
        self.stores.rundown();
        info!(session = %self.session_id, stores = self.stores.len(), "trace session run down");
    }
}

impl Rundown for SessionCore {
    fn rundown(&self) {
        SessionCore::rundown(self);
    }

    fn label(&self) -> String {
        self.session_id.to_string()
    }
}

/// Builder of a `TraceContext`
pub struct TraceContextBuilder {
    config: TraceSessionConfig,
    platform: Option<Arc<dyn Platform>>,
    allocator: Option<Arc<dyn Allocator>>,
    descriptors: Vec<StoreDescriptor>,
    registry: Option<Arc<RundownRegistry>>,
    bind_complete: AHashMap<TraceStoreId, BindCompleteFn>,
}

impl TraceContextBuilder {
    pub fn platform(mut self, platform: Arc<dyn Platform>) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Replace the default store table
    pub fn stores(mut self, descriptors: &[StoreDescriptor]) -> Self {
        self.descriptors = descriptors.to_vec();
        self
    }

    /// Register the session for rundown with `registry`
    pub fn registry(mut self, registry: Arc<RundownRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Run `callback` once store `id` is bound; an error fails its bind
    pub fn on_bind_complete<F>(mut self, id: TraceStoreId, callback: F) -> Self
    where
        F: Fn(&TraceStore) -> TraceStoreResult<()> + Send + Sync + 'static,
    {
        self.bind_complete.insert(id, Arc::new(callback));
        self
    }

    pub fn build(self) -> TraceStoreResult<TraceContext> {
        let platform = self.platform.unwrap_or_else(|| Arc::new(SystemPlatform::new()));
        let allocator = self.allocator.unwrap_or_else(|| Arc::new(SystemAllocator));
        let config = self.config;
        config.validate(platform.page_size())?;
        if self.descriptors.is_empty() {
            return Err(TraceStoreError::InvalidArgument("session without stores".into()));
        }

        if config.readonly {
            if !config.directory.is_dir() {
                return Err(TraceStoreError::io(
                    &config.directory,
                    std::io::Error::from(std::io::ErrorKind::NotFound),
                ));
            }
        } else {
            std::fs::create_dir_all(&config.directory).map_err(|e| TraceStoreError::io(&config.directory, e))?;
        }

        let session_id = generate_session_id();
        let span = span_session(session_id, config.readonly, self.descriptors.len());
        let _entered = span.enter();

        let threadpool = Arc::new(ThreadPool::new(config.thread_count));
        let env = StoreEnvironment {
            platform,
            allocator,
            threadpool: Arc::clone(&threadpool),
            clock: SessionClock::new(),
        };
        let stores = TraceStores::create(&self.descriptors, &config, &env, &self.bind_complete)?;
        let core = Arc::new(SessionCore {
            session_id,
            stores,
            threadpool,
            rundown_complete: AtomicBool::new(false),
        });

        let result = core.bind_all();
        span.record_result(result.is_ok());
        if let Err(error) = result {
            error!(session = %session_id, %error, "trace session bind failed");
            core.rundown();
            return Err(error);
        }

        let registration = self.registry.map(|registry| {
            let target: Arc<dyn Rundown> = core.clone();
            let registration = registry.register(Arc::downgrade(&target));
            (registry, registration)
        });

        info!(
            session = %session_id,
            directory = %config.directory.display(),
            stores = core.stores.len(),
            readonly = config.readonly,
            "trace session bound"
        );
        Ok(TraceContext {
            core,
            config,
            env,
            registration,
        })
    }
}

/// A bound trace session
pub struct TraceContext {
    core: Arc<SessionCore>,
    config: TraceSessionConfig,
    env: StoreEnvironment,
    registration: Option<(Arc<RundownRegistry>, Registration)>,
}

impl TraceContext {
    pub fn builder(config: TraceSessionConfig) -> TraceContextBuilder {
        TraceContextBuilder {
            config,
            platform: None,
            allocator: None,
            descriptors: DEFAULT_TRACE_STORES.to_vec(),
            registry: None,
            bind_complete: AHashMap::new(),
        }
    }

    /// Bind the default store table on the system platform
    pub fn new(config: TraceSessionConfig) -> TraceStoreResult<Self> {
        Self::builder(config).build()
    }

    pub fn session_id(&self) -> Uuid {
        self.core.session_id
    }

    pub fn config(&self) -> &TraceSessionConfig {
        &self.config
    }

    pub fn stores(&self) -> &TraceStores {
        &self.core.stores
    }

    pub fn store(&self, id: TraceStoreId) -> Option<&Arc<TraceStore>> {
        self.core.stores.get(id)
    }

    pub fn store_by_name(&self, name: &str) -> Option<&Arc<TraceStore>> {
        self.core.stores.by_name(name)
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.env.platform
    }

    pub fn threadpool(&self) -> &Arc<ThreadPool> {
        &self.env.threadpool
    }

    pub fn clock(&self) -> SessionClock {
        self.env.clock
    }

    /// Rewrite the pointer fields of a record read from store `id`
    pub fn relocate_record(&self, id: TraceStoreId, record: &mut [u8]) -> TraceStoreResult<usize> {
        self.core.stores.relocate_record(id, record)
    }

    /// Wait until no preparation, close or prefault work is outstanding
    pub fn wait_for_pipeline(&self) {
        self.env.threadpool.wait_idle();
    }

    /// Flush, unmap and truncate every store; idempotent
    pub fn rundown(&self) {
        self.core.rundown();
    }
}

impl Drop for TraceContext {
    fn drop(&mut self) {
        if let Some((registry, registration)) = self.registration.take() {
            registry.unregister(registration);
        }
        self.core.rundown();
    }
}

impl std::fmt::Debug for TraceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceContext")
            .field("session", &self.core.session_id)
            .field("directory", &self.config.directory)
            .field("readonly", &self.config.readonly)
            .field("stores", &self.core.stores)
            .finish()
    }
}
