/*!
 * Trace Store
 *
 * One named, append-only, memory-mapped dataset. Primary stores own a
 * fixed set of satellite metadata stores (allocation log and timestamps,
 * address ledger, relocation table, bitmap, info) plus a `:MetadataInfo` directory whose
 * array backs the satellites' own bookkeeping.
 *
 * # Architecture
 *
 * - `pool`: descriptor free list and pipeline queues
 * - `pipeline`: prepare / consume / retire / close / prefault work items
 * - `allocate`: the allocation hot path and its policy variants
 * - `allocation`, `address`: the allocation log and address ledger
 * - `bind`: write and readonly binding of a single store
 * - `reader`, `relocation`: readonly enumeration and pointer fix-ups
 */

pub mod address;
pub mod allocate;
pub mod allocation;
pub mod allocator;
pub mod bind;
pub mod info;
pub mod memory_map;
pub mod pipeline;
pub mod pool;
pub mod reader;
pub mod relocation;
pub mod traits;

pub use address::{AddressPhase, AddressRecord, AddressSlot};
pub use allocate::{Allocation, AllocatorPolicy};
pub use allocation::{AllocationKind, AllocationRecord, AllocationTimestamp};
pub use allocator::TraceStoreAllocator;
pub use info::{StatsSnapshot, TotalsSnapshot, TraceStoreInfo};
pub use memory_map::{MapState, MemoryMap};
pub use pool::{MapQueue, PoolCensus};
pub use reader::RecordLocation;
pub use relocation::{AddressTranslator, FieldRelocation, RelocationTable};
pub use traits::{StoreFlags, TraceStoreTraits};

use crate::core::errors::{TraceStoreError, TraceStoreResult};
use crate::core::sync::Event;
use crate::core::time::SessionClock;
use crate::core::types::{MetadataKind, StoreKind, TraceStoreId};
use crate::platform::{Allocator, BackingFile, FallibleRegion, Platform, ThreadPool};
use allocation::AllocationLog;
use info::InfoBinding;
use parking_lot::{Mutex, RwLock};
use pipeline::ActiveState;
use pool::MemoryMapPool;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Callback run once a primary store finished binding
pub type BindCompleteFn = Arc<dyn Fn(&TraceStore) -> TraceStoreResult<()> + Send + Sync>;

/// Shared services every store of a session uses
#[derive(Clone)]
pub struct StoreEnvironment {
    pub platform: Arc<dyn Platform>,
    pub allocator: Arc<dyn Allocator>,
    pub threadpool: Arc<ThreadPool>,
    pub clock: SessionClock,
}

/// Everything needed to construct a store
pub(crate) struct StoreSpec {
    pub id: TraceStoreId,
    pub name: String,
    pub kind: StoreKind,
    pub traits: TraceStoreTraits,
    pub flags: StoreFlags,
    pub mapping_size: u64,
    pub path: PathBuf,
    pub initial_map_count: Option<u32>,
    pub satellites: [Option<Arc<TraceStore>>; MetadataKind::COUNT],
    pub relocations: Option<RelocationTable>,
    pub bind_complete: Option<BindCompleteFn>,
}

/// Events a store signals or waits on
#[derive(Debug)]
pub(crate) struct StoreEvents {
    pub bind_complete: Event,
    pub resume_allocations: Event,
    pub next_map_available: Event,
    pub all_maps_free: Event,
}

impl StoreEvents {
    fn new() -> Self {
        Self {
            bind_complete: Event::manual(false),
            resume_allocations: Event::manual(true),
            next_map_available: Event::auto(),
            all_maps_free: Event::manual(true),
        }
    }
}

/// A trace store
pub struct TraceStore {
    pub(crate) id: TraceStoreId,
    pub(crate) name: String,
    pub(crate) kind: StoreKind,
    pub(crate) traits: TraceStoreTraits,
    pub(crate) flags: StoreFlags,
    pub(crate) mapping_size: u64,
    pub(crate) path: PathBuf,
    pub(crate) file: OnceLock<Arc<BackingFile>>,

    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) threadpool: Arc<ThreadPool>,
    pub(crate) clock: SessionClock,

    pub(crate) pool: MemoryMapPool,
    pub(crate) active: Mutex<ActiveState>,
    pub(crate) allocation_log: Mutex<AllocationLog>,
    pub(crate) critical_section: Mutex<()>,
    pub(crate) policy: AtomicU8,
    pub(crate) events: StoreEvents,
    pub(crate) info: InfoBinding,
    pub(crate) satellites: [Option<Arc<TraceStore>>; MetadataKind::COUNT],

    pub(crate) non_retired: Mutex<Vec<Box<MemoryMap>>>,
    pub(crate) readonly_maps: RwLock<Vec<Box<MemoryMap>>>,
    pub(crate) relocations: Option<RelocationTable>,
    pub(crate) loaded_relocations: OnceLock<Option<RelocationTable>>,
    pub(crate) translator: OnceLock<AddressTranslator>,
    pub(crate) single_record: OnceLock<FallibleRegion>,
    pub(crate) bind_complete_fn: Option<BindCompleteFn>,

    pub(crate) mapped_sequence: AtomicU32,
    pub(crate) last_error: AtomicI32,
    pub(crate) preparation_failed: AtomicBool,
    pub(crate) bound: AtomicBool,
    pub(crate) rundown_complete: AtomicBool,
    this: Weak<TraceStore>,
}

impl TraceStore {
    pub(crate) fn new(spec: StoreSpec, env: &StoreEnvironment) -> Arc<Self> {
        let readonly = spec.flags.contains(StoreFlags::READONLY);
        let growth_count = spec
            .initial_map_count
            .filter(|_| !spec.traits.is_single_record() && !(readonly && spec.kind.is_metadata()))
            .unwrap_or_else(|| pool::required_map_count(spec.traits, spec.kind, readonly));
        let policy = if spec.traits.is_concurrent() {
            AllocatorPolicy::Concurrent
        } else {
            AllocatorPolicy::Plain
        };

        Arc::new_cyclic(|this| TraceStore {
            id: spec.id,
            name: spec.name,
            kind: spec.kind,
            traits: spec.traits,
            flags: spec.flags,
            mapping_size: spec.mapping_size,
            path: spec.path,
            file: OnceLock::new(),
            platform: Arc::clone(&env.platform),
            threadpool: Arc::clone(&env.threadpool),
            clock: env.clock,
            pool: MemoryMapPool::new(Arc::clone(&env.allocator), growth_count),
            active: Mutex::new(ActiveState::default()),
            allocation_log: Mutex::new(AllocationLog::default()),
            critical_section: Mutex::new(()),
            policy: AtomicU8::new(policy as u8),
            events: StoreEvents::new(),
            info: InfoBinding::new(),
            satellites: spec.satellites,
            non_retired: Mutex::new(Vec::new()),
            readonly_maps: RwLock::new(Vec::new()),
            relocations: spec.relocations,
            loaded_relocations: OnceLock::new(),
            translator: OnceLock::new(),
            single_record: OnceLock::new(),
            bind_complete_fn: spec.bind_complete,
            mapped_sequence: AtomicU32::new(0),
            last_error: AtomicI32::new(0),
            preparation_failed: AtomicBool::new(false),
            bound: AtomicBool::new(false),
            rundown_complete: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    // ========================================================================
    // Identity
    // ========================================================================

    #[inline]
    pub fn id(&self) -> TraceStoreId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    #[inline]
    pub fn traits(&self) -> TraceStoreTraits {
        self.traits
    }

    #[inline]
    pub fn flags(&self) -> StoreFlags {
        self.flags
    }

    #[inline]
    pub fn mapping_size(&self) -> u64 {
        self.mapping_size
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn is_metadata(&self) -> bool {
        self.kind.is_metadata()
    }

    #[inline]
    pub fn is_readonly(&self) -> bool {
        self.flags.contains(StoreFlags::READONLY)
    }

    #[inline]
    pub fn is_bound(&self) -> bool {
        self.bound.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn coalesces_allocations(&self) -> bool {
        !self.flags.contains(StoreFlags::NO_COALESCING)
    }

    #[inline]
    pub(crate) fn records_allocation_timestamps(&self) -> bool {
        !self.flags.contains(StoreFlags::NO_ALLOCATION_TIMESTAMPS)
    }

    #[inline]
    pub(crate) fn prefaulting(&self) -> bool {
        !self.flags.contains(StoreFlags::NO_PREFAULTING)
    }

    /// Satellite store of `kind`, primary stores only
    #[inline]
    pub fn satellite(&self, kind: MetadataKind) -> Option<&Arc<TraceStore>> {
        self.satellites[kind.index()].as_ref()
    }

    // ========================================================================
    // Bookkeeping
    // ========================================================================

    /// Persisted info, or the local copy until it is bound
    #[inline]
    pub fn info(&self) -> &TraceStoreInfo {
        self.info.get()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.info().stats.snapshot()
    }

    pub fn totals(&self) -> TotalsSnapshot {
        self.info().totals_snapshot()
    }

    /// Descriptor census; ring and retained maps count as held
    pub fn census(&self) -> MapCensus {
        let pool = self.pool.census();
        let active = self.active.lock().occupied() as u32;
        let retained = self.non_retired.lock().len() as u32;
        let readonly = self.readonly_maps.read().len() as u32;
        MapCensus {
            pool,
            active,
            retained,
            readonly,
        }
    }

    /// Last OS error number observed by the store, zero if none
    pub fn last_error(&self) -> i32 {
        self.last_error.load(Ordering::Relaxed)
    }

    pub(crate) fn set_last_error(&self, error: &TraceStoreError) {
        if let Some(errno) = error.errno() {
            self.last_error.store(errno, Ordering::Relaxed);
        }
    }

    pub(crate) fn note_metadata_failure(&self) {
        self.info()
            .stats
            .failed_metadata_writes
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn file(&self) -> TraceStoreResult<&Arc<BackingFile>> {
        self.file.get().ok_or_else(|| TraceStoreError::BindFailed {
            store: self.name.clone(),
            reason: "backing file not opened".into(),
        })
    }

    /// Allocate one metadata record and wrap it for fault-checked access
    pub(crate) fn allocate_metadata_record(&self, size: usize) -> Option<FallibleRegion> {
        let allocation = self.allocate(size as u64, 1)?;
        let file = Arc::clone(self.file.get()?);
        // SAFETY: the allocation is `size` bytes of a live writable view of
        // `file`, kept mapped until rundown.
        Some(unsafe { FallibleRegion::new(allocation.ptr, size, file, allocation.file_offset) })
    }

    /// Run `work` on the session's thread pool with a strong reference
    pub(crate) fn submit_work(&self, work: fn(&TraceStore)) -> bool {
        let Some(this) = self.this.upgrade() else {
            return false;
        };
        self.threadpool.submit(move || work(&this))
    }

    /// Wait for every asynchronous work item of the session to finish
    pub fn wait_for_pipeline(&self) {
        self.threadpool.wait_idle();
    }
}

impl std::fmt::Debug for TraceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceStore")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("traits", &self.traits)
            .field("flags", &self.flags)
            .field("bound", &self.is_bound())
            .finish()
    }
}

/// Descriptor census of one store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapCensus {
    pub pool: PoolCensus,
    /// Descriptors in the generation ring
    pub active: u32,
    /// Descriptors kept mapped until rundown
    pub retained: u32,
    /// Descriptors mapped by a readonly bind
    pub readonly: u32,
}

impl MapCensus {
    /// Every descriptor ever created is accounted for exactly once
    pub fn is_conserved(&self) -> bool {
        let held = self.active as usize
            + self.retained as usize
            + self.readonly as usize
            + self.pool.free
            + self.pool.prepare
            + self.pool.ready
            + self.pool.close
            + self.pool.prefault;
        held == self.pool.total as usize
    }
}
