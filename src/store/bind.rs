/*!
 * Store Binding
 *
 * Attaches a constructed store to its backing file.
 *
 * - Writable stores prepare their first map synchronously, consume it and
 *   queue preparation of the next slice.
 * - Readonly metadata stores map their whole file in one view.
 * - Readonly primary stores map one view per recorded address range, in
 *   parallel on the session's workers. Streaming readonly stores map
 *   nothing up front.
 *
 * Every store's info is redirected into mapped memory once bound: primary
 * stores into their `:Info` record, satellites into their slot of the
 * `:MetadataInfo` array.
 */

use super::address::AddressRecord;
use super::info::{MetadataInfo, TraceStoreInfo, METADATA_INFO_SIZE, TRACE_STORE_INFO_SIZE};
use super::memory_map::MapState;
use super::pool::MapQueue;
use super::relocation::AddressTranslator;
use super::traits::{StoreFlags, TraceStoreTraits};
use super::TraceStore;
use crate::core::errors::{TraceStoreError, TraceStoreResult};
use crate::core::types::{MetadataKind, StoreKind};
use crate::platform::{BackingFile, FallibleRegion, ViewAccess};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Completion of a bind, run exactly once
pub type BindDone = Box<dyn FnOnce(TraceStoreResult<()>) + Send>;

/// Progress of the parallel slice mapping of a readonly primary store
struct ReadonlyLoad {
    remaining: AtomicUsize,
    failure: Mutex<Option<TraceStoreError>>,
    done: Mutex<Option<BindDone>>,
}

impl TraceStore {
    /// Bind the store to its file; `done` may run on a worker thread
    pub(crate) fn bind(&self, done: BindDone) {
        debug!(store = %self.name, readonly = self.is_readonly(), "binding store");

        if !self.is_readonly() {
            let result = self.bind_writable();
            self.finish_bind(result, done);
        } else if self.is_metadata() {
            let result = self.bind_readonly_metadata();
            self.finish_bind(result, done);
        } else {
            match self.bind_readonly_primary() {
                Ok(records) => self.map_readonly_slices(records, done),
                Err(error) => self.finish_bind(Err(error), done),
            }
        }
    }

    /// Block until the store finished binding, successfully or not
    pub fn wait_for_bind(&self) {
        self.events.bind_complete.wait();
    }

    fn finish_bind(&self, result: TraceStoreResult<()>, done: BindDone) {
        let result = result.and_then(|()| match &self.bind_complete_fn {
            Some(callback) if !self.is_metadata() => callback(self),
            _ => Ok(()),
        });

        match &result {
            Ok(()) => {
                self.bound.store(true, Ordering::Release);
                info!(store = %self.name, readonly = self.is_readonly(), "store bound");
            }
            Err(error) => {
                self.set_last_error(error);
                error!(store = %self.name, %error, "store bind failed");
            }
        }
        self.events.bind_complete.set();
        done(result);
    }

    fn open_file(&self) -> TraceStoreResult<()> {
        let mut options = OpenOptions::new();
        options.read(true);
        if !self.is_readonly() {
            options.write(true).create(true).truncate(true);
        }
        let file = options
            .open(&self.path)
            .map_err(|e| TraceStoreError::io(&self.path, e))?;
        let len = self
            .platform
            .file_len(&file)
            .map_err(|e| TraceStoreError::io(&self.path, e))?;
        self.file.set(Arc::new(BackingFile::new(file, len))).map_err(|_| TraceStoreError::BindFailed {
            store: self.name.clone(),
            reason: "store bound twice".into(),
        })
    }

    fn readonly_access(&self) -> ViewAccess {
        if self.is_metadata() || self.flags.contains(StoreFlags::COPY_ON_WRITE) {
            ViewAccess::CopyOnWrite
        } else {
            ViewAccess::ReadOnly
        }
    }

    // ========================================================================
    // Writable
    // ========================================================================

    fn bind_writable(&self) -> TraceStoreResult<()> {
        self.traits.validate(self.kind)?;
        self.open_file()?;

        let mut first = self
            .pool
            .create_maps(self.pool.growth_count())
            .ok_or_else(|| TraceStoreError::ExhaustedFreeMemoryMaps(self.name.clone()))?;
        self.events.all_maps_free.reset();

        first.mapping_size = self.mapping_size;
        if !self.is_metadata() {
            first.address = self.load_next_address();
        }
        first.transition(MapState::Preparing);
        if let Err(error) = self.prepare_memory_map(&mut first) {
            first.transition(MapState::Free);
            self.release_map(first);
            return Err(error);
        }
        first.transition(MapState::Prepared);

        {
            let mut state = self.active.lock();
            if self.traits.is_single_record() {
                self.activate(&mut state, first);
            } else {
                self.pool.push(MapQueue::Ready, first);
                if !self.consume_next(&mut state) {
                    return Err(if self.pool.len(MapQueue::Ready) > 0 {
                        TraceStoreError::ExhaustedFreeMemoryMaps(self.name.clone())
                    } else {
                        TraceStoreError::NextMemoryMapNotReady(self.name.clone())
                    });
                }
            }
        }

        match self.kind {
            StoreKind::Metadata(MetadataKind::MetadataInfo) => self.allocate_single_record(METADATA_INFO_SIZE)?,
            StoreKind::Metadata(MetadataKind::Info) => self.allocate_single_record(TRACE_STORE_INFO_SIZE)?,
            _ => {}
        }
        self.bind_info(true)?;

        let info = self.info();
        info.traits.store(u64::from(self.traits.bits()), Ordering::Relaxed);
        info.set_session_time(self.clock.session_time());

        if self.flags.contains(StoreFlags::HAS_RELOCATIONS) {
            self.save_relocation_info()?;
        }
        Ok(())
    }

    fn allocate_single_record(&self, size: usize) -> TraceStoreResult<()> {
        let region = self
            .allocate_metadata_record(size)
            .ok_or_else(|| TraceStoreError::ExhaustedFreeMemoryMaps(self.name.clone()))?;
        self.set_single_record(region)
    }

    fn set_single_record(&self, region: FallibleRegion) -> TraceStoreResult<()> {
        self.single_record.set(region).map_err(|_| TraceStoreError::BindFailed {
            store: self.name.clone(),
            reason: "single record already bound".into(),
        })
    }

    // ========================================================================
    // Info
    // ========================================================================

    /// The single record of a single-record store, viewed as `T`
    fn single_record_ptr<T>(&self) -> TraceStoreResult<NonNull<T>> {
        let missing = |reason: &str| TraceStoreError::BindFailed {
            store: self.name.clone(),
            reason: reason.into(),
        };
        let region = self.single_record.get().ok_or_else(|| missing("single record not bound"))?;
        if region.len() < size_of::<T>() {
            return Err(TraceStoreError::CorruptMetadata {
                store: self.name.clone(),
                reason: format!("record of {} bytes, expected {}", region.len(), size_of::<T>()),
            });
        }
        NonNull::new(region.address() as *mut T).ok_or_else(|| missing("single record is null"))
    }

    fn metadata_info_entry(&self, kind: MetadataKind) -> TraceStoreResult<NonNull<TraceStoreInfo>> {
        let directory = if kind == MetadataKind::MetadataInfo {
            self
        } else {
            self.satellite(MetadataKind::MetadataInfo)
                .map(Arc::as_ref)
                .ok_or_else(|| TraceStoreError::BindFailed {
                    store: self.name.clone(),
                    reason: "metadata info store missing".into(),
                })?
        };
        let infos = directory.single_record_ptr::<MetadataInfo>()?;
        // SAFETY: the record lives in a view of the directory store, which
        // is run down after every store bound into it.
        Ok(unsafe { NonNull::from(infos.as_ref().entry(kind)) })
    }

    fn bind_info(&self, merge: bool) -> TraceStoreResult<()> {
        let target = match self.kind {
            StoreKind::Primary => self
                .satellite(MetadataKind::Info)
                .ok_or_else(|| TraceStoreError::BindFailed {
                    store: self.name.clone(),
                    reason: "info store missing".into(),
                })?
                .single_record_ptr::<TraceStoreInfo>()?,
            StoreKind::Metadata(kind) => self.metadata_info_entry(kind)?,
        };
        // SAFETY: as above, the target outlives this store's binding.
        unsafe { self.info.bind(target, merge) };
        Ok(())
    }

    // ========================================================================
    // Readonly
    // ========================================================================

    fn bind_readonly_metadata(&self) -> TraceStoreResult<()> {
        self.open_file()?;
        let file = Arc::clone(self.file()?);
        let len = self
            .platform
            .file_len(&file)
            .map_err(|e| TraceStoreError::io(&self.path, e))?;

        let record_size = match self.kind {
            StoreKind::Metadata(MetadataKind::MetadataInfo) => Some(METADATA_INFO_SIZE),
            StoreKind::Metadata(MetadataKind::Info) => Some(TRACE_STORE_INFO_SIZE),
            _ => None,
        };
        if let Some(size) = record_size {
            if len < size as u64 {
                return Err(TraceStoreError::CorruptMetadata {
                    store: self.name.clone(),
                    reason: format!("file of {} bytes holds no {}-byte record", len, size),
                });
            }
        }

        if len > 0 {
            let mut map = self
                .pool
                .create_maps(1)
                .ok_or_else(|| TraceStoreError::ExhaustedFreeMemoryMaps(self.name.clone()))?;
            self.events.all_maps_free.reset();
            map.transition(MapState::Preparing);

            let view = match self.map_slice(&file, 0, len as usize, self.readonly_access(), None) {
                Ok(view) => view,
                Err(error) => {
                    map.transition(MapState::Free);
                    self.release_map(map);
                    return Err(error);
                }
            };

            map.mapping_size = len;
            map.base_address = view.address();
            map.next_address = map.base_address + len as usize;
            if let Some(size) = record_size {
                // SAFETY: the view covers at least `size` bytes of the file
                // and stays mapped until rundown.
                let region = unsafe { FallibleRegion::new(view.base(), size, Arc::clone(&file), 0) };
                self.set_single_record(region)?;
            }
            map.view = Some(view);
            map.transition(MapState::Readonly);
            self.readonly_maps.write().push(map);
        }

        self.bind_info(false)
    }

    fn bind_readonly_primary(&self) -> TraceStoreResult<Vec<AddressRecord>> {
        self.open_file()?;
        self.bind_info(false)?;

        let persisted = self.info().traits.load(Ordering::Relaxed);
        let matches = u32::try_from(persisted)
            .ok()
            .and_then(TraceStoreTraits::from_bits)
            .is_some_and(|traits| traits == self.traits);
        if !matches {
            return Err(TraceStoreError::TraitViolation(format!(
                "{}: persisted traits 0x{:x} differ from {:?}",
                self.name, persisted, self.traits
            )));
        }

        let relocations = self.load_relocation_info()?;
        let _ = self.loaded_relocations.set(relocations);

        if self.traits.contains(TraceStoreTraits::STREAMING_READ) {
            return Ok(Vec::new());
        }

        let file_len = self
            .platform
            .file_len(self.file()?)
            .map_err(|e| TraceStoreError::io(&self.path, e))?;
        Ok(self
            .address_records()?
            .into_iter()
            .filter(|record| record.mapped_size > 0 && record.file_offset < file_len)
            .collect())
    }

    fn map_readonly_slices(&self, records: Vec<AddressRecord>, done: BindDone) {
        if records.is_empty() {
            self.finish_readonly_slices();
            self.finish_bind(Ok(()), done);
            return;
        }
        let Some(this) = self.this.upgrade() else {
            done(Err(TraceStoreError::BindFailed {
                store: self.name.clone(),
                reason: "store dropped during bind".into(),
            }));
            return;
        };

        self.events.all_maps_free.reset();
        let load = Arc::new(ReadonlyLoad {
            remaining: AtomicUsize::new(records.len()),
            failure: Mutex::new(None),
            done: Mutex::new(Some(done)),
        });

        for record in records {
            let (store, progress) = (Arc::clone(&this), Arc::clone(&load));
            if !self
                .threadpool
                .submit(move || readonly_slice_job(&store, &progress, record))
            {
                readonly_slice_job(&this, &load, record);
            }
        }
    }

    /// Map one recorded slice at its original address if possible
    fn map_readonly_slice(&self, record: &AddressRecord) -> TraceStoreResult<()> {
        let file = self.file()?;
        let file_len = self
            .platform
            .file_len(file)
            .map_err(|e| TraceStoreError::io(&self.path, e))?;

        let mut map = self
            .pool
            .acquire()
            .ok_or_else(|| TraceStoreError::ExhaustedFreeMemoryMaps(self.name.clone()))?;
        map.file_offset = record.file_offset;
        map.mapping_size = record.mapped_size.min(file_len - record.file_offset);
        map.preferred_base_address = record.base_address as usize;
        map.transition(MapState::Preparing);

        let preferred = (map.preferred_base_address != 0).then_some(map.preferred_base_address);
        match self.map_slice(file, map.file_offset, map.mapping_size as usize, self.readonly_access(), preferred) {
            Ok(view) => {
                map.base_address = view.address();
                map.next_address = map.base_address + map.mapping_size as usize;
                map.view = Some(view);
                map.transition(MapState::Readonly);
                self.readonly_maps.write().push(map);
                Ok(())
            }
            Err(error) => {
                map.transition(MapState::Free);
                self.release_map(map);
                Err(error)
            }
        }
    }

    /// Order the reloaded views and derive the address translation
    fn finish_readonly_slices(&self) {
        // Streaming readers map nothing up front and translate no addresses.
        if self.traits.contains(TraceStoreTraits::STREAMING_READ) {
            return;
        }
        let mut maps = self.readonly_maps.write();
        maps.sort_by_key(|map| map.file_offset);
        let translator = AddressTranslator::new(
            maps.iter()
                .map(|map| (map.preferred_base_address as u64, map.base_address as u64, map.mapping_size)),
        );
        drop(maps);
        let _ = self.translator.set(translator);
    }
}

fn readonly_slice_job(store: &TraceStore, load: &ReadonlyLoad, record: AddressRecord) {
    if let Err(error) = store.map_readonly_slice(&record) {
        load.failure.lock().get_or_insert(error);
    }
    if load.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
        return;
    }

    store.finish_readonly_slices();
    let result = match load.failure.lock().take() {
        Some(error) => Err(error),
        None => Ok(()),
    };
    if let Some(done) = load.done.lock().take() {
        store.finish_bind(result, done);
    }
}
