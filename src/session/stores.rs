/*!
 * Store Set
 *
 * Constructs every primary store of a session together with its seven
 * satellites, and runs them down in dependency order.
 */

use super::descriptor::StoreDescriptor;
use crate::config::TraceSessionConfig;
use crate::core::errors::{TraceStoreError, TraceStoreResult};
use crate::core::limits::{
    DEFAULT_ADDRESS_MAPPING_SIZE, DEFAULT_ALLOCATION_MAPPING_SIZE, DEFAULT_ALLOCATION_TIMESTAMP_MAPPING_SIZE,
    DEFAULT_BITMAP_MAPPING_SIZE, DEFAULT_INFO_MAPPING_SIZE, DEFAULT_RELOCATION_MAPPING_SIZE,
    TRACE_STORE_FILE_EXTENSION,
};
use crate::core::types::{MetadataKind, StoreKind, TraceStoreId};
use crate::store::{BindCompleteFn, RelocationTable, StoreEnvironment, StoreFlags, StoreSpec, TraceStore, TraceStoreTraits};
use ahash::AHashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

fn metadata_mapping_size(kind: MetadataKind) -> u64 {
    match kind {
        MetadataKind::MetadataInfo | MetadataKind::Info => DEFAULT_INFO_MAPPING_SIZE,
        MetadataKind::Allocation => DEFAULT_ALLOCATION_MAPPING_SIZE,
        MetadataKind::AllocationTimestamp => DEFAULT_ALLOCATION_TIMESTAMP_MAPPING_SIZE,
        MetadataKind::Relocation => DEFAULT_RELOCATION_MAPPING_SIZE,
        MetadataKind::Address => DEFAULT_ADDRESS_MAPPING_SIZE,
        MetadataKind::Bitmap => DEFAULT_BITMAP_MAPPING_SIZE,
    }
}

/// File of a store: `<dir>/<name>.dat` plus the satellite suffix
pub fn store_path(directory: &Path, name: &str, kind: StoreKind) -> PathBuf {
    let suffix = kind.metadata_kind().map(MetadataKind::suffix).unwrap_or("");
    directory.join(format!("{}.{}{}", name, TRACE_STORE_FILE_EXTENSION, suffix))
}

/// Runtime flags of one store of a session
pub(crate) fn session_flags(
    traits: TraceStoreTraits,
    kind: StoreKind,
    config: &TraceSessionConfig,
    descriptor: &StoreDescriptor,
) -> StoreFlags {
    let mut flags = StoreFlags::derive(traits, config.readonly);

    // Address slots of retained primary maps point into the ledger's views.
    if kind == StoreKind::Metadata(MetadataKind::Address) {
        flags |= StoreFlags::NO_RETIRE;
    }
    if config.no_prefaulting {
        flags |= StoreFlags::NO_PREFAULTING;
    }
    if config.readonly && config.ignore_preferred_addresses {
        flags |= StoreFlags::IGNORE_PREFERRED_ADDRESSES;
    }

    if kind == StoreKind::Primary {
        if config.readonly && config.copy_on_write {
            flags |= StoreFlags::COPY_ON_WRITE;
        }
        if config.hard_metadata_failures {
            flags |= StoreFlags::HARD_METADATA_FAILURES;
        }
        if !descriptor.coalesce_allocations {
            flags |= StoreFlags::NO_COALESCING;
        }
        if config.disable_allocation_timestamps || traits.contains(TraceStoreTraits::LINKED_STORE) {
            flags |= StoreFlags::NO_ALLOCATION_TIMESTAMPS;
        }
        if !descriptor.relocations.is_empty() {
            flags |= StoreFlags::HAS_RELOCATIONS;
        }
    }
    flags
}

fn check_descriptors(descriptors: &[StoreDescriptor]) -> TraceStoreResult<()> {
    let mut ids: Vec<TraceStoreId> = descriptors.iter().map(|d| d.id).collect();
    ids.sort_unstable();
    if let Some(pair) = ids.windows(2).find(|pair| pair[0] == pair[1]) {
        return Err(TraceStoreError::InvalidArgument(format!("store id {} declared twice", pair[0])));
    }
    for descriptor in descriptors {
        if let Some(field) = descriptor
            .relocations
            .iter()
            .find(|field| ids.binary_search(&field.target).is_err())
        {
            return Err(TraceStoreError::InvalidArgument(format!(
                "{} relocates into unknown store {}",
                descriptor.name, field.target
            )));
        }
    }
    Ok(())
}

/// Primary stores of a session
pub struct TraceStores {
    primaries: Vec<Arc<TraceStore>>,
    names: AHashMap<String, usize>,
    ids: AHashMap<TraceStoreId, usize>,
}

impl TraceStores {
    pub(crate) fn create(
        descriptors: &[StoreDescriptor],
        config: &TraceSessionConfig,
        env: &StoreEnvironment,
        bind_complete: &AHashMap<TraceStoreId, BindCompleteFn>,
    ) -> TraceStoreResult<Self> {
        check_descriptors(descriptors)?;

        let mut primaries = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let satellites = Self::create_satellites(descriptor, config, env);
            let mapping_size = config.mapping_size_override.unwrap_or(descriptor.mapping_size);
            let kind = StoreKind::Primary;

            let spec = StoreSpec {
                id: descriptor.id,
                name: descriptor.name.to_string(),
                kind,
                traits: descriptor.traits,
                flags: session_flags(descriptor.traits, kind, config, descriptor),
                mapping_size,
                path: store_path(&config.directory, descriptor.name, kind),
                initial_map_count: config.initial_map_count_override,
                satellites,
                relocations: Some(RelocationTable::new(descriptor.relocations)),
                bind_complete: bind_complete.get(&descriptor.id).cloned(),
            };
            primaries.push(TraceStore::new(spec, env));
        }

        let names = primaries
            .iter()
            .enumerate()
            .map(|(index, store)| (store.name().to_string(), index))
            .collect();
        let ids = primaries
            .iter()
            .enumerate()
            .map(|(index, store)| (store.id(), index))
            .collect();
        debug!(stores = primaries.len(), readonly = config.readonly, "trace stores created");

        Ok(Self { primaries, names, ids })
    }

    fn create_satellites(
        descriptor: &StoreDescriptor,
        config: &TraceSessionConfig,
        env: &StoreEnvironment,
    ) -> [Option<Arc<TraceStore>>; MetadataKind::COUNT] {
        let mut satellites: [Option<Arc<TraceStore>>; MetadataKind::COUNT] = Default::default();

        for kind in MetadataKind::ALL {
            let mut linked: [Option<Arc<TraceStore>>; MetadataKind::COUNT] = Default::default();
            if kind != MetadataKind::MetadataInfo {
                linked[MetadataKind::MetadataInfo.index()] = satellites[MetadataKind::MetadataInfo.index()].clone();
            }

            let traits = TraceStoreTraits::for_metadata(kind);
            let store_kind = StoreKind::Metadata(kind);
            let spec = StoreSpec {
                id: descriptor.id,
                name: format!("{}{}", descriptor.name, kind.suffix()),
                kind: store_kind,
                traits,
                flags: session_flags(traits, store_kind, config, descriptor),
                mapping_size: metadata_mapping_size(kind),
                path: store_path(&config.directory, descriptor.name, store_kind),
                initial_map_count: config.initial_map_count_override,
                satellites: linked,
                relocations: None,
                bind_complete: None,
            };
            satellites[kind.index()] = Some(TraceStore::new(spec, env));
        }
        satellites
    }

    pub fn get(&self, id: TraceStoreId) -> Option<&Arc<TraceStore>> {
        self.ids.get(&id).map(|&index| &self.primaries[index])
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<TraceStore>> {
        self.names.get(name).map(|&index| &self.primaries[index])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<TraceStore>> {
        self.primaries.iter()
    }

    pub fn len(&self) -> usize {
        self.primaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primaries.is_empty()
    }

    /// Rewrite the pointer fields of a record read from store `id`
    ///
    /// Pointers are translated with the address translation of each target
    /// store; returns the number of fields rewritten.
    pub fn relocate_record(&self, id: TraceStoreId, record: &mut [u8]) -> TraceStoreResult<usize> {
        let store = self
            .get(id)
            .ok_or_else(|| TraceStoreError::InvalidArgument(format!("unknown store {}", id)))?;
        store.relocate_record(record, |target| self.get(target).and_then(|store| store.translator()))
    }

    /// Run every store down: primaries first, the metadata info directory
    /// of each group last
    pub(crate) fn rundown(&self) {
        for primary in &self.primaries {
            primary.rundown();
            for kind in MetadataKind::REMAINING {
                if let Some(satellite) = primary.satellite(kind) {
                    satellite.rundown();
                }
            }
            if let Some(directory) = primary.satellite(MetadataKind::MetadataInfo) {
                directory.rundown();
            }
        }
    }
}

impl std::fmt::Debug for TraceStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.primaries.iter().map(|s| s.name())).finish()
    }
}
