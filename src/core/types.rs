/*!
 * Core Types
 * Store identities and processor information shared across the engine
 */

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Store Identity
// ============================================================================

/// Index of a primary store in its session's store table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceStoreId(pub u16);

impl fmt::Display for TraceStoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Satellite store kinds mirrored by every primary store
///
/// The discriminant is the index into the persisted `MetadataInfo` array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MetadataKind {
    MetadataInfo = 0,
    Allocation = 1,
    Relocation = 2,
    Address = 3,
    Bitmap = 4,
    Info = 5,
    AllocationTimestamp = 6,
}

impl MetadataKind {
    pub const COUNT: usize = 7;

    pub const ALL: [MetadataKind; Self::COUNT] = [
        MetadataKind::MetadataInfo,
        MetadataKind::Allocation,
        MetadataKind::Relocation,
        MetadataKind::Address,
        MetadataKind::Bitmap,
        MetadataKind::Info,
        MetadataKind::AllocationTimestamp,
    ];

    /// Kinds bound in parallel once `MetadataInfo` is ready
    pub const REMAINING: [MetadataKind; Self::COUNT - 1] = [
        MetadataKind::Allocation,
        MetadataKind::Relocation,
        MetadataKind::Address,
        MetadataKind::Bitmap,
        MetadataKind::Info,
        MetadataKind::AllocationTimestamp,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// File name suffix appended to the primary store's file name
    pub const fn suffix(self) -> &'static str {
        match self {
            MetadataKind::MetadataInfo => ":MetadataInfo",
            MetadataKind::Allocation => ":Allocation",
            MetadataKind::Relocation => ":Relocation",
            MetadataKind::Address => ":Address",
            MetadataKind::Bitmap => ":Bitmap",
            MetadataKind::Info => ":Info",
            MetadataKind::AllocationTimestamp => ":AllocationTimestamp",
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            MetadataKind::MetadataInfo => "MetadataInfo",
            MetadataKind::Allocation => "Allocation",
            MetadataKind::Relocation => "Relocation",
            MetadataKind::Address => "Address",
            MetadataKind::Bitmap => "Bitmap",
            MetadataKind::Info => "Info",
            MetadataKind::AllocationTimestamp => "AllocationTimestamp",
        }
    }
}

impl fmt::Display for MetadataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether a store is a primary store or one of its satellites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreKind {
    Primary,
    Metadata(MetadataKind),
}

impl StoreKind {
    #[inline]
    pub const fn is_metadata(self) -> bool {
        matches!(self, StoreKind::Metadata(_))
    }

    #[inline]
    pub const fn metadata_kind(self) -> Option<MetadataKind> {
        match self {
            StoreKind::Metadata(kind) => Some(kind),
            StoreKind::Primary => None,
        }
    }
}

// ============================================================================
// Processor Information
// ============================================================================

/// Thread, processor and NUMA node observed at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorInfo {
    pub thread_id: u32,
    pub processor: u16,
    pub numa_node: u8,
}
