//! Canonical record types for pool-wide image metadata.
//!
//! One `ImageInfo` is assembled per image and scan; the engine holds no state
//! across calls, so every field reflects on-pool metadata at scan time.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Image supports snapshot cloning (layering).
pub const FEATURE_LAYERING: u64 = 1 << 0;
/// Image maintains a per-object existence bitmap.
pub const FEATURE_OBJECT_MAP: u64 = 1 << 3;
/// Object-map entries additionally track clean/dirty state.
pub const FEATURE_FAST_DIFF: u64 = 1 << 4;

/// Named flag set selecting which expensive record fields a scan populates.
///
/// Flags combine with `|`; the default (`NONE`) is the cheapest scan: no
/// reverse lineage, no usage reads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InfoFilter(u32);

impl InfoFilter {
    /// Cheapest scan: lineage children and usage omitted.
    pub const NONE: Self = Self(0);
    /// Populate each snapshot's reverse child lineage (pool-wide cost).
    pub const CHILDREN_V1: Self = Self(1 << 0);
    /// Compute whole-image disk usage.
    pub const IMAGE_DU: Self = Self(1 << 1);
    /// Compute per-snapshot disk usage.
    pub const SNAP_DU: Self = Self(1 << 2);

    const ALL: u32 = (1 << 3) - 1;

    /// True if every flag in `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bit representation.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Build from raw bits, ignoring unknown bits.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & Self::ALL)
    }

    /// True if any usage computation (image or snapshot) was requested.
    #[must_use]
    pub const fn wants_usage(self) -> bool {
        self.0 & (Self::IMAGE_DU.0 | Self::SNAP_DU.0) != 0
    }
}

impl BitOr for InfoFilter {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for InfoFilter {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Snapshot namespace type.
///
/// `Unknown` is the sentinel for on-disk codes this engine does not
/// recognize; unknown codes are surfaced, never dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapType {
    User,
    Group,
    Trash,
    Unknown,
}

impl SnapType {
    /// Decode an on-disk type code.
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            0 => Self::User,
            1 => Self::Group,
            2 => Self::Trash,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Group => "group",
            Self::Trash => "trash",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SnapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot protection state.
///
/// `Unprotecting` is a transient state while a protection removal is in
/// flight and is preserved as-is. `Unknown` covers unrecognized on-disk
/// codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtectionStatus {
    Unprotected,
    Unprotecting,
    Protected,
    Invalid,
    Unknown,
}

impl ProtectionStatus {
    /// Decode an on-disk protection code.
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Unprotected,
            1 => Self::Unprotecting,
            2 => Self::Protected,
            3 => Self::Invalid,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unprotected => "unprotected",
            Self::Unprotecting => "unprotecting",
            Self::Protected => "protected",
            Self::Invalid => "invalid",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProtectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Weak reference to the snapshot an image was cloned from.
///
/// Identity only: the referenced image may be deleted independently, leaving
/// this dangling. A dangling parent is still emitted in the record.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Parent {
    pub pool_id: i64,
    pub pool_namespace: String,
    pub image_id: String,
    pub snap_id: u64,
}

/// Weak reference to an image cloned from a snapshot.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Child {
    pub pool_id: i64,
    pub pool_namespace: String,
    pub image_id: String,
}

/// One snapshot of an image.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapInfo {
    /// Unique per image, monotonically assigned, never reused.
    pub id: u64,
    pub name: String,
    pub snap_type: SnapType,
    /// Image size at snapshot time; independent of the current image size.
    pub size: u64,
    pub flags: u64,
    pub protection_status: ProtectionStatus,
    pub timestamp: i64,
    /// Images cloned from this snapshot. Populated only under
    /// `InfoFilter::CHILDREN_V1`.
    pub children: BTreeSet<Child>,
    /// Bytes in existing objects. `None` when usage was not requested or
    /// could not be computed.
    pub du: Option<u64>,
    /// Bytes in existing-and-dirty objects. Equals `du` when the image has
    /// no fast-diff data, since no clean/dirty distinction exists then.
    pub dirty: Option<u64>,
}

/// Complete consistency-checked metadata record for one image.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Stable internal identifier, immutable for the image lifetime.
    pub id: String,
    /// User-facing name; may be renamed independently of `id`.
    pub name: String,
    /// log2 of the per-object size.
    pub order: u8,
    /// Logical byte length.
    pub size: u64,
    pub features: u64,
    pub op_features: u64,
    pub flags: u64,
    /// Snapshots keyed by id; ascending id order is creation order.
    pub snaps: BTreeMap<u64, SnapInfo>,
    /// `None` when the image is not a clone.
    pub parent: Option<Parent>,
    pub create_timestamp: i64,
    pub access_timestamp: i64,
    pub modify_timestamp: i64,
    /// May differ from the metadata pool for tiered layouts; -1 when data
    /// lives in the metadata pool.
    pub data_pool_id: i64,
    /// Live client registrations on the image header. Transient.
    pub watchers: Vec<String>,
    /// Opaque user key-value sidecar.
    pub metas: BTreeMap<String, String>,
    /// Whole-image usage; `None` unless `IMAGE_DU` was requested and
    /// computable.
    pub du: Option<u64>,
    pub dirty: Option<u64>,
}

impl ImageInfo {
    /// True if the image tracks clean/dirty per object.
    #[must_use]
    pub const fn has_fast_diff(&self) -> bool {
        self.features & FEATURE_FAST_DIFF != 0 && self.features & FEATURE_OBJECT_MAP != 0
    }

    /// True if the image maintains an object-existence bitmap.
    #[must_use]
    pub const fn has_object_map(&self) -> bool {
        self.features & FEATURE_OBJECT_MAP != 0
    }
}
