//! Disk-usage computation from object-map bitmaps.
//!
//! Fast path: decode the per-snapshot 2-bit bitmap once and count entries in
//! existing states, attributing `1 << order` bytes per object except the
//! final object, which gets the image's trailing remainder so unaligned
//! sizes are never overstated.
//!
//! Slow path (no object map): stat every backing data object individually.
//! This is O(objects) round trips per image and is the single most expensive
//! optional operation in the engine; callers opt in via `IMAGE_DU`/`SNAP_DU`
//! and can always leave it off.

use imagemeta_common::{Error, Result};
use tracing::trace;

use crate::data_object;
use crate::session::PoolSession;

/// Object-map blob magic, "OBMP" little-endian.
pub const OBJECT_MAP_MAGIC: u32 = 0x504D_424F;

/// Object-map blob revision understood by this engine.
pub const OBJECT_MAP_VERSION: u8 = 1;

/// No backing object.
pub const OBJ_NONEXISTENT: u8 = 0;
/// Object exists with writes not yet flagged clean.
pub const OBJ_EXISTS: u8 = 1;
/// Object existence is being updated; counts as existing, not dirty.
pub const OBJ_PENDING: u8 = 2;
/// Object exists and is clean.
pub const OBJ_EXISTS_CLEAN: u8 = 3;

/// Byte totals derived from one bitmap or stat pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsageCounts {
    /// Bytes in objects that exist in any state.
    pub du: u64,
    /// Bytes in objects that exist and are dirty. Equals `du` when no
    /// clean/dirty distinction is available.
    pub dirty: u64,
}

/// Number of backing objects for a logical size at the given order.
#[must_use]
pub fn object_count(size: u64, order: u8) -> u64 {
    size.div_ceil(1u64 << order)
}

/// Bytes attributable to object `index`; the final object carries only the
/// trailing remainder when `size` is not object-aligned.
fn object_span(index: u64, count: u64, size: u64, order: u8) -> u64 {
    let object_size = 1u64 << order;
    if index + 1 == count {
        size - (count - 1) * object_size
    } else {
        object_size
    }
}

/// Decode an object-map blob and count usage for an image or snapshot of
/// logical `size` at `order`.
///
/// The blob's entry count must match the object count implied by the size;
/// a mismatch means the bitmap and the header disagree (for example a stale
/// bitmap surviving a resize) and is reported as corrupt rather than
/// silently clamped. When `fast_diff` is false the bitmap still proves
/// existence but carries no clean/dirty signal, so `dirty` is reported
/// equal to `du`.
pub fn usage_from_object_map(
    blob: &[u8],
    oid: &str,
    size: u64,
    order: u8,
    fast_diff: bool,
) -> Result<UsageCounts> {
    const HEADER_LEN: usize = 4 + 1 + 8;
    if blob.len() < HEADER_LEN {
        return Err(Error::corrupt(oid, "object map shorter than header"));
    }
    let magic = u32::from_le_bytes(blob[0..4].try_into().unwrap());
    if magic != OBJECT_MAP_MAGIC {
        return Err(Error::corrupt(oid, format!("bad object map magic {magic:#x}")));
    }
    let version = blob[4];
    if version != OBJECT_MAP_VERSION {
        return Err(Error::corrupt(
            oid,
            format!("unsupported object map version {version}"),
        ));
    }
    let count = u64::from_le_bytes(blob[5..13].try_into().unwrap());

    let expected = object_count(size, order);
    if count != expected {
        return Err(Error::corrupt(
            oid,
            format!("object map has {count} entries, image geometry implies {expected}"),
        ));
    }

    let packed_len = (count as usize).div_ceil(4);
    let payload = &blob[HEADER_LEN..];
    if payload.len() < packed_len {
        return Err(Error::corrupt(
            oid,
            format!(
                "object map payload truncated: {} bytes, need {packed_len}",
                payload.len()
            ),
        ));
    }

    let mut counts = UsageCounts::default();
    for index in 0..count {
        let byte = payload[(index / 4) as usize];
        let state = (byte >> ((index % 4) * 2)) & 0b11;
        if state == OBJ_NONEXISTENT {
            continue;
        }
        let span = object_span(index, count, size, order);
        counts.du += span;
        if state == OBJ_EXISTS {
            counts.dirty += span;
        }
    }
    if !fast_diff {
        counts.dirty = counts.du;
    }
    trace!(oid, du = counts.du, dirty = counts.dirty, "object map decoded");
    Ok(counts)
}

/// Slow-path usage: stat every backing object of the image (or of one
/// snapshot) and sum stored sizes. With no object map there is no
/// clean/dirty distinction, so `dirty == du` by construction.
pub async fn usage_by_stat(
    session: &dyn PoolSession,
    image_id: &str,
    snap_id: Option<u64>,
    size: u64,
    order: u8,
) -> Result<UsageCounts> {
    let mut du = 0u64;
    for index in 0..object_count(size, order) {
        let oid = data_object(image_id, index);
        if let Some(stored) = session.stat_object(&oid, snap_id).await? {
            du += stored;
        }
    }
    Ok(UsageCounts { du, dirty: du })
}
