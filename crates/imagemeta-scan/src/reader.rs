//! Per-image metadata fragment fetches and decoding.
//!
//! One image's metadata lives in several independently stored fragments:
//! the header omap (scalars, parent linkage, snapshot directory, user
//! metas), the watcher list, a snap-seq consistency marker, and per-snapshot
//! object-map blobs. Reading these directly — one omap scan plus a handful
//! of point reads — is what lets a scan cover thousands of images without
//! paying the open-image handshake per image.
//!
//! Failure policy: the header omap is the minimum for a usable record, so
//! losing it fails the image. Watchers, metas, parent and object maps are
//! optional fragments and degrade to empty/absent.

use bytes::Bytes;
use imagemeta_common::{Error, InfoFilter, Parent, Result, FEATURE_OBJECT_MAP};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::session::PoolSession;
use crate::{header_object, object_map_object};

const KEY_ORDER: &str = "order";
const KEY_SIZE: &str = "size";
const KEY_FEATURES: &str = "features";
const KEY_OP_FEATURES: &str = "op_features";
const KEY_FLAGS: &str = "flags";
const KEY_NAME: &str = "name";
pub(crate) const KEY_PARENT: &str = "parent";
const KEY_CREATE_TIMESTAMP: &str = "create_timestamp";
const KEY_ACCESS_TIMESTAMP: &str = "access_timestamp";
const KEY_MODIFY_TIMESTAMP: &str = "modify_timestamp";
const KEY_DATA_POOL_ID: &str = "data_pool_id";
const SNAPSHOT_PREFIX: &str = "snapshot_";
const META_PREFIX: &str = "meta_";

/// Header xattr holding the highest snapshot id ever assigned.
const XATTR_SNAP_SEQ: &str = "snap_seq";

/// Parent blob revision understood by this engine.
const PARENT_VERSION: u8 = 1;

/// Smallest valid object order (4 KiB objects).
const MIN_ORDER: u8 = 12;
/// Largest valid object order (64 MiB objects). Also keeps `1u64 << order`
/// well-defined downstream.
const MAX_ORDER: u8 = 26;

/// Undecoded snapshot-directory entry, canonicalized by the assembler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawSnap {
    pub id: u64,
    pub name: String,
    pub snap_type: u8,
    pub size: u64,
    pub flags: u64,
    pub protection: u8,
    pub timestamp: i64,
}

/// Every fragment the reader could obtain for one image.
#[derive(Clone, Debug, Default)]
pub struct RawImage {
    pub id: String,
    /// Name recorded in the header, if any; the directory name wins.
    pub header_name: Option<String>,
    pub order: u8,
    pub size: u64,
    pub features: u64,
    pub op_features: u64,
    pub flags: u64,
    pub create_timestamp: i64,
    pub access_timestamp: i64,
    pub modify_timestamp: i64,
    pub data_pool_id: i64,
    pub parent: Option<Parent>,
    pub snaps: Vec<RawSnap>,
    pub metas: BTreeMap<String, String>,
    pub watchers: Vec<String>,
    /// Highest snapshot id assigned so far; used to cross-check the
    /// snapshot directory.
    pub snap_seq: Option<u64>,
    /// Raw head object-map blob, fetched only under `IMAGE_DU`.
    pub head_object_map: Option<Bytes>,
    /// Raw per-snapshot object-map blobs, fetched only under `SNAP_DU`.
    /// A snapshot missing here had no readable blob.
    pub snap_object_maps: BTreeMap<u64, Bytes>,
}

/// Fetch and structurally decode all fragments for `image_id`.
///
/// Object-map blobs are fetched only when `filter` requests usage and the
/// image carries the object-map feature; they stay raw here and are decoded
/// by the usage calculator.
pub async fn read_image(
    session: &dyn PoolSession,
    image_id: &str,
    filter: InfoFilter,
    page_size: usize,
) -> Result<RawImage> {
    let oid = header_object(image_id);
    let header = read_full_omap(session, &oid, page_size).await?;

    let mut raw = RawImage {
        id: image_id.to_string(),
        data_pool_id: -1,
        ..RawImage::default()
    };

    raw.order = decode_u8(&oid, KEY_ORDER, require(&header, &oid, KEY_ORDER)?)?;
    if !(MIN_ORDER..=MAX_ORDER).contains(&raw.order) {
        return Err(Error::corrupt(
            &oid,
            format!("object order {} outside {MIN_ORDER}..={MAX_ORDER}", raw.order),
        ));
    }
    raw.size = decode_u64(&oid, KEY_SIZE, require(&header, &oid, KEY_SIZE)?)?;
    raw.features = decode_u64(&oid, KEY_FEATURES, require(&header, &oid, KEY_FEATURES)?)?;
    if let Some(v) = header.get(KEY_OP_FEATURES) {
        raw.op_features = decode_u64(&oid, KEY_OP_FEATURES, v)?;
    }
    if let Some(v) = header.get(KEY_FLAGS) {
        raw.flags = decode_u64(&oid, KEY_FLAGS, v)?;
    }
    if let Some(v) = header.get(KEY_CREATE_TIMESTAMP) {
        raw.create_timestamp = decode_i64(&oid, KEY_CREATE_TIMESTAMP, v)?;
    }
    if let Some(v) = header.get(KEY_ACCESS_TIMESTAMP) {
        raw.access_timestamp = decode_i64(&oid, KEY_ACCESS_TIMESTAMP, v)?;
    }
    if let Some(v) = header.get(KEY_MODIFY_TIMESTAMP) {
        raw.modify_timestamp = decode_i64(&oid, KEY_MODIFY_TIMESTAMP, v)?;
    }
    if let Some(v) = header.get(KEY_DATA_POOL_ID) {
        raw.data_pool_id = decode_i64(&oid, KEY_DATA_POOL_ID, v)?;
    }
    if let Some(v) = header.get(KEY_NAME) {
        raw.header_name = Some(decode_utf8(&oid, KEY_NAME, v)?);
    }
    if let Some(v) = header.get(KEY_PARENT) {
        raw.parent = Some(decode_parent(&oid, v)?);
    }

    for (key, value) in &header {
        if let Some(hex_id) = key.strip_prefix(SNAPSHOT_PREFIX) {
            let key_id = u64::from_str_radix(hex_id, 16)
                .map_err(|_| Error::corrupt(&oid, format!("bad snapshot key {key:?}")))?;
            let snap = decode_snapshot_entry(&oid, value)?;
            if snap.id != key_id {
                return Err(Error::corrupt(
                    &oid,
                    format!("snapshot key id {key_id} does not match entry id {}", snap.id),
                ));
            }
            raw.snaps.push(snap);
        } else if let Some(meta_key) = key.strip_prefix(META_PREFIX) {
            match std::str::from_utf8(value) {
                Ok(v) => {
                    raw.metas.insert(meta_key.to_string(), v.to_string());
                }
                Err(_) => warn!(image_id, meta_key, "skipping non-UTF-8 meta value"),
            }
        }
    }

    raw.snap_seq = match session.get_xattr(&oid, XATTR_SNAP_SEQ).await {
        Ok(Some(v)) => Some(decode_u64(&oid, XATTR_SNAP_SEQ, &v)?),
        Ok(None) => None,
        Err(e) if e.is_session_fault() => return Err(e),
        Err(e) => {
            warn!(image_id, error = %e, "snap_seq unreadable; skipping consistency check");
            None
        }
    };

    // Watcher registrations are transient and optional
    raw.watchers = match session.list_watchers(&oid).await {
        Ok(watchers) => watchers.into_iter().map(|w| w.addr).collect(),
        Err(e) if e.is_session_fault() => return Err(e),
        Err(e) => {
            warn!(image_id, error = %e, "watcher list unreadable");
            Vec::new()
        }
    };

    if filter.wants_usage() && raw.features & FEATURE_OBJECT_MAP != 0 {
        if filter.contains(InfoFilter::IMAGE_DU) {
            raw.head_object_map =
                read_object_map(session, image_id, None).await?;
        }
        if filter.contains(InfoFilter::SNAP_DU) {
            for snap in &raw.snaps {
                if let Some(blob) = read_object_map(session, image_id, Some(snap.id)).await? {
                    raw.snap_object_maps.insert(snap.id, blob);
                }
            }
        }
    }

    debug!(
        image_id,
        snaps = raw.snaps.len(),
        watchers = raw.watchers.len(),
        "image fragments read"
    );
    Ok(raw)
}

async fn read_object_map(
    session: &dyn PoolSession,
    image_id: &str,
    snap_id: Option<u64>,
) -> Result<Option<Bytes>> {
    let oid = object_map_object(image_id, snap_id);
    match session.read_object(&oid).await {
        Ok(blob) => Ok(blob),
        Err(e) if e.is_session_fault() => Err(e),
        Err(e) => {
            warn!(image_id, ?snap_id, error = %e, "object map unreadable");
            Ok(None)
        }
    }
}

async fn read_full_omap(
    session: &dyn PoolSession,
    oid: &str,
    page_size: usize,
) -> Result<BTreeMap<String, Bytes>> {
    let mut entries = BTreeMap::new();
    let mut start_after = String::new();
    let page_size = page_size.max(1);

    loop {
        let page = session.omap_list(oid, &start_after, page_size).await?;
        let full_page = page.len() == page_size;
        for (key, value) in page {
            start_after = key.clone();
            entries.insert(key, value);
        }
        if !full_page {
            return Ok(entries);
        }
    }
}

fn require<'a>(
    header: &'a BTreeMap<String, Bytes>,
    oid: &str,
    key: &str,
) -> Result<&'a Bytes> {
    header
        .get(key)
        .ok_or_else(|| Error::corrupt(oid, format!("missing required key {key:?}")))
}

fn decode_u8(oid: &str, key: &str, value: &[u8]) -> Result<u8> {
    match value {
        [b] => Ok(*b),
        _ => Err(Error::corrupt(
            oid,
            format!("key {key:?}: expected 1 byte, got {}", value.len()),
        )),
    }
}

fn decode_u64(oid: &str, key: &str, value: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = value.try_into().map_err(|_| {
        Error::corrupt(
            oid,
            format!("key {key:?}: expected 8 bytes, got {}", value.len()),
        )
    })?;
    Ok(u64::from_le_bytes(bytes))
}

fn decode_i64(oid: &str, key: &str, value: &[u8]) -> Result<i64> {
    decode_u64(oid, key, value).map(|v| v as i64)
}

fn decode_utf8(oid: &str, key: &str, value: &[u8]) -> Result<String> {
    std::str::from_utf8(value)
        .map(str::to_string)
        .map_err(|_| Error::corrupt(oid, format!("key {key:?}: invalid UTF-8")))
}

/// Byte cursor over one fragment blob.
struct Cursor<'a> {
    oid: &'a str,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(oid: &'a str, buf: &'a [u8]) -> Self {
        Self { oid, buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.buf.len());
        match end {
            Some(end) => {
                let slice = &self.buf[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(Error::corrupt(
                self.oid,
                format!("truncated blob: wanted {n} bytes at offset {}", self.pos),
            )),
        }
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(self.u64()? as i64)
    }

    fn string(&mut self) -> Result<String> {
        let len = u32::from_le_bytes(self.take(4)?.try_into().unwrap()) as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| Error::corrupt(self.oid, "invalid UTF-8 in string field"))
    }

    fn finish(&self) -> Result<()> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(Error::corrupt(
                self.oid,
                format!("{} trailing bytes after blob", self.buf.len() - self.pos),
            ))
        }
    }
}

/// Decode a parent-linkage blob.
pub fn decode_parent(oid: &str, blob: &[u8]) -> Result<Parent> {
    let mut c = Cursor::new(oid, blob);
    let version = c.u8()?;
    if version != PARENT_VERSION {
        return Err(Error::corrupt(
            oid,
            format!("unsupported parent blob version {version}"),
        ));
    }
    let parent = Parent {
        pool_id: c.i64()?,
        pool_namespace: c.string()?,
        image_id: c.string()?,
        snap_id: c.u64()?,
    };
    c.finish()?;
    Ok(parent)
}

/// Decode one snapshot-directory entry.
///
/// Two on-disk revisions exist; both canonicalize to the same shape. v1
/// predates per-snapshot flags and timestamps, which decode as zero.
pub fn decode_snapshot_entry(oid: &str, blob: &[u8]) -> Result<RawSnap> {
    let mut c = Cursor::new(oid, blob);
    let version = c.u8()?;
    let snap = match version {
        1 => RawSnap {
            id: c.u64()?,
            name: c.string()?,
            snap_type: c.u8()?,
            size: c.u64()?,
            flags: 0,
            protection: c.u8()?,
            timestamp: 0,
        },
        2 => RawSnap {
            id: c.u64()?,
            name: c.string()?,
            snap_type: c.u8()?,
            size: c.u64()?,
            flags: c.u64()?,
            protection: c.u8()?,
            timestamp: c.i64()?,
        },
        other => {
            return Err(Error::corrupt(
                oid,
                format!("unsupported snapshot entry version {other}"),
            ))
        }
    };
    c.finish()?;
    Ok(snap)
}
