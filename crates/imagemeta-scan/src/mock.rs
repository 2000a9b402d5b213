//! In-memory `PoolSession` for tests and embedding.
//!
//! `MemPool` stores objects, omaps, xattrs and watcher lists in maps and
//! counts the expensive read paths (object stats, object-map reads) so tests
//! can assert that a cheap scan really is cheap. `ImageBuilder` installs a
//! complete image fixture using the same fragment encodings the reader
//! decodes.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use imagemeta_common::{Error, Parent, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::reader::RawSnap;
use crate::session::{PoolSession, WatcherInfo};
use crate::usage::{OBJECT_MAP_MAGIC, OBJECT_MAP_VERSION};
use crate::{
    header_object, object_map_object, DIRECTORY_ID_PREFIX, DIRECTORY_NAME_PREFIX,
    DIRECTORY_OBJECT,
};

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// Encode a parent-linkage blob in the revision the reader understands.
#[must_use]
pub fn encode_parent(parent: &Parent) -> Vec<u8> {
    let mut buf = vec![1u8];
    buf.extend_from_slice(&parent.pool_id.to_le_bytes());
    put_string(&mut buf, &parent.pool_namespace);
    put_string(&mut buf, &parent.image_id);
    buf.extend_from_slice(&parent.snap_id.to_le_bytes());
    buf
}

/// Encode a snapshot-directory entry in the legacy v1 revision (no flags,
/// no timestamp).
#[must_use]
pub fn encode_snapshot_entry_v1(snap: &RawSnap) -> Vec<u8> {
    let mut buf = vec![1u8];
    buf.extend_from_slice(&snap.id.to_le_bytes());
    put_string(&mut buf, &snap.name);
    buf.push(snap.snap_type);
    buf.extend_from_slice(&snap.size.to_le_bytes());
    buf.push(snap.protection);
    buf
}

/// Encode a snapshot-directory entry in the current v2 revision.
#[must_use]
pub fn encode_snapshot_entry_v2(snap: &RawSnap) -> Vec<u8> {
    let mut buf = vec![2u8];
    buf.extend_from_slice(&snap.id.to_le_bytes());
    put_string(&mut buf, &snap.name);
    buf.push(snap.snap_type);
    buf.extend_from_slice(&snap.size.to_le_bytes());
    buf.extend_from_slice(&snap.flags.to_le_bytes());
    buf.push(snap.protection);
    buf.extend_from_slice(&snap.timestamp.to_le_bytes());
    buf
}

/// Pack per-object states (2 bits each, LSB first) into an object-map blob.
#[must_use]
pub fn encode_object_map(states: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(13 + states.len().div_ceil(4));
    buf.extend_from_slice(&OBJECT_MAP_MAGIC.to_le_bytes());
    buf.push(OBJECT_MAP_VERSION);
    buf.extend_from_slice(&(states.len() as u64).to_le_bytes());
    let mut byte = 0u8;
    for (i, state) in states.iter().enumerate() {
        byte |= (state & 0b11) << ((i % 4) * 2);
        if i % 4 == 3 {
            buf.push(byte);
            byte = 0;
        }
    }
    if states.len() % 4 != 0 {
        buf.push(byte);
    }
    buf
}

/// In-memory read-only pool.
pub struct MemPool {
    pool_id: i64,
    namespace: String,
    objects: RwLock<BTreeMap<String, Bytes>>,
    omaps: RwLock<BTreeMap<String, BTreeMap<String, Bytes>>>,
    xattrs: RwLock<BTreeMap<String, BTreeMap<String, Bytes>>>,
    watchers: RwLock<BTreeMap<String, Vec<WatcherInfo>>>,
    /// Stored size per (data object, optional snap id).
    data_sizes: RwLock<BTreeMap<(String, Option<u64>), u64>>,
    denied: RwLock<BTreeSet<String>>,
    unreachable: AtomicBool,
    stat_calls: AtomicU64,
    object_map_reads: AtomicU64,
}

impl MemPool {
    #[must_use]
    pub fn new(pool_id: i64, namespace: &str) -> Self {
        Self {
            pool_id,
            namespace: namespace.to_string(),
            objects: RwLock::new(BTreeMap::new()),
            omaps: RwLock::new(BTreeMap::new()),
            xattrs: RwLock::new(BTreeMap::new()),
            watchers: RwLock::new(BTreeMap::new()),
            data_sizes: RwLock::new(BTreeMap::new()),
            denied: RwLock::new(BTreeSet::new()),
            unreachable: AtomicBool::new(false),
            stat_calls: AtomicU64::new(0),
            object_map_reads: AtomicU64::new(0),
        }
    }

    /// Register an image in the directory without installing a header;
    /// models an image deleted between enumeration and its read.
    pub fn insert_directory_entry(&self, image_id: &str, name: &str) {
        let mut omaps = self.omaps.write();
        let dir = omaps.entry(DIRECTORY_OBJECT.to_string()).or_default();
        dir.insert(
            format!("{DIRECTORY_ID_PREFIX}{image_id}"),
            Bytes::from(name.as_bytes().to_vec()),
        );
        dir.insert(
            format!("{DIRECTORY_NAME_PREFIX}{name}"),
            Bytes::from(image_id.as_bytes().to_vec()),
        );
    }

    pub fn insert_omap_value(&self, oid: &str, key: &str, value: Bytes) {
        self.omaps
            .write()
            .entry(oid.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn put_object(&self, oid: &str, data: Bytes) {
        self.objects.write().insert(oid.to_string(), data);
    }

    pub fn set_xattr(&self, oid: &str, name: &str, value: Bytes) {
        self.xattrs
            .write()
            .entry(oid.to_string())
            .or_default()
            .insert(name.to_string(), value);
    }

    pub fn set_watchers(&self, oid: &str, watchers: Vec<WatcherInfo>) {
        self.watchers.write().insert(oid.to_string(), watchers);
    }

    /// Record a stored data object size, optionally as of a snapshot.
    pub fn put_data_size(&self, oid: &str, snap_id: Option<u64>, size: u64) {
        self.data_sizes
            .write()
            .insert((oid.to_string(), snap_id), size);
    }

    /// Drop an image's header object entirely.
    pub fn remove_header(&self, image_id: &str) {
        let oid = header_object(image_id);
        self.omaps.write().remove(&oid);
        self.xattrs.write().remove(&oid);
        self.watchers.write().remove(&oid);
    }

    /// Make reads of `oid` fail with permission denied.
    pub fn deny(&self, oid: &str) {
        self.denied.write().insert(oid.to_string());
    }

    /// Simulate the whole pool becoming unreachable.
    pub fn set_unreachable(&self, down: bool) {
        self.unreachable.store(down, Ordering::SeqCst);
    }

    /// Number of `stat_object` calls served so far.
    pub fn stat_calls(&self) -> u64 {
        self.stat_calls.load(Ordering::SeqCst)
    }

    /// Number of object-map blob reads served so far.
    pub fn object_map_reads(&self) -> u64 {
        self.object_map_reads.load(Ordering::SeqCst)
    }

    fn check(&self, oid: &str) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::Unreachable("mock pool down".into()));
        }
        if self.denied.read().contains(oid) {
            return Err(Error::PermissionDenied(oid.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PoolSession for MemPool {
    fn pool_id(&self) -> i64 {
        self.pool_id
    }

    fn pool_namespace(&self) -> &str {
        &self.namespace
    }

    async fn omap_list(
        &self,
        oid: &str,
        start_after: &str,
        max: usize,
    ) -> Result<Vec<(String, Bytes)>> {
        self.check(oid)?;
        let omaps = self.omaps.read();
        let entries = omaps
            .get(oid)
            .ok_or_else(|| Error::NotFound(oid.to_string()))?;
        Ok(entries
            .range::<str, _>((Excluded(start_after), Unbounded))
            .take(max)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn omap_get(&self, oid: &str, key: &str) -> Result<Option<Bytes>> {
        self.check(oid)?;
        let omaps = self.omaps.read();
        let entries = omaps
            .get(oid)
            .ok_or_else(|| Error::NotFound(oid.to_string()))?;
        Ok(entries.get(key).cloned())
    }

    async fn read_object(&self, oid: &str) -> Result<Option<Bytes>> {
        self.check(oid)?;
        if oid.starts_with("object_map.") {
            self.object_map_reads.fetch_add(1, Ordering::SeqCst);
        }
        Ok(self.objects.read().get(oid).cloned())
    }

    async fn get_xattr(&self, oid: &str, name: &str) -> Result<Option<Bytes>> {
        self.check(oid)?;
        Ok(self
            .xattrs
            .read()
            .get(oid)
            .and_then(|attrs| attrs.get(name).cloned()))
    }

    async fn stat_object(&self, oid: &str, snap_id: Option<u64>) -> Result<Option<u64>> {
        self.check(oid)?;
        self.stat_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .data_sizes
            .read()
            .get(&(oid.to_string(), snap_id))
            .copied())
    }

    async fn list_watchers(&self, oid: &str) -> Result<Vec<WatcherInfo>> {
        self.check(oid)?;
        Ok(self.watchers.read().get(oid).cloned().unwrap_or_default())
    }
}

/// One snapshot in an [`ImageBuilder`] fixture.
#[derive(Clone, Debug)]
pub struct SnapFixture {
    pub snap: RawSnap,
    /// Install with the legacy v1 entry encoding.
    pub v1_encoding: bool,
    /// Per-object states for this snapshot's object-map blob.
    pub object_map: Option<Vec<u8>>,
}

impl SnapFixture {
    #[must_use]
    pub fn new(id: u64, name: &str, size: u64) -> Self {
        Self {
            snap: RawSnap {
                id,
                name: name.to_string(),
                snap_type: 0,
                size,
                flags: 0,
                protection: 0,
                timestamp: Utc::now().timestamp(),
            },
            v1_encoding: false,
            object_map: None,
        }
    }

    #[must_use]
    pub fn protection(mut self, code: u8) -> Self {
        self.snap.protection = code;
        self
    }

    #[must_use]
    pub fn snap_type(mut self, code: u8) -> Self {
        self.snap.snap_type = code;
        self
    }

    #[must_use]
    pub fn v1(mut self) -> Self {
        self.v1_encoding = true;
        self.snap.flags = 0;
        self.snap.timestamp = 0;
        self
    }

    #[must_use]
    pub fn object_map(mut self, states: &[u8]) -> Self {
        self.object_map = Some(states.to_vec());
        self
    }
}

/// Builder installing a complete image fixture into a [`MemPool`].
#[derive(Clone, Debug)]
pub struct ImageBuilder {
    id: String,
    name: String,
    order: u8,
    size: u64,
    features: u64,
    op_features: u64,
    flags: u64,
    create_timestamp: i64,
    access_timestamp: i64,
    modify_timestamp: i64,
    data_pool_id: i64,
    parent: Option<Parent>,
    metas: BTreeMap<String, String>,
    watchers: Vec<String>,
    snaps: Vec<SnapFixture>,
    snap_seq: Option<u64>,
    head_object_map: Option<Vec<u8>>,
}

impl ImageBuilder {
    #[must_use]
    pub fn new(id: &str, name: &str) -> Self {
        let now = Utc::now().timestamp();
        Self {
            id: id.to_string(),
            name: name.to_string(),
            order: 22,
            size: 0,
            features: 0,
            op_features: 0,
            flags: 0,
            create_timestamp: now,
            access_timestamp: now,
            modify_timestamp: now,
            data_pool_id: -1,
            parent: None,
            metas: BTreeMap::new(),
            watchers: Vec::new(),
            snaps: Vec::new(),
            snap_seq: None,
            head_object_map: None,
        }
    }

    #[must_use]
    pub fn order(mut self, order: u8) -> Self {
        self.order = order;
        self
    }

    #[must_use]
    pub fn size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    #[must_use]
    pub fn features(mut self, features: u64) -> Self {
        self.features = features;
        self
    }

    #[must_use]
    pub fn op_features(mut self, op_features: u64) -> Self {
        self.op_features = op_features;
        self
    }

    #[must_use]
    pub fn flags(mut self, flags: u64) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn timestamps(mut self, create: i64, access: i64, modify: i64) -> Self {
        self.create_timestamp = create;
        self.access_timestamp = access;
        self.modify_timestamp = modify;
        self
    }

    #[must_use]
    pub fn data_pool_id(mut self, pool_id: i64) -> Self {
        self.data_pool_id = pool_id;
        self
    }

    #[must_use]
    pub fn parent(mut self, parent: Parent) -> Self {
        self.parent = Some(parent);
        self
    }

    #[must_use]
    pub fn meta(mut self, key: &str, value: &str) -> Self {
        self.metas.insert(key.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn watcher(mut self, addr: &str) -> Self {
        self.watchers.push(addr.to_string());
        self
    }

    #[must_use]
    pub fn snap(mut self, snap: SnapFixture) -> Self {
        self.snaps.push(snap);
        self
    }

    #[must_use]
    pub fn snap_seq(mut self, seq: u64) -> Self {
        self.snap_seq = Some(seq);
        self
    }

    #[must_use]
    pub fn head_object_map(mut self, states: &[u8]) -> Self {
        self.head_object_map = Some(states.to_vec());
        self
    }

    /// Write the fixture into the pool: directory entry, header omap,
    /// snap-seq xattr, watcher list and object-map blobs.
    pub fn install(self, pool: &MemPool) {
        pool.insert_directory_entry(&self.id, &self.name);
        let oid = header_object(&self.id);

        pool.insert_omap_value(&oid, "order", Bytes::from(vec![self.order]));
        pool.insert_omap_value(&oid, "size", le_u64(self.size));
        pool.insert_omap_value(&oid, "features", le_u64(self.features));
        pool.insert_omap_value(&oid, "op_features", le_u64(self.op_features));
        pool.insert_omap_value(&oid, "flags", le_u64(self.flags));
        pool.insert_omap_value(&oid, "create_timestamp", le_i64(self.create_timestamp));
        pool.insert_omap_value(&oid, "access_timestamp", le_i64(self.access_timestamp));
        pool.insert_omap_value(&oid, "modify_timestamp", le_i64(self.modify_timestamp));
        pool.insert_omap_value(&oid, "data_pool_id", le_i64(self.data_pool_id));
        pool.insert_omap_value(&oid, "name", Bytes::from(self.name.as_bytes().to_vec()));

        if let Some(parent) = &self.parent {
            pool.insert_omap_value(&oid, "parent", Bytes::from(encode_parent(parent)));
        }
        for (key, value) in &self.metas {
            pool.insert_omap_value(
                &oid,
                &format!("meta_{key}"),
                Bytes::from(value.as_bytes().to_vec()),
            );
        }
        for fixture in &self.snaps {
            let blob = if fixture.v1_encoding {
                encode_snapshot_entry_v1(&fixture.snap)
            } else {
                encode_snapshot_entry_v2(&fixture.snap)
            };
            pool.insert_omap_value(
                &oid,
                &format!("snapshot_{:016x}", fixture.snap.id),
                Bytes::from(blob),
            );
            if let Some(states) = &fixture.object_map {
                pool.put_object(
                    &object_map_object(&self.id, Some(fixture.snap.id)),
                    Bytes::from(encode_object_map(states)),
                );
            }
        }
        if let Some(seq) = self.snap_seq {
            pool.set_xattr(&oid, "snap_seq", le_u64(seq));
        }
        if !self.watchers.is_empty() {
            let watchers = self
                .watchers
                .iter()
                .enumerate()
                .map(|(i, addr)| WatcherInfo {
                    addr: addr.clone(),
                    cookie: i as u64 + 1,
                })
                .collect();
            pool.set_watchers(&oid, watchers);
        }
        if let Some(states) = &self.head_object_map {
            pool.put_object(
                &object_map_object(&self.id, None),
                Bytes::from(encode_object_map(states)),
            );
        }
    }
}

fn le_u64(v: u64) -> Bytes {
    Bytes::from(v.to_le_bytes().to_vec())
}

fn le_i64(v: i64) -> Bytes {
    Bytes::from(v.to_le_bytes().to_vec())
}
