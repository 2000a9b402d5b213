//! Record assembly: raw fragments to one canonical `ImageInfo`.
//!
//! The assembler owns the semantic rules: snapshot ordering by ascending id,
//! closed-enum canonicalization with explicit `Unknown` sentinels, parent
//! normalization (absent means "not a clone"), the snap-seq consistency
//! cross-check, and reverse child lineage when the caller paid for it.

use imagemeta_common::{
    Child, Error, ImageInfo, Parent, ProtectionStatus, Result, SnapInfo, SnapType,
};
use std::collections::{BTreeMap, BTreeSet};

use crate::header_object;
use crate::reader::RawImage;

/// Pool-wide reverse-lineage index: parent (image id, snap id) to the set of
/// images cloned from that snapshot. Built once per scan, only under
/// `InfoFilter::CHILDREN_V1`, because populating it costs a header read for
/// every image in the pool.
#[derive(Debug, Default)]
pub struct ParentIndex {
    children: BTreeMap<(String, u64), BTreeSet<Child>>,
}

impl ParentIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `child_image_id` (living in `child_pool`/`child_ns`) was
    /// cloned from `parent`. Only parents in the scanned pool and namespace
    /// are indexed; a cross-pool parent cannot be a local snapshot.
    pub fn insert(
        &mut self,
        parent: &Parent,
        child_image_id: &str,
        child_pool: i64,
        child_ns: &str,
        local_pool: i64,
        local_ns: &str,
    ) {
        if parent.pool_id != local_pool || parent.pool_namespace != local_ns {
            return;
        }
        self.children
            .entry((parent.image_id.clone(), parent.snap_id))
            .or_default()
            .insert(Child {
                pool_id: child_pool,
                pool_namespace: child_ns.to_string(),
                image_id: child_image_id.to_string(),
            });
    }

    /// Children cloned from the given snapshot; empty when none are known.
    #[must_use]
    pub fn children_of(&self, image_id: &str, snap_id: u64) -> BTreeSet<Child> {
        self.children
            .get(&(image_id.to_string(), snap_id))
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

/// Merge raw fragments into one validated record.
///
/// `name` is the directory-supplied image name; the header's own name field
/// is a fallback for callers that only know the id. `parent_index` is
/// `Some` only when reverse lineage was requested; without it every
/// snapshot's `children` stays empty. Usage fields start out `None` and are
/// filled by the usage calculator afterwards.
pub fn assemble(
    raw: &RawImage,
    name: &str,
    parent_index: Option<&ParentIndex>,
) -> Result<ImageInfo> {
    let oid = header_object(&raw.id);

    let mut snaps = BTreeMap::new();
    for snap in &raw.snaps {
        if let Some(seq) = raw.snap_seq {
            if snap.id > seq {
                return Err(Error::corrupt(
                    &oid,
                    format!("snapshot id {} exceeds snap_seq {seq}", snap.id),
                ));
            }
        }
        let children = match parent_index {
            Some(index) => index.children_of(&raw.id, snap.id),
            None => BTreeSet::new(),
        };
        let previous = snaps.insert(
            snap.id,
            SnapInfo {
                id: snap.id,
                name: snap.name.clone(),
                snap_type: SnapType::from_code(snap.snap_type),
                size: snap.size,
                flags: snap.flags,
                protection_status: ProtectionStatus::from_code(snap.protection),
                timestamp: snap.timestamp,
                children,
                du: None,
                dirty: None,
            },
        );
        if previous.is_some() {
            return Err(Error::corrupt(
                &oid,
                format!("duplicate snapshot id {}", snap.id),
            ));
        }
    }

    let name = if name.is_empty() {
        raw.header_name.clone().unwrap_or_default()
    } else {
        name.to_string()
    };

    Ok(ImageInfo {
        id: raw.id.clone(),
        name,
        order: raw.order,
        size: raw.size,
        features: raw.features,
        op_features: raw.op_features,
        flags: raw.flags,
        snaps,
        parent: raw.parent.clone(),
        create_timestamp: raw.create_timestamp,
        access_timestamp: raw.access_timestamp,
        modify_timestamp: raw.modify_timestamp,
        data_pool_id: raw.data_pool_id,
        watchers: raw.watchers.clone(),
        metas: raw.metas.clone(),
        du: None,
        dirty: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::RawSnap;

    fn raw_image() -> RawImage {
        RawImage {
            id: "img1".into(),
            order: 22,
            size: 1 << 30,
            features: 0,
            data_pool_id: -1,
            snaps: vec![
                RawSnap {
                    id: 9,
                    name: "later".into(),
                    snap_type: 0,
                    size: 1 << 30,
                    flags: 0,
                    protection: 0,
                    timestamp: 200,
                },
                RawSnap {
                    id: 3,
                    name: "earlier".into(),
                    snap_type: 0,
                    size: 1 << 29,
                    flags: 0,
                    protection: 2,
                    timestamp: 100,
                },
            ],
            ..RawImage::default()
        }
    }

    #[test]
    fn test_snapshots_ordered_by_ascending_id() {
        let info = assemble(&raw_image(), "disk", None).unwrap();
        let ids: Vec<u64> = info.snaps.keys().copied().collect();
        assert_eq!(ids, vec![3, 9]);
        assert_eq!(info.snaps[&3].name, "earlier");
        assert_eq!(info.snaps[&3].protection_status, ProtectionStatus::Protected);
    }

    #[test]
    fn test_no_parent_is_none() {
        let info = assemble(&raw_image(), "disk", None).unwrap();
        assert_eq!(info.parent, None);
    }

    #[test]
    fn test_unknown_codes_become_sentinels() {
        let mut raw = raw_image();
        raw.snaps[0].snap_type = 77;
        raw.snaps[0].protection = 99;
        let info = assemble(&raw, "disk", None).unwrap();
        let snap = &info.snaps[&9];
        assert_eq!(snap.snap_type, SnapType::Unknown);
        assert_eq!(snap.protection_status, ProtectionStatus::Unknown);
    }

    #[test]
    fn test_snap_seq_violation_is_corrupt() {
        let mut raw = raw_image();
        raw.snap_seq = Some(5);
        let err = assemble(&raw, "disk", None).unwrap_err();
        assert!(matches!(err, Error::CorruptMetadata { .. }));
    }

    #[test]
    fn test_snap_seq_consistent_passes() {
        let mut raw = raw_image();
        raw.snap_seq = Some(9);
        assert!(assemble(&raw, "disk", None).is_ok());
    }

    #[test]
    fn test_duplicate_snapshot_id_is_corrupt() {
        let mut raw = raw_image();
        raw.snaps[1].id = 9;
        let err = assemble(&raw, "disk", None).unwrap_err();
        assert!(matches!(err, Error::CorruptMetadata { .. }));
    }

    #[test]
    fn test_children_resolved_from_index() {
        let mut index = ParentIndex::new();
        let parent = Parent {
            pool_id: 1,
            pool_namespace: String::new(),
            image_id: "img1".into(),
            snap_id: 3,
        };
        index.insert(&parent, "clone1", 1, "", 1, "");
        // parent in a different pool must not be indexed locally
        let foreign = Parent {
            pool_id: 8,
            pool_namespace: String::new(),
            image_id: "img1".into(),
            snap_id: 9,
        };
        index.insert(&foreign, "clone2", 1, "", 1, "");

        let info = assemble(&raw_image(), "disk", Some(&index)).unwrap();
        assert_eq!(info.snaps[&3].children.len(), 1);
        assert_eq!(
            info.snaps[&3].children.iter().next().unwrap().image_id,
            "clone1"
        );
        assert!(info.snaps[&9].children.is_empty());
    }

    #[test]
    fn test_header_name_fallback() {
        let mut raw = raw_image();
        raw.header_name = Some("from-header".into());
        let info = assemble(&raw, "", None).unwrap();
        assert_eq!(info.name, "from-header");
        let info = assemble(&raw, "from-directory", None).unwrap();
        assert_eq!(info.name, "from-directory");
    }
}
