//! End-to-end scan behavior against the in-memory pool.

use imagemeta_common::{
    InfoFilter, Parent, ProtectionStatus, ScanConfig, ScanStatus, SnapType, FEATURE_FAST_DIFF,
    FEATURE_LAYERING, FEATURE_OBJECT_MAP,
};
use imagemeta_scan::mock::{ImageBuilder, MemPool, SnapFixture};
use imagemeta_scan::{data_object, header_object, Scanner};
use std::collections::BTreeMap;
use tokio::sync::watch;

const OBJ_NONEXISTENT: u8 = 0;
const OBJ_EXISTS: u8 = 1;
const OBJ_EXISTS_CLEAN: u8 = 3;

fn scanner() -> Scanner {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Scanner::new(ScanConfig::default())
}

#[tokio::test]
async fn scan_assembles_full_records() {
    let pool = MemPool::new(4, "tenant-a");
    ImageBuilder::new("a1", "disk1")
        .order(22)
        .size(1 << 30)
        .features(FEATURE_LAYERING)
        .timestamps(100, 200, 300)
        .data_pool_id(9)
        .meta("owner", "qa")
        .watcher("client.4821")
        .snap(SnapFixture::new(3, "before-upgrade", 1 << 29).protection(2))
        .snap(SnapFixture::new(7, "nightly", 1 << 30).snap_type(2))
        .snap_seq(7)
        .install(&pool);

    let out = scanner()
        .list_info(&pool, None, InfoFilter::NONE, None)
        .await
        .unwrap();
    assert_eq!(out.len(), 1);
    let (info, status) = &out["a1"];
    assert_eq!(*status, ScanStatus::Ok);
    let info = info.as_ref().unwrap();

    assert_eq!(info.id, "a1");
    assert_eq!(info.name, "disk1");
    assert_eq!(info.order, 22);
    assert_eq!(info.size, 1 << 30);
    assert_eq!(info.features, FEATURE_LAYERING);
    assert_eq!(info.data_pool_id, 9);
    assert_eq!(info.create_timestamp, 100);
    assert_eq!(info.access_timestamp, 200);
    assert_eq!(info.modify_timestamp, 300);
    assert_eq!(info.parent, None);
    assert_eq!(info.watchers, vec!["client.4821".to_string()]);
    assert_eq!(info.metas["owner"], "qa");

    let ids: Vec<u64> = info.snaps.keys().copied().collect();
    assert_eq!(ids, vec![3, 7]);
    assert_eq!(
        info.snaps[&3].protection_status,
        ProtectionStatus::Protected
    );
    assert_eq!(info.snaps[&7].snap_type, SnapType::Trash);
    // usage not requested: omitted, not zero
    assert_eq!(info.du, None);
    assert_eq!(info.snaps[&3].du, None);
}

#[tokio::test]
async fn one_corrupt_header_does_not_block_the_rest() {
    let pool = MemPool::new(1, "");
    for i in 0..5 {
        ImageBuilder::new(&format!("img{i}"), &format!("disk{i}"))
            .size(1 << 20)
            .install(&pool);
    }
    // wrong width for a required scalar
    pool.insert_omap_value(
        &header_object("img2"),
        "order",
        bytes::Bytes::from_static(&[1, 2]),
    );

    let out = scanner()
        .list_info(&pool, None, InfoFilter::NONE, None)
        .await
        .unwrap();
    assert_eq!(out.len(), 5);
    assert_eq!(out["img2"].1, ScanStatus::CorruptMetadata);
    assert!(out["img2"].0.is_none());
    for i in [0, 1, 3, 4] {
        let (info, status) = &out[&format!("img{i}")];
        assert_eq!(*status, ScanStatus::Ok);
        assert!(info.is_some());
    }
}

#[tokio::test]
async fn absurd_object_order_is_corrupt_not_fatal() {
    let pool = MemPool::new(1, "");
    ImageBuilder::new("a1", "disk1").size(4096).install(&pool);
    // an order this large would overflow every size computation downstream
    ImageBuilder::new("a2", "disk2")
        .order(70)
        .size(4096)
        .features(FEATURE_OBJECT_MAP | FEATURE_FAST_DIFF)
        .head_object_map(&[OBJ_EXISTS])
        .install(&pool);

    let out = scanner()
        .list_info(
            &pool,
            None,
            InfoFilter::IMAGE_DU | InfoFilter::SNAP_DU,
            None,
        )
        .await
        .unwrap();
    assert_eq!(out["a1"].1, ScanStatus::Ok);
    assert_eq!(out["a2"].1, ScanStatus::CorruptMetadata);
    assert!(out["a2"].0.is_none());
    assert_eq!(pool.object_map_reads(), 0);
}

#[tokio::test]
async fn image_deleted_after_enumeration_reports_not_found() {
    let pool = MemPool::new(1, "");
    ImageBuilder::new("a1", "disk1").size(4096).install(&pool);
    // directory knows a2 but its header is already gone
    pool.insert_directory_entry("a2", "disk2");

    let out = scanner()
        .list_info(&pool, None, InfoFilter::NONE, None)
        .await
        .unwrap();
    assert_eq!(out.len(), 2);
    assert_eq!(out["a1"].1, ScanStatus::Ok);
    assert_eq!(out["a2"].1, ScanStatus::NotFound);
    assert!(out["a2"].0.is_none());
}

#[tokio::test]
async fn default_filter_issues_no_usage_reads() {
    let pool = MemPool::new(1, "");
    ImageBuilder::new("a1", "disk1")
        .order(12)
        .size(8192)
        .features(FEATURE_OBJECT_MAP | FEATURE_FAST_DIFF)
        .head_object_map(&[OBJ_EXISTS, OBJ_EXISTS])
        .snap(SnapFixture::new(1, "s1", 8192).object_map(&[OBJ_EXISTS, OBJ_EXISTS]))
        .install(&pool);

    let out = scanner()
        .list_info(&pool, None, InfoFilter::NONE, None)
        .await
        .unwrap();
    let info = out["a1"].0.as_ref().unwrap();
    assert_eq!(info.du, None);
    assert!(info.snaps[&1].children.is_empty());
    assert_eq!(pool.stat_calls(), 0);
    assert_eq!(pool.object_map_reads(), 0);
}

#[tokio::test]
async fn fast_diff_usage_with_trailing_partial_object() {
    let pool = MemPool::new(1, "");
    let size = 2 * 4096 + 100;
    ImageBuilder::new("a1", "disk1")
        .order(12)
        .size(size)
        .features(FEATURE_OBJECT_MAP | FEATURE_FAST_DIFF)
        .head_object_map(&[OBJ_EXISTS, OBJ_EXISTS_CLEAN, OBJ_EXISTS])
        .snap(
            SnapFixture::new(2, "s1", 4096 + 50)
                .object_map(&[OBJ_EXISTS_CLEAN, OBJ_EXISTS]),
        )
        .install(&pool);

    let out = scanner()
        .list_info(
            &pool,
            None,
            InfoFilter::IMAGE_DU | InfoFilter::SNAP_DU,
            None,
        )
        .await
        .unwrap();
    let (info, status) = &out["a1"];
    assert_eq!(*status, ScanStatus::Ok);
    let info = info.as_ref().unwrap();

    // final object carries only the 100-byte remainder
    assert_eq!(info.du, Some(4096 + 4096 + 100));
    assert_eq!(info.dirty, Some(4096 + 100));

    let snap = &info.snaps[&2];
    assert_eq!(snap.du, Some(4096 + 50));
    assert_eq!(snap.dirty, Some(50));

    // fast path never stats objects
    assert_eq!(pool.stat_calls(), 0);
}

#[tokio::test]
async fn object_map_without_fast_diff_reports_dirty_equal_du() {
    let pool = MemPool::new(1, "");
    ImageBuilder::new("a1", "disk1")
        .order(12)
        .size(2 * 4096)
        .features(FEATURE_OBJECT_MAP)
        .head_object_map(&[OBJ_EXISTS_CLEAN, OBJ_NONEXISTENT])
        .snap(SnapFixture::new(1, "s1", 2 * 4096).object_map(&[OBJ_EXISTS_CLEAN, OBJ_EXISTS]))
        .install(&pool);

    let out = scanner()
        .list_info(
            &pool,
            None,
            InfoFilter::IMAGE_DU | InfoFilter::SNAP_DU,
            None,
        )
        .await
        .unwrap();
    let info = out["a1"].0.as_ref().unwrap();
    assert_eq!(info.du, Some(4096));
    assert_eq!(info.dirty, info.du);
    let snap = &info.snaps[&1];
    assert_eq!(snap.du, Some(2 * 4096));
    assert_eq!(snap.dirty, snap.du);
}

#[tokio::test]
async fn slow_path_stats_objects_and_dirty_equals_du() {
    let pool = MemPool::new(1, "");
    ImageBuilder::new("a1", "disk1")
        .order(12)
        .size(3 * 4096)
        .snap(SnapFixture::new(5, "s1", 3 * 4096))
        .install(&pool);
    pool.put_data_size(&data_object("a1", 0), None, 4096);
    pool.put_data_size(&data_object("a1", 2), None, 2048);
    pool.put_data_size(&data_object("a1", 0), Some(5), 4096);

    let out = scanner()
        .list_info(
            &pool,
            None,
            InfoFilter::IMAGE_DU | InfoFilter::SNAP_DU,
            None,
        )
        .await
        .unwrap();
    let (info, status) = &out["a1"];
    assert_eq!(*status, ScanStatus::Ok);
    let info = info.as_ref().unwrap();

    assert_eq!(info.du, Some(4096 + 2048));
    assert_eq!(info.dirty, info.du);
    let snap = &info.snaps[&5];
    assert_eq!(snap.du, Some(4096));
    assert_eq!(snap.dirty, snap.du);

    // head + snapshot pass: 3 objects each
    assert_eq!(pool.stat_calls(), 6);
    assert_eq!(pool.object_map_reads(), 0);
}

#[tokio::test]
async fn corrupt_bitmap_degrades_to_incomplete_with_record() {
    let pool = MemPool::new(1, "");
    ImageBuilder::new("a1", "disk1")
        .order(12)
        .size(2 * 4096)
        .features(FEATURE_OBJECT_MAP | FEATURE_FAST_DIFF)
        .snap(SnapFixture::new(1, "good", 2 * 4096).object_map(&[OBJ_EXISTS, OBJ_EXISTS]))
        // bitmap claims one entry, geometry implies two
        .snap(SnapFixture::new(2, "stale", 2 * 4096).object_map(&[OBJ_EXISTS]))
        .install(&pool);

    let out = scanner()
        .list_info(&pool, None, InfoFilter::SNAP_DU, None)
        .await
        .unwrap();
    let (info, status) = &out["a1"];
    assert_eq!(*status, ScanStatus::Incomplete);
    let info = info.as_ref().unwrap();
    assert_eq!(info.snaps[&1].du, Some(2 * 4096));
    assert_eq!(info.snaps[&2].du, None);
    assert_eq!(info.snaps[&2].dirty, None);
}

#[tokio::test]
async fn children_resolved_only_when_requested() {
    let pool = MemPool::new(4, "");
    ImageBuilder::new("base", "golden")
        .size(1 << 20)
        .features(FEATURE_LAYERING)
        .snap(SnapFixture::new(11, "template", 1 << 20).protection(2))
        .install(&pool);
    ImageBuilder::new("clone1", "vm-1")
        .size(1 << 20)
        .parent(Parent {
            pool_id: 4,
            pool_namespace: String::new(),
            image_id: "base".into(),
            snap_id: 11,
        })
        .install(&pool);

    let cheap = scanner()
        .list_info(&pool, None, InfoFilter::NONE, None)
        .await
        .unwrap();
    assert!(cheap["base"].0.as_ref().unwrap().snaps[&11]
        .children
        .is_empty());

    let out = scanner()
        .list_info(&pool, None, InfoFilter::CHILDREN_V1, None)
        .await
        .unwrap();
    let base = out["base"].0.as_ref().unwrap();
    let children = &base.snaps[&11].children;
    assert_eq!(children.len(), 1);
    let child = children.iter().next().unwrap();
    assert_eq!(child.image_id, "clone1");
    assert_eq!(child.pool_id, 4);

    let clone = out["clone1"].0.as_ref().unwrap();
    assert_eq!(clone.parent.as_ref().unwrap().image_id, "base");
    assert_eq!(clone.parent.as_ref().unwrap().snap_id, 11);
}

#[tokio::test]
async fn dangling_parent_is_emitted_not_fatal() {
    let pool = MemPool::new(1, "");
    ImageBuilder::new("orphan", "vm-9")
        .size(4096)
        .parent(Parent {
            pool_id: 1,
            pool_namespace: String::new(),
            image_id: "deleted-base".into(),
            snap_id: 3,
        })
        .install(&pool);

    let out = scanner()
        .list_info(&pool, None, InfoFilter::NONE, None)
        .await
        .unwrap();
    let (info, status) = &out["orphan"];
    assert_eq!(*status, ScanStatus::Ok);
    assert_eq!(
        info.as_ref().unwrap().parent.as_ref().unwrap().image_id,
        "deleted-base"
    );
}

#[tokio::test]
async fn single_image_query_matches_bulk_scan() {
    let pool = MemPool::new(1, "");
    ImageBuilder::new("a1", "disk1")
        .order(12)
        .size(4096)
        .timestamps(10, 20, 30)
        .features(FEATURE_OBJECT_MAP | FEATURE_FAST_DIFF)
        .head_object_map(&[OBJ_EXISTS])
        .snap(SnapFixture::new(1, "s1", 4096).object_map(&[OBJ_EXISTS_CLEAN]))
        .install(&pool);

    let filter = InfoFilter::IMAGE_DU | InfoFilter::SNAP_DU;
    let bulk = scanner()
        .list_info(&pool, None, filter, None)
        .await
        .unwrap();
    let (single, status) = scanner()
        .get_info(&pool, "a1", "disk1", filter)
        .await
        .unwrap();
    assert_eq!(status, ScanStatus::Ok);
    assert_eq!(single.as_ref(), bulk["a1"].0.as_ref());
}

#[tokio::test]
async fn repeated_scans_are_identical() {
    let pool = MemPool::new(1, "");
    ImageBuilder::new("a1", "disk1")
        .size(1 << 20)
        .timestamps(10, 20, 30)
        .snap(SnapFixture::new(1, "s1", 1 << 20).v1())
        .install(&pool);

    let first = scanner()
        .list_info(&pool, None, InfoFilter::NONE, None)
        .await
        .unwrap();
    let second = scanner()
        .list_info(&pool, None, InfoFilter::NONE, None)
        .await
        .unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn explicit_image_set_skips_enumeration() {
    let pool = MemPool::new(1, "");
    ImageBuilder::new("a1", "disk1").size(4096).install(&pool);
    ImageBuilder::new("a2", "disk2").size(4096).install(&pool);

    let mut wanted = BTreeMap::new();
    wanted.insert("a2".to_string(), "disk2".to_string());
    wanted.insert("ghost".to_string(), "gone".to_string());

    let out = scanner()
        .list_info(&pool, Some(wanted), InfoFilter::NONE, None)
        .await
        .unwrap();
    assert_eq!(out.len(), 2);
    assert!(!out.contains_key("a1"));
    assert_eq!(out["a2"].1, ScanStatus::Ok);
    assert_eq!(out["ghost"].1, ScanStatus::NotFound);
}

#[tokio::test]
async fn v1_snapshot_encoding_is_canonicalized() {
    let pool = MemPool::new(1, "");
    ImageBuilder::new("a1", "disk1")
        .size(4096)
        .snap(SnapFixture::new(2, "old", 4096).protection(1).v1())
        .install(&pool);

    let out = scanner()
        .list_info(&pool, None, InfoFilter::NONE, None)
        .await
        .unwrap();
    let snap = &out["a1"].0.as_ref().unwrap().snaps[&2];
    assert_eq!(snap.flags, 0);
    assert_eq!(snap.timestamp, 0);
    assert_eq!(snap.protection_status, ProtectionStatus::Unprotecting);
}

#[tokio::test]
async fn snap_seq_violation_is_corrupt_metadata() {
    let pool = MemPool::new(1, "");
    ImageBuilder::new("a1", "disk1")
        .size(4096)
        .snap(SnapFixture::new(9, "s", 4096))
        .snap_seq(5)
        .install(&pool);

    let out = scanner()
        .list_info(&pool, None, InfoFilter::NONE, None)
        .await
        .unwrap();
    assert_eq!(out["a1"].1, ScanStatus::CorruptMetadata);
    assert!(out["a1"].0.is_none());
}

#[tokio::test]
async fn denied_header_is_per_image_permission_failure() {
    let pool = MemPool::new(1, "");
    ImageBuilder::new("a1", "disk1").size(4096).install(&pool);
    ImageBuilder::new("a2", "disk2").size(4096).install(&pool);
    pool.deny(&header_object("a2"));

    let out = scanner()
        .list_info(&pool, None, InfoFilter::NONE, None)
        .await
        .unwrap();
    assert_eq!(out["a1"].1, ScanStatus::Ok);
    assert_eq!(out["a2"].1, ScanStatus::PermissionDenied);
}

#[tokio::test]
async fn unreachable_pool_aborts_whole_call() {
    let pool = MemPool::new(1, "");
    ImageBuilder::new("a1", "disk1").size(4096).install(&pool);
    pool.set_unreachable(true);

    let err = scanner()
        .list_info(&pool, None, InfoFilter::NONE, None)
        .await
        .unwrap_err();
    assert!(err.is_session_fault());
}

#[tokio::test]
async fn pre_cancelled_scan_issues_no_work() {
    let pool = MemPool::new(1, "");
    ImageBuilder::new("a1", "disk1")
        .size(4096)
        .features(FEATURE_OBJECT_MAP | FEATURE_FAST_DIFF)
        .head_object_map(&[OBJ_EXISTS])
        .install(&pool);

    let (tx, rx) = watch::channel(true);
    let err = scanner()
        .list_info(
            &pool,
            None,
            InfoFilter::IMAGE_DU | InfoFilter::SNAP_DU,
            Some(rx),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, imagemeta_common::Error::Cancelled));
    assert_eq!(pool.stat_calls(), 0);
    assert_eq!(pool.object_map_reads(), 0);
    drop(tx);
}

#[tokio::test]
async fn records_serialize_with_stable_field_names() {
    let pool = MemPool::new(1, "");
    ImageBuilder::new("a1", "disk1")
        .size(4096)
        .timestamps(10, 20, 30)
        .snap(SnapFixture::new(3, "s1", 4096).protection(2))
        .install(&pool);

    let out = scanner()
        .list_info(&pool, None, InfoFilter::NONE, None)
        .await
        .unwrap();
    let value = serde_json::to_value(out["a1"].0.as_ref().unwrap()).unwrap();
    assert_eq!(value["id"], "a1");
    assert_eq!(value["name"], "disk1");
    assert_eq!(value["snaps"]["3"]["protection_status"], "protected");
    assert_eq!(value["snaps"]["3"]["snap_type"], "user");
    assert!(value["parent"].is_null());
    assert!(value["du"].is_null());
}

#[tokio::test]
async fn empty_pool_scan_succeeds_with_empty_output() {
    let pool = MemPool::new(1, "");
    let out = scanner()
        .list_info(&pool, None, InfoFilter::NONE, None)
        .await
        .unwrap();
    assert!(out.is_empty());
}
