//! Integration tests for the SQLite update database.

mod common;

use common::{SCOPE, TestMetadata, asset, body, manifest};
use std::collections::{BTreeMap, HashSet};
use time::OffsetDateTime;
use updraft_core::{AssetStatus, LaunchOutcome, UpdateId, UpdateStatus};
use updraft_metadata::{DIAGNOSTICS_KEY, MANIFEST_FILTERS_KEY, MetadataError};

fn no_json() -> BTreeMap<String, String> {
    BTreeMap::new()
}

#[tokio::test]
async fn test_update_becomes_ready_with_last_verified_asset() {
    let metadata = TestMetadata::new().await.expect("Failed to create metadata");
    let store = metadata.store();

    let a = asset("main.bundle", b"bundle");
    let b = asset("logo.png", b"logo");
    let m = manifest(0, vec![a.clone(), b.clone()]);

    let inserted = store
        .insert_pending_update(SCOPE, &m, &body(&m), &no_json())
        .await
        .expect("Insert failed");
    assert!(inserted.inserted);
    assert_eq!(inserted.status, UpdateStatus::Pending);

    let became_ready = store.mark_asset_verified(m.id, &a.hash).await.unwrap();
    assert!(!became_ready);
    let update = store.get_update(m.id).await.unwrap().unwrap();
    assert_eq!(update.status, UpdateStatus::Pending);

    let became_ready = store.mark_asset_verified(m.id, &b.hash).await.unwrap();
    assert!(became_ready);
    let update = store.get_update(m.id).await.unwrap().unwrap();
    assert_eq!(update.status, UpdateStatus::Ready);

    let assets = store.assets_for_update(m.id).await.unwrap();
    assert_eq!(assets.len(), 2);
    assert!(
        assets
            .iter()
            .all(|a| a.download_status == AssetStatus::Verified)
    );
}

#[tokio::test]
async fn test_mark_verified_unknown_link_is_not_found() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let m = manifest(0, vec![asset("a", b"a")]);
    store
        .insert_pending_update(SCOPE, &m, &body(&m), &no_json())
        .await
        .unwrap();

    let stranger = asset("b", b"b").hash;
    let err = store.mark_asset_verified(m.id, &stranger).await.unwrap_err();
    assert!(matches!(err, MetadataError::NotFound(_)));
}

#[tokio::test]
async fn test_duplicate_insert_is_graceful() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let m = manifest(0, vec![asset("a", b"a")]);
    let first = store
        .insert_pending_update(SCOPE, &m, &body(&m), &no_json())
        .await
        .unwrap();
    let second = store
        .insert_pending_update(SCOPE, &m, &body(&m), &no_json())
        .await
        .unwrap();

    assert!(first.inserted);
    assert!(!second.inserted);
    assert_eq!(second.status, UpdateStatus::Pending);
    assert_eq!(store.updates_for_scope(SCOPE).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_inserts_of_same_manifest() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();
    let m = manifest(0, vec![asset("a", b"a"), asset("b", b"b")]);

    let (s1, s2) = (store.clone(), store.clone());
    let (m1, m2) = (m.clone(), m.clone());
    let (r1, r2) = tokio::join!(
        tokio::spawn(async move {
            s1.insert_pending_update(SCOPE, &m1, &body(&m1), &BTreeMap::new())
                .await
        }),
        tokio::spawn(async move {
            s2.insert_pending_update(SCOPE, &m2, &body(&m2), &BTreeMap::new())
                .await
        }),
    );
    let r1 = r1.unwrap().unwrap();
    let r2 = r2.unwrap().unwrap();

    assert!(r1.inserted ^ r2.inserted, "exactly one writer inserts");
    assert_eq!(store.assets_for_update(m.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_insert_with_all_assets_verified_is_ready() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let shared = asset("main.bundle", b"shared bundle");
    let first = manifest(0, vec![shared.clone()]);
    store
        .insert_pending_update(SCOPE, &first, &body(&first), &no_json())
        .await
        .unwrap();
    store.mark_asset_verified(first.id, &shared.hash).await.unwrap();

    // Same bytes under a different key in a newer update
    let mut renamed = shared.clone();
    renamed.key = "index.bundle".to_string();
    let second = manifest(10, vec![renamed]);
    let inserted = store
        .insert_pending_update(SCOPE, &second, &body(&second), &no_json())
        .await
        .unwrap();

    assert_eq!(inserted.status, UpdateStatus::Ready);
    assert_eq!(
        store.asset_status(&shared.hash).await.unwrap(),
        Some(AssetStatus::Verified)
    );
}

#[tokio::test]
async fn test_same_id_in_other_scope_is_rejected() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let m = manifest(0, vec![asset("a", b"a")]);
    store
        .insert_pending_update(SCOPE, &m, &body(&m), &no_json())
        .await
        .unwrap();
    let err = store
        .insert_pending_update("other-scope", &m, &body(&m), &no_json())
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::AlreadyExists(_)));
}

#[tokio::test]
async fn test_updates_for_scope_newest_first() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let old = manifest(0, vec![asset("a", b"a")]);
    let new = manifest(100, vec![asset("a", b"a")]);
    // Sub-second precision must still sort after the whole second
    let mut newer = manifest(100, vec![asset("a", b"a")]);
    newer.commit_time += time::Duration::milliseconds(500);
    let other_scope = manifest(200, vec![asset("a", b"a")]);

    for m in [&old, &newer, &new] {
        store
            .insert_pending_update(SCOPE, m, &body(m), &no_json())
            .await
            .unwrap();
    }
    store
        .insert_pending_update("elsewhere", &other_scope, &body(&other_scope), &no_json())
        .await
        .unwrap();

    let ids: Vec<UpdateId> = store
        .updates_for_scope(SCOPE)
        .await
        .unwrap()
        .into_iter()
        .map(|u| u.id)
        .collect();
    assert_eq!(ids, vec![newer.id, new.id, old.id]);
}

#[tokio::test]
async fn test_updates_with_equal_commit_time_tie_break_by_id() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let a = manifest(5, vec![asset("a", b"a")]);
    let b = manifest(5, vec![asset("a", b"a")]);
    for m in [&a, &b] {
        store
            .insert_pending_update(SCOPE, m, &body(m), &no_json())
            .await
            .unwrap();
    }

    let ids: Vec<UpdateId> = store
        .updates_for_scope(SCOPE)
        .await
        .unwrap()
        .into_iter()
        .map(|u| u.id)
        .collect();
    let mut expected = vec![a.id, b.id];
    expected.sort();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn test_delete_refuses_kept_update_and_mutates_nothing() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let kept = manifest(0, vec![asset("a", b"a")]);
    let loose = manifest(10, vec![asset("b", b"b")]);
    for m in [&kept, &loose] {
        store
            .insert_pending_update(SCOPE, m, &body(m), &no_json())
            .await
            .unwrap();
    }
    store.set_keep_flag(kept.id, true).await.unwrap();

    let err = store
        .delete_updates(&HashSet::from([kept.id, loose.id]))
        .await
        .unwrap_err();
    match err {
        MetadataError::ProtectedUpdate { ids } => assert_eq!(ids, vec![kept.id]),
        other => panic!("expected ProtectedUpdate, got {other:?}"),
    }

    // Neither row was deleted
    assert_eq!(store.updates_for_scope(SCOPE).await.unwrap().len(), 2);
    assert!(!store.assets_for_update(loose.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_refuses_embedded_update() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let embedded = manifest(0, vec![asset("a", b"a")]);
    store
        .install_embedded_update(SCOPE, &embedded, &body(&embedded))
        .await
        .unwrap();

    let err = store
        .delete_updates(&HashSet::from([embedded.id]))
        .await
        .unwrap_err();
    assert!(err.is_protected());
    assert!(store.get_update(embedded.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_delete_drops_orphan_assets_and_keeps_shared() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let shared = asset("shared", b"shared");
    let only_old = asset("old-only", b"old only");
    let old = manifest(0, vec![shared.clone(), only_old.clone()]);
    let new = manifest(10, vec![shared.clone()]);
    for m in [&old, &new] {
        store
            .insert_pending_update(SCOPE, m, &body(m), &no_json())
            .await
            .unwrap();
    }
    store.begin_launch(old.id).await.unwrap();

    let deleted = store.delete_updates(&HashSet::from([old.id])).await.unwrap();
    assert_eq!(deleted, 1);

    let live = store.live_asset_hashes().await.unwrap();
    assert_eq!(live, HashSet::from([shared.hash]));
    assert_eq!(store.asset_status(&only_old.hash).await.unwrap(), None);
    assert_eq!(
        store.asset_status(&shared.hash).await.unwrap(),
        Some(AssetStatus::Pending)
    );

    // Launch records cascade with their update
    let launches: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM launch_records")
        .fetch_one(metadata.pool())
        .await
        .unwrap();
    assert_eq!(launches, 0);
}

#[tokio::test]
async fn test_delete_unknown_ids_is_noop() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    assert_eq!(store.delete_updates(&HashSet::new()).await.unwrap(), 0);
    assert_eq!(
        store
            .delete_updates(&HashSet::from([UpdateId::new()]))
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_launch_outcome_counters() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let m = manifest(0, vec![asset("a", b"a")]);
    store
        .insert_pending_update(SCOPE, &m, &body(&m), &no_json())
        .await
        .unwrap();

    let u = store.increment_launch_outcome(m.id, false).await.unwrap();
    assert_eq!((u.failed_launch_count, u.consecutive_failure_count), (1, 1));
    let u = store.increment_launch_outcome(m.id, false).await.unwrap();
    assert_eq!((u.failed_launch_count, u.consecutive_failure_count), (2, 2));

    let u = store.increment_launch_outcome(m.id, true).await.unwrap();
    assert_eq!(u.successful_launch_count, 1);
    assert_eq!(u.failed_launch_count, 2);
    assert_eq!(u.consecutive_failure_count, 0);

    let err = store
        .increment_launch_outcome(UpdateId::new(), true)
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::NotFound(_)));
}

#[tokio::test]
async fn test_launch_record_lifecycle() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let m = manifest(0, vec![asset("a", b"a")]);
    store
        .insert_pending_update(SCOPE, &m, &body(&m), &no_json())
        .await
        .unwrap();

    let first = store.begin_launch(m.id).await.unwrap();
    let second = store.begin_launch(m.id).await.unwrap();
    assert_eq!(first.outcome, LaunchOutcome::InProgress);

    let interrupted = store.interrupted_launches().await.unwrap();
    assert_eq!(interrupted.len(), 2);

    let (record, update) = store
        .finish_launch(first.id, LaunchOutcome::Crashed)
        .await
        .unwrap();
    assert_eq!(record.outcome, LaunchOutcome::Crashed);
    assert!(record.finished_at.is_some());
    assert_eq!(update.failed_launch_count, 1);

    // Finishing twice is a state error and counts nothing
    let err = store
        .finish_launch(first.id, LaunchOutcome::Succeeded)
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::InvalidStateTransition { .. }));
    let update = store.get_update(m.id).await.unwrap().unwrap();
    assert_eq!(update.successful_launch_count, 0);

    let interrupted = store.interrupted_launches().await.unwrap();
    assert_eq!(interrupted.len(), 1);
    assert_eq!(interrupted[0].id, second.id);

    let history = store.launches_for_update(m.id, 10).await.unwrap();
    assert_eq!(history.len(), 2);

    let err = store.begin_launch(UpdateId::new()).await.unwrap_err();
    assert!(matches!(err, MetadataError::NotFound(_)));
}

#[tokio::test]
async fn test_embedded_install_is_idempotent_and_demotes_previous() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let v1 = manifest(0, vec![asset("main.bundle", b"v1")]);
    assert!(
        store
            .install_embedded_update(SCOPE, &v1, &body(&v1))
            .await
            .unwrap()
    );
    assert!(
        !store
            .install_embedded_update(SCOPE, &v1, &body(&v1))
            .await
            .unwrap()
    );

    let u = store.get_update(v1.id).await.unwrap().unwrap();
    assert_eq!(u.status, UpdateStatus::Embedded);

    // A new host binary ships a new embedded update
    let v2 = manifest(10, vec![asset("main.bundle", b"v2")]);
    assert!(
        store
            .install_embedded_update(SCOPE, &v2, &body(&v2))
            .await
            .unwrap()
    );

    let updates = store.updates_for_scope(SCOPE).await.unwrap();
    let embedded: Vec<_> = updates.iter().filter(|u| u.is_embedded()).collect();
    assert_eq!(embedded.len(), 1);
    assert_eq!(embedded[0].id, v2.id);

    let demoted = store.get_update(v1.id).await.unwrap().unwrap();
    assert_eq!(demoted.status, UpdateStatus::Ready);
}

#[tokio::test]
async fn test_embedded_install_promotes_pending_sharing_assets() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let shared = asset("main.bundle", b"same bytes");
    let remote = manifest(0, vec![shared.clone()]);
    store
        .insert_pending_update(SCOPE, &remote, &body(&remote), &no_json())
        .await
        .unwrap();

    let embedded = manifest(5, vec![shared.clone()]);
    store
        .install_embedded_update(SCOPE, &embedded, &body(&embedded))
        .await
        .unwrap();

    let u = store.get_update(remote.id).await.unwrap().unwrap();
    assert_eq!(u.status, UpdateStatus::Ready);
}

#[tokio::test]
async fn test_mark_missing_assets_demotes_ready_updates() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let a = asset("a", b"a");
    let m = manifest(0, vec![a.clone()]);
    store
        .insert_pending_update(SCOPE, &m, &body(&m), &no_json())
        .await
        .unwrap();
    store.mark_asset_verified(m.id, &a.hash).await.unwrap();

    let demoted = store.mark_missing_assets(&[a.hash]).await.unwrap();
    assert_eq!(demoted, vec![m.id]);

    let u = store.get_update(m.id).await.unwrap().unwrap();
    assert_eq!(u.status, UpdateStatus::Pending);
    assert_eq!(
        store.asset_status(&a.hash).await.unwrap(),
        Some(AssetStatus::Pending)
    );
}

#[tokio::test]
async fn test_set_asset_status_keeps_readiness_consistent() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let a = asset("a", b"a");
    let m = manifest(0, vec![a.clone()]);
    store
        .insert_pending_update(SCOPE, &m, &body(&m), &no_json())
        .await
        .unwrap();

    store
        .set_asset_status(&a.hash, AssetStatus::Verified)
        .await
        .unwrap();
    assert_eq!(
        store.get_update(m.id).await.unwrap().unwrap().status,
        UpdateStatus::Ready
    );

    store
        .set_asset_status(&a.hash, AssetStatus::Failed)
        .await
        .unwrap();
    assert_eq!(
        store.get_update(m.id).await.unwrap().unwrap().status,
        UpdateStatus::Pending
    );
}

#[tokio::test]
async fn test_mark_launched_moves_marker_and_leaves_keep_alone() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let a = manifest(0, vec![asset("a", b"a")]);
    let b = manifest(10, vec![asset("b", b"b")]);
    let c = manifest(20, vec![asset("c", b"c")]);
    for m in [&a, &b, &c] {
        store
            .insert_pending_update(SCOPE, m, &body(m), &no_json())
            .await
            .unwrap();
    }
    store.set_keep_flag(a.id, true).await.unwrap();

    store.mark_launched(SCOPE, b.id).await.unwrap();
    store.mark_launched(SCOPE, c.id).await.unwrap();

    let a = store.get_update(a.id).await.unwrap().unwrap();
    let b = store.get_update(b.id).await.unwrap().unwrap();
    let c = store.get_update(c.id).await.unwrap().unwrap();
    assert!(a.keep);
    assert!(!a.launched);
    assert!(!b.launched);
    assert!(!b.keep);
    assert!(c.launched);
    assert!(!c.keep);

    let err = store.mark_launched("other-scope", a.id).await.unwrap_err();
    assert!(matches!(err, MetadataError::NotFound(_)));
}

#[tokio::test]
async fn test_delete_refuses_launched_update() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let m = manifest(0, vec![asset("a", b"a")]);
    store
        .insert_pending_update(SCOPE, &m, &body(&m), &no_json())
        .await
        .unwrap();
    store.mark_launched(SCOPE, m.id).await.unwrap();

    let err = store
        .delete_updates(&HashSet::from([m.id]))
        .await
        .unwrap_err();
    assert!(err.is_protected());
    assert!(store.get_update(m.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_mark_update_accessed() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let m = manifest(0, vec![asset("a", b"a")]);
    store
        .insert_pending_update(SCOPE, &m, &body(&m), &no_json())
        .await
        .unwrap();
    let before = store.get_update(m.id).await.unwrap().unwrap().last_accessed;

    store.mark_update_accessed(m.id).await.unwrap();
    let after = store.get_update(m.id).await.unwrap().unwrap().last_accessed;
    assert!(after >= before);
    assert!(after <= OffsetDateTime::now_utc());
}

#[tokio::test]
async fn test_recent_failed_updates() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let old = manifest(0, vec![asset("a", b"a")]);
    let mid = manifest(10, vec![asset("a", b"a")]);
    let new = manifest(20, vec![asset("a", b"a")]);
    for m in [&old, &mid, &new] {
        store
            .insert_pending_update(SCOPE, m, &body(m), &no_json())
            .await
            .unwrap();
    }
    store.increment_launch_outcome(old.id, false).await.unwrap();
    store.increment_launch_outcome(new.id, false).await.unwrap();
    store.increment_launch_outcome(mid.id, true).await.unwrap();

    let failed = store
        .recent_update_ids_with_failed_launch(SCOPE, 5)
        .await
        .unwrap();
    assert_eq!(failed, vec![new.id, old.id]);

    let limited = store
        .recent_update_ids_with_failed_launch(SCOPE, 1)
        .await
        .unwrap();
    assert_eq!(limited, vec![new.id]);
}

#[tokio::test]
async fn test_json_data_persisted_with_insert() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    let m = manifest(0, vec![asset("a", b"a")]);
    let json = BTreeMap::from([(
        MANIFEST_FILTERS_KEY.to_string(),
        r#"{"branch":"beta"}"#.to_string(),
    )]);
    store
        .insert_pending_update(SCOPE, &m, &body(&m), &json)
        .await
        .unwrap();

    assert_eq!(
        store
            .get_json_data(SCOPE, MANIFEST_FILTERS_KEY)
            .await
            .unwrap()
            .as_deref(),
        Some(r#"{"branch":"beta"}"#)
    );
    assert_eq!(
        store
            .get_json_data("other", MANIFEST_FILTERS_KEY)
            .await
            .unwrap(),
        None
    );

    store
        .set_json_data(SCOPE, MANIFEST_FILTERS_KEY, "{}")
        .await
        .unwrap();
    assert_eq!(
        store
            .get_json_data(SCOPE, MANIFEST_FILTERS_KEY)
            .await
            .unwrap()
            .as_deref(),
        Some("{}")
    );

    assert!(
        store
            .delete_json_data(SCOPE, MANIFEST_FILTERS_KEY)
            .await
            .unwrap()
    );
    assert!(
        !store
            .delete_json_data(SCOPE, MANIFEST_FILTERS_KEY)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_json_list_append_and_take_once() {
    let metadata = TestMetadata::new().await.unwrap();
    let store = metadata.store();

    assert_eq!(
        store
            .append_json_list(SCOPE, DIAGNOSTICS_KEY, r#"{"code":"a"}"#, 2)
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        store
            .append_json_list(SCOPE, DIAGNOSTICS_KEY, r#"{"code":"b"}"#, 2)
            .await
            .unwrap(),
        2
    );
    assert!(
        store
            .append_json_list(SCOPE, DIAGNOSTICS_KEY, "not json", 2)
            .await
            .is_err()
    );
    // Oldest entry dropped once the cap is reached.
    assert_eq!(
        store
            .append_json_list(SCOPE, DIAGNOSTICS_KEY, r#"{"code":"c"}"#, 2)
            .await
            .unwrap(),
        2
    );

    let taken = store
        .take_json_data(SCOPE, DIAGNOSTICS_KEY)
        .await
        .unwrap()
        .unwrap();
    let items: serde_json::Value = serde_json::from_str(&taken).unwrap();
    assert_eq!(items.as_array().unwrap().len(), 2);
    assert_eq!(items[0]["code"], "b");
    assert_eq!(items[1]["code"], "c");

    assert_eq!(
        store.take_json_data(SCOPE, DIAGNOSTICS_KEY).await.unwrap(),
        None
    );
}
