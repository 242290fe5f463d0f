//! End-to-end scenario 1 (spec §8): simple write-back from an empty LOCAL
//! cache to an online EXTERNAL store.

mod common;

use tierfs::model::{ActivityKind, Location};

#[tokio::test]
async fn create_write_close_then_sync_lands_on_external() {
    let fx = common::Fixture::new().await;

    fx.write_router
        .create(fx.pair.id, "a/b.txt", &fx.local_path("a/b.txt"))
        .await
        .unwrap();
    fx.write_router
        .write(fx.pair.id, "a/b.txt", &fx.local_path("a/b.txt"), 0, b"hello")
        .await
        .unwrap();

    fx.scheduler.sync_now(fx.pair.id).await.unwrap();

    let entry = fx.index.get(fx.pair.id, "a/b.txt").unwrap();
    assert_eq!(entry.location, Location::Both);
    assert!(!entry.is_dirty);

    let external_bytes = tokio::fs::read(fx.external_path("a/b.txt")).await.unwrap();
    assert_eq!(external_bytes, b"hello");

    let recent = fx.activity.recent(1);
    assert_eq!(recent[0].kind, ActivityKind::SyncCompleted);
    assert_eq!(recent[0].files_count, Some(1));
    assert_eq!(recent[0].bytes_count, Some(5));
}

#[tokio::test]
async fn sync_now_on_clean_pair_is_a_no_op() {
    let fx = common::Fixture::new().await;
    fx.write_router
        .create(fx.pair.id, "clean.txt", &fx.local_path("clean.txt"))
        .await
        .unwrap();
    fx.scheduler.sync_now(fx.pair.id).await.unwrap();
    assert!(fx.index.dirty_for_pair(fx.pair.id).is_empty());

    // A second pass over an already-clean pair transfers nothing and
    // doesn't error.
    fx.scheduler.sync_now(fx.pair.id).await.unwrap();
    assert!(fx.index.dirty_for_pair(fx.pair.id).is_empty());
}
