//! End-to-end scenario 3 (spec §8): conflict detected during reconcile,
//! resolved under the default `LocalWinsWithBackup` policy.

mod common;

use tierfs::model::Location;

#[tokio::test]
async fn local_wins_with_backup_renames_external_aside() {
    let fx = common::Fixture::new().await;
    let pair = fx.pair.id;

    fx.write_router
        .create(pair, "c.bin", &fx.local_path("c.bin"))
        .await
        .unwrap();
    fx.write_router
        .write(pair, "c.bin", &fx.local_path("c.bin"), 0, b"local-edit")
        .await
        .unwrap();
    fx.scheduler.sync_now(pair).await.unwrap();
    assert_eq!(fx.index.get(pair, "c.bin").unwrap().location, Location::Both);

    // User edits LOCAL again (dirty)...
    fx.write_router
        .write(pair, "c.bin", &fx.local_path("c.bin"), 0, b"local-edit-2")
        .await
        .unwrap();

    // ...while EXTERNAL is modified out of band, advancing its mtime past
    // what the Index recorded for the prior sync.
    tokio::fs::write(fx.external_path("c.bin"), b"external-edit").await.unwrap();
    let future = std::time::SystemTime::now() + std::time::Duration::from_secs(3600);
    filetime::set_file_mtime(fx.external_path("c.bin"), filetime::FileTime::from_system_time(future)).unwrap();

    fx.scheduler.sync_now(pair).await.unwrap();

    let entry = fx.index.get(pair, "c.bin").unwrap();
    assert_eq!(entry.location, Location::Both);
    assert!(!entry.is_dirty);

    let landed = tokio::fs::read(fx.external_path("c.bin")).await.unwrap();
    assert_eq!(landed, b"local-edit-2");

    let mut dir = tokio::fs::read_dir(&fx.external_root).await.unwrap();
    let mut saw_backup = false;
    while let Some(entry) = dir.next_entry().await.unwrap() {
        if entry.file_name().to_string_lossy().contains("c.bin_backup_") {
            saw_backup = true;
        }
    }
    assert!(saw_backup, "expected the out-of-band external copy to be backed up");
}
