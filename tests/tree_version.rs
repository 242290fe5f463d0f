//! End-to-end scenario 6 (spec §8): startup reconciliation rebuilds a side
//! whose manifest is stale or missing and merges the result into the Index.

use tierfs::index::Index;
use tierfs::path_resolver::PathResolver;
use tierfs::model::Location;
use tierfs::tree_version::{reconcile_pair, write_manifest};
use uuid::Uuid;

#[tokio::test]
async fn mismatched_local_manifest_triggers_rebuild_and_dirties_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let local_root = dir.path().join("local");
    let external_root = dir.path().join("external");
    tokio::fs::create_dir_all(&local_root).await.unwrap();
    tokio::fs::create_dir_all(&external_root).await.unwrap();

    tokio::fs::write(local_root.join("same.txt"), b"abc").await.unwrap();
    tokio::fs::write(external_root.join("same.txt"), b"abc").await.unwrap();
    tokio::fs::write(local_root.join("changed.txt"), b"new-local-bytes").await.unwrap();
    tokio::fs::write(external_root.join("changed.txt"), b"old-external-bytes").await.unwrap();

    let index = Index::load(dir.path().join("index.json")).await.unwrap();
    let resolver = PathResolver::new(&[]).unwrap();
    let pair = Uuid::new_v4();

    let outcome = reconcile_pair(&index, &resolver, pair, &local_root, Some(&external_root))
        .await
        .unwrap();

    assert!(outcome.rebuilt_local);
    assert!(outcome.rebuilt_external);

    let changed = index.get(pair, "changed.txt").unwrap();
    assert_eq!(changed.location, Location::Both);
    assert!(changed.is_dirty);
}

#[tokio::test]
async fn up_to_date_manifest_skips_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let local_root = dir.path().join("local");
    tokio::fs::create_dir_all(&local_root).await.unwrap();
    tokio::fs::write(local_root.join("a.txt"), b"hello").await.unwrap();

    let resolver = PathResolver::new(&[]).unwrap();
    let rows = tierfs::tree_version::scan_tree(&local_root, &resolver).await.unwrap();
    let manifest = write_manifest(&local_root, "local", &rows).await.unwrap();

    let index = Index::load(dir.path().join("index.json")).await.unwrap();
    let pair = Uuid::new_v4();
    // Pre-record the manifest's own tree_version, as a prior reconcile pass would.
    index.upsert(
        pair,
        &format!("{}/tree_version/local", tierfs::path_resolver::RESERVED_DIR),
        {
            let mut marker =
                tierfs::model::FileEntry::new_file("marker", Location::Deleted, 0);
            marker.checksum = Some(manifest.tree_version.clone());
            marker
        },
    );

    let outcome = reconcile_pair(&index, &resolver, pair, &local_root, None).await.unwrap();
    assert!(!outcome.rebuilt_local);

    // A new file lands, and something rescans and rewrites `db.json` with a
    // fresh tree_version (e.g. another process sharing the store) without
    // our Index ever having recorded that version: the next reconcile must
    // notice the drift and rescan itself.
    tokio::fs::write(local_root.join("b.txt"), b"second file").await.unwrap();
    let rows2 = tierfs::tree_version::scan_tree(&local_root, &resolver).await.unwrap();
    write_manifest(&local_root, "local", &rows2).await.unwrap();

    let outcome2 = reconcile_pair(&index, &resolver, pair, &local_root, None).await.unwrap();
    assert!(outcome2.rebuilt_local);
    assert!(index.get(pair, "b.txt").is_some());
}
