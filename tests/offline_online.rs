//! End-to-end scenario 4 (spec §8): a write while EXTERNAL is disconnected
//! stays pending until the disk reappears and the scheduler retries.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::RwLock;
use uuid::Uuid;

use tierfs::activity::ActivityLog;
use tierfs::config::SyncConfig;
use tierfs::index::Index;
use tierfs::lock_manager::LockManager;
use tierfs::merge_view::MergeView;
use tierfs::model::{Direction, Location, SyncPair};
use tierfs::sync_scheduler::{PairRoots, SyncScheduler};
use tierfs::write_router::WriteRouter;

/// Roots whose EXTERNAL half can be flipped online mid-test, modelling a
/// disk that connects after the service already started.
struct TogglableRoots {
    local: PathBuf,
    external: PathBuf,
    online: tokio::sync::RwLock<bool>,
}

#[async_trait]
impl PairRoots for TogglableRoots {
    async fn roots(&self, _pair: &SyncPair) -> Option<(PathBuf, Option<PathBuf>)> {
        let online = *self.online.read().await;
        Some((self.local.clone(), online.then(|| self.external.clone())))
    }
}

#[tokio::test]
async fn external_offline_then_online_retries_automatically() {
    let tempdir = TempDir::new().unwrap();
    let local_root = tempdir.path().join("local");
    let external_root = tempdir.path().join("external");
    tokio::fs::create_dir_all(&local_root).await.unwrap();
    tokio::fs::create_dir_all(&external_root).await.unwrap();

    let index = Index::load(tempdir.path().join("index.json")).await.unwrap();
    let locks = LockManager::new();
    let merge_view = Arc::new(MergeView::new(index.clone()));
    let activity = Arc::new(ActivityLog::new());

    let pair = SyncPair {
        id: Uuid::new_v4(),
        disk_id: Uuid::new_v4(),
        local_path: tempdir.path().join("mount"),
        external_relative_path: PathBuf::from("."),
        direction: Direction::Bidi,
        exclude_patterns: Vec::new(),
        max_local_cache_bytes: u64::MAX,
        target_free_bytes: 0,
        auto_evict: false,
    };

    let roots = Arc::new(TogglableRoots {
        local: local_root.clone(),
        external: external_root.clone(),
        online: tokio::sync::RwLock::new(false),
    });

    let (dirty_tx, dirty_rx) = async_channel::unbounded();
    let write_router = WriteRouter::new(index.clone(), locks.clone(), merge_view.clone(), dirty_tx);

    let sync_config = Arc::new(RwLock::new(SyncConfig::default()));
    let scheduler = SyncScheduler::new(
        index.clone(),
        locks.clone(),
        merge_view.clone(),
        activity.clone(),
        roots.clone(),
        sync_config,
        dirty_rx,
    );
    scheduler.spawn(vec![pair.clone()]);

    write_router
        .create(pair.id, "d.txt", &local_root.join("d.txt"))
        .await
        .unwrap();
    write_router
        .write(pair.id, "d.txt", &local_root.join("d.txt"), 0, b"offline-write")
        .await
        .unwrap();

    let entry = index.get(pair.id, "d.txt").unwrap();
    assert_eq!(entry.location, Location::LocalOnly);
    assert!(entry.is_dirty);

    // `ExternalOffline` is in the recoverable set (spec §7), so the
    // scheduler would retry with backoff rather than surface an error;
    // the entry simply stays dirty and pending until the disk reappears.
    *roots.online.write().await = true;
    scheduler.sync_now(pair.id).await.unwrap();

    let entry = index.get(pair.id, "d.txt").unwrap();
    assert_eq!(entry.location, Location::Both);
    assert!(!entry.is_dirty);
    assert_eq!(tokio::fs::read(external_root.join("d.txt")).await.unwrap(), b"offline-write");
}
