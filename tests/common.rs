//! Shared fixture wiring the routers and scheduler together against real
//! temp directories, mirroring the component wiring `Service` performs.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::RwLock;
use uuid::Uuid;

use tierfs::activity::ActivityLog;
use tierfs::config::{EvictionConfig, SyncConfig};
use tierfs::eviction::{EvictionEngine, LocalRoots};
use tierfs::index::Index;
use tierfs::lock_manager::LockManager;
use tierfs::merge_view::MergeView;
use tierfs::model::{Direction, SyncPair};
use tierfs::read_router::ReadRouter;
use tierfs::sync_scheduler::{PairRoots, SyncScheduler};
use tierfs::write_router::WriteRouter;

/// Resolves every pair to the fixture's single local/external root pair,
/// standing in for the control plane's live mount table in tests.
struct FixedRoots {
    local: PathBuf,
    external: Option<PathBuf>,
}

#[async_trait]
impl PairRoots for FixedRoots {
    async fn roots(&self, _pair: &SyncPair) -> Option<(PathBuf, Option<PathBuf>)> {
        Some((self.local.clone(), self.external.clone()))
    }
}

#[async_trait]
impl LocalRoots for FixedRoots {
    async fn local_root(&self, _pair: &SyncPair) -> Option<PathBuf> {
        Some(self.local.clone())
    }
}

pub struct Fixture {
    pub _tempdir: TempDir,
    pub local_root: PathBuf,
    pub external_root: PathBuf,
    pub pair: SyncPair,
    pub index: Arc<Index>,
    pub locks: Arc<LockManager>,
    pub merge_view: Arc<MergeView>,
    pub activity: Arc<ActivityLog>,
    pub read_router: Arc<ReadRouter>,
    pub write_router: Arc<WriteRouter>,
    pub scheduler: Arc<SyncScheduler>,
    pub eviction: Arc<EvictionEngine>,
    pub dirty_rx: async_channel::Receiver<Uuid>,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_external(true).await
    }

    /// `external_online = false` models scenario 4 (offline then online):
    /// the pair's EXTERNAL root resolves to `None` until [`Self::bring_external_online`].
    pub async fn with_external(external_online: bool) -> Self {
        let tempdir = TempDir::new().expect("create temp dir");
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

        let roots = Arc::new(FixedRoots {
            local: local_root.clone(),
            external: if external_online { Some(external_root.clone()) } else { None },
        });

        let (dirty_tx, dirty_rx) = async_channel::unbounded();
        let read_router = Arc::new(ReadRouter::new(index.clone()));
        let write_router = Arc::new(WriteRouter::new(index.clone(), locks.clone(), merge_view.clone(), dirty_tx));

        let sync_config = Arc::new(RwLock::new(SyncConfig::default()));
        let scheduler = SyncScheduler::new(
            index.clone(),
            locks.clone(),
            merge_view.clone(),
            activity.clone(),
            roots.clone(),
            sync_config,
            dirty_rx.clone(),
        );
        scheduler.spawn(vec![pair.clone()]);

        let eviction_config = Arc::new(RwLock::new(EvictionConfig::default()));
        let eviction = EvictionEngine::new(
            index.clone(),
            locks.clone(),
            merge_view.clone(),
            activity.clone(),
            roots,
            eviction_config,
        );
        eviction.spawn(vec![pair.clone()]);

        Fixture {
            _tempdir: tempdir,
            local_root,
            external_root,
            pair,
            index,
            locks,
            merge_view,
            activity,
            read_router,
            write_router,
            scheduler,
            eviction,
            dirty_rx,
        }
    }

    pub fn local_path(&self, rel: &str) -> PathBuf {
        self.local_root.join(rel)
    }

    pub fn external_path(&self, rel: &str) -> PathBuf {
        self.external_root.join(rel)
    }
}
