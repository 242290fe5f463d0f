//! Reclaims LOCAL disk space by deleting clean, unlocked cache copies
//! whose bytes remain safe in EXTERNAL (spec §4.9).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::activity::ActivityLog;
use crate::config::EvictionConfig;
use crate::error::ServiceError;
use crate::index::Index;
use crate::lock_manager::LockManager;
use crate::merge_view::MergeView;
use crate::model::{ActivityKind, Location, LockDirection, SyncPair};

/// Resolves a pair's LOCAL root, mirroring [`crate::sync_scheduler::PairRoots`]
/// but scoped to what eviction actually needs.
#[async_trait::async_trait]
pub trait LocalRoots: Send + Sync {
    async fn local_root(&self, pair: &SyncPair) -> Option<PathBuf>;
}

pub struct EvictionEngine {
    index: Arc<Index>,
    locks: Arc<LockManager>,
    merge_view: Arc<MergeView>,
    activity: Arc<ActivityLog>,
    roots: Arc<dyn LocalRoots>,
    config: Arc<RwLock<EvictionConfig>>,
    pairs: dashmap::DashMap<Uuid, SyncPair>,
}

impl EvictionEngine {
    pub fn new(
        index: Arc<Index>,
        locks: Arc<LockManager>,
        merge_view: Arc<MergeView>,
        activity: Arc<ActivityLog>,
        roots: Arc<dyn LocalRoots>,
        config: Arc<RwLock<EvictionConfig>>,
    ) -> Arc<Self> {
        Arc::new(EvictionEngine {
            index,
            locks,
            merge_view,
            activity,
            roots,
            config,
            pairs: dashmap::DashMap::new(),
        })
    }

    /// Spawns the periodic trigger (`check_interval`, default 5min) in
    /// addition to the low-free-space and explicit-request triggers, which
    /// callers invoke directly via [`Self::evict_now`] (spec §4.9).
    pub fn spawn(self: &Arc<Self>, pairs: Vec<SyncPair>) {
        for pair in pairs {
            self.pairs.insert(pair.id, pair);
        }

        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                let interval = engine.config.read().await.check_interval;
                tokio::time::sleep(interval).await;
                if !engine.config.read().await.auto_enabled {
                    continue;
                }
                let pairs: Vec<Uuid> = engine.pairs.iter().map(|r| *r.key()).collect();
                for pair in pairs {
                    if let Err(e) = engine.check_and_evict(pair).await {
                        warn!(pair = %pair, error = %e, "periodic eviction check failed");
                    }
                }
            }
        });
    }

    /// Checks the pair's LOCAL usage against `trigger_threshold` and runs
    /// an eviction pass only if it's exceeded (spec §4.9).
    async fn check_and_evict(self: &Arc<Self>, pair: Uuid) -> Result<(), ServiceError> {
        let Some(sync_pair) = self.pairs.get(&pair).map(|r| r.clone()) else {
            return Ok(());
        };
        let Some(local_root) = self.roots.local_root(&sync_pair).await else {
            return Ok(());
        };

        let used = directory_size(&local_root).await;
        let config = self.config.read().await.clone();
        if used <= config.trigger_threshold {
            return Ok(());
        }

        let requested = used.saturating_sub(config.target_free_space.min(used));
        self.evict_now(pair, requested).await
    }

    /// Explicit eviction request from the ControlPlane or the low-space
    /// trigger: frees up to `requested_bytes`, returning
    /// [`ServiceError::EvictionFailed`] on a partial run (spec §4.9).
    pub async fn evict_now(self: &Arc<Self>, pair: Uuid, requested_bytes: u64) -> Result<(), ServiceError> {
        let config = self.config.read().await.clone();
        let candidates = self.index.evictable_for_pair(pair, config.strategy);

        let mut freed = 0u64;
        let mut evicted_count = 0usize;

        for entry in candidates {
            if freed >= requested_bytes || evicted_count >= config.max_files_per_run {
                break;
            }
            if entry
                .modified_at
                .elapsed()
                .map(|age| age < config.min_file_age)
                .unwrap_or(false)
            {
                continue;
            }

            let guard = match self.locks.try_acquire(pair, &entry.virtual_path, LockDirection::LocalToExternal) {
                Ok(g) => g,
                Err(_) => continue,
            };

            let Some(sync_pair) = self.pairs.get(&pair).map(|r| r.clone()) else {
                drop(guard);
                break;
            };
            let Some(local_root) = self.roots.local_root(&sync_pair).await else {
                drop(guard);
                break;
            };
            let local_abs = local_root.join(&entry.virtual_path);

            match tokio::fs::remove_file(&local_abs).await {
                Ok(()) => {
                    self.index.mutate(pair, &entry.virtual_path, |e| {
                        e.location = Location::ExternalOnly;
                    });
                    self.merge_view.invalidate(pair, &entry.virtual_path);
                    freed += entry.size.max(0) as u64;
                    evicted_count += 1;
                }
                Err(e) => warn!(path = %entry.virtual_path, error = %e, "eviction: remove_file failed, skipping"),
            }
            drop(guard);
        }

        info!(pair = %pair, freed, requested_bytes, evicted_count, "eviction pass complete");

        if freed >= requested_bytes || evicted_count == 0 {
            self.activity.record(
                ActivityKind::EvictionCompleted,
                format!("Freed {freed} bytes for pair {pair}"),
                None,
                Some(pair),
                None,
                Some(evicted_count as u64),
                Some(freed),
            );
        }

        if freed < requested_bytes {
            self.activity.record(
                ActivityKind::EvictionFailed,
                format!("Eviction for {pair} fell short of target"),
                Some(format!("freed {freed} of {requested_bytes} requested")),
                Some(pair),
                None,
                Some(evicted_count as u64),
                Some(freed),
            );
            return Err(ServiceError::EvictionFailed {
                freed_bytes: freed,
                requested_bytes,
            });
        }
        Ok(())
    }

    /// Evicts exactly one named file, the bulk [`Self::evict_now`] pass
    /// narrowed to a single candidate (spec §4.11 `evict_file`). Returns the
    /// bytes freed.
    pub async fn evict_path(self: &Arc<Self>, pair: Uuid, path: &str) -> Result<u64, ServiceError> {
        let entry = self
            .index
            .get(pair, path)
            .ok_or_else(|| ServiceError::FileNotFound(path.to_string()))?;
        if !entry.evictable() {
            return Err(ServiceError::LockFailure(path.to_string()));
        }

        let guard = self.locks.try_acquire(pair, path, LockDirection::LocalToExternal)?;

        let sync_pair = self
            .pairs
            .get(&pair)
            .map(|r| r.clone())
            .ok_or_else(|| ServiceError::FileNotFound(pair.to_string()))?;
        let local_root = self
            .roots
            .local_root(&sync_pair)
            .await
            .ok_or(ServiceError::ExternalOffline)?;
        let local_abs = local_root.join(path);

        let result = tokio::fs::remove_file(&local_abs).await;
        drop(guard);
        result.map_err(|e| ServiceError::Internal(e.to_string()))?;

        self.index.mutate(pair, path, |e| {
            e.location = Location::ExternalOnly;
        });
        self.merge_view.invalidate(pair, path);

        let freed = entry.size.max(0) as u64;
        self.activity.record(
            ActivityKind::EvictionCompleted,
            format!("Evicted {path} for pair {pair}"),
            None,
            Some(pair),
            None,
            Some(1),
            Some(freed),
        );
        Ok(freed)
    }
}

async fn directory_size(root: &std::path::Path) -> u64 {
    let mut total = 0u64;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(mut read_dir) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(child)) = read_dir.next_entry().await {
            let Ok(meta) = child.metadata().await else {
                continue;
            };
            if meta.is_dir() {
                stack.push(child.path());
            } else {
                total += meta.len();
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Direction, FileEntry};
    use std::time::SystemTime;

    struct FixedRoot(PathBuf);

    #[async_trait::async_trait]
    impl LocalRoots for FixedRoot {
        async fn local_root(&self, _pair: &SyncPair) -> Option<PathBuf> {
            Some(self.0.clone())
        }
    }

    fn test_pair(id: Uuid, local_path: PathBuf) -> SyncPair {
        SyncPair {
            id,
            disk_id: Uuid::new_v4(),
            local_path,
            external_relative_path: PathBuf::from("external"),
            direction: Direction::Bidi,
            exclude_patterns: Vec::new(),
            max_local_cache_bytes: 1024,
            target_free_bytes: 0,
            auto_evict: true,
        }
    }

    #[tokio::test]
    async fn evicts_oldest_accessed_first_until_target_met() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::load(dir.path().join("index.json")).await.unwrap();
        let locks = LockManager::new();
        let merge_view = Arc::new(MergeView::new(index.clone()));
        let activity = Arc::new(ActivityLog::new());
        let pair = Uuid::new_v4();

        tokio::fs::write(dir.path().join("old.bin"), vec![0u8; 10]).await.unwrap();
        tokio::fs::write(dir.path().join("new.bin"), vec![0u8; 10]).await.unwrap();

        let mut old = FileEntry::new_file("old.bin", Location::Both, 10);
        old.accessed_at = SystemTime::UNIX_EPOCH;
        index.upsert(pair, "old.bin", old);

        let mut new = FileEntry::new_file("new.bin", Location::Both, 10);
        new.accessed_at = SystemTime::now();
        index.upsert(pair, "new.bin", new);

        let roots = Arc::new(FixedRoot(dir.path().to_path_buf()));
        let config = Arc::new(RwLock::new(EvictionConfig {
            min_file_age: Duration::from_secs(0),
            ..EvictionConfig::default()
        }));
        let engine = EvictionEngine::new(index.clone(), locks, merge_view, activity, roots, config);
        engine.pairs.insert(pair, test_pair(pair, dir.path().to_path_buf()));

        engine.evict_now(pair, 10).await.unwrap();

        assert_eq!(index.get(pair, "old.bin").unwrap().location, Location::ExternalOnly);
        assert_eq!(index.get(pair, "new.bin").unwrap().location, Location::Both);
    }

    #[tokio::test]
    async fn locked_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::load(dir.path().join("index.json")).await.unwrap();
        let locks = LockManager::new();
        let merge_view = Arc::new(MergeView::new(index.clone()));
        let activity = Arc::new(ActivityLog::new());
        let pair = Uuid::new_v4();

        tokio::fs::write(dir.path().join("locked.bin"), vec![0u8; 10]).await.unwrap();
        let mut locked = FileEntry::new_file("locked.bin", Location::Both, 10);
        locked.accessed_at = SystemTime::UNIX_EPOCH;
        index.upsert(pair, "locked.bin", locked);

        let _guard = locks
            .try_acquire(pair, "locked.bin", LockDirection::LocalToExternal)
            .unwrap();

        let roots = Arc::new(FixedRoot(dir.path().to_path_buf()));
        let config = Arc::new(RwLock::new(EvictionConfig {
            min_file_age: Duration::from_secs(0),
            ..EvictionConfig::default()
        }));
        let engine = EvictionEngine::new(index.clone(), locks.clone(), merge_view, activity, roots, config);
        engine.pairs.insert(pair, test_pair(pair, dir.path().to_path_buf()));

        let result = engine.evict_now(pair, 10).await;
        assert!(matches!(result, Err(ServiceError::EvictionFailed { freed_bytes: 0, .. })));
    }
}
