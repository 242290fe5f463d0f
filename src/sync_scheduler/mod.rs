//! Drives reconciliation: one worker task per sync pair, picking dirty
//! files, respecting locks, copying LOCAL→EXTERNAL (or the inverse),
//! verifying, and updating the Index (spec §4.8).

pub mod conflict;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use filetime::FileTime;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::activity::ActivityLog;
use crate::config::SyncConfig;
use crate::error::ServiceError;
use crate::index::Index;
use crate::lock_manager::LockManager;
use crate::merge_view::MergeView;
use crate::model::{ActivityKind, ConflictStrategy, FileEntry, Location, LockDirection, SyncPair, SyncState};

/// Backoff schedule for retryable failures within a pair (spec §4.8).
const BACKOFF_SCHEDULE: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
];

/// Resolves a sync pair's two absolute roots, needed by the scheduler but
/// owned by whatever tracks mounted disks; kept as a small trait so the
/// scheduler doesn't depend on the control plane's mount table directly.
#[async_trait::async_trait]
pub trait PairRoots: Send + Sync {
    async fn roots(&self, pair: &SyncPair) -> Option<(PathBuf, Option<PathBuf>)>;
}

struct PairWorker {
    state: RwLock<SyncState>,
    cancel: tokio::sync::Notify,
    paused: std::sync::atomic::AtomicBool,
}

pub struct SyncScheduler {
    index: Arc<Index>,
    locks: Arc<LockManager>,
    merge_view: Arc<MergeView>,
    activity: Arc<ActivityLog>,
    roots: Arc<dyn PairRoots>,
    config: Arc<RwLock<SyncConfig>>,
    workers: DashMap<Uuid, Arc<PairWorker>>,
    pairs: DashMap<Uuid, SyncPair>,
    dirty_signal: async_channel::Receiver<Uuid>,
    in_flight_permits: Arc<tokio::sync::Semaphore>,
}

impl SyncScheduler {
    pub fn new(
        index: Arc<Index>,
        locks: Arc<LockManager>,
        merge_view: Arc<MergeView>,
        activity: Arc<ActivityLog>,
        roots: Arc<dyn PairRoots>,
        config: Arc<RwLock<SyncConfig>>,
        dirty_signal: async_channel::Receiver<Uuid>,
    ) -> Arc<Self> {
        Arc::new(SyncScheduler {
            index,
            locks,
            merge_view,
            activity,
            roots,
            config,
            workers: DashMap::new(),
            pairs: DashMap::new(),
            dirty_signal,
            in_flight_permits: Arc::new(tokio::sync::Semaphore::new(4)),
        })
    }

    /// Spawns the debounce loop that drains dirty-pair notifications and
    /// kicks each pair's worker at most once per `debounce_interval`
    /// (spec §4.6, §4.8).
    pub fn spawn(self: &Arc<Self>, pairs: Vec<SyncPair>) {
        for pair in pairs {
            self.pairs.insert(pair.id, pair.clone());
            self.ensure_worker(pair.id);
        }

        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut pending: HashMap<Uuid, tokio::time::Instant> = HashMap::new();
            let debounce = scheduler.config.read().await.debounce_interval;
            loop {
                let recv_timeout = tokio::time::sleep(debounce);
                tokio::select! {
                    result = scheduler.dirty_signal.recv() => {
                        match result {
                            Ok(pair) => { pending.insert(pair, tokio::time::Instant::now() + debounce); }
                            Err(_) => break,
                        }
                    }
                    _ = recv_timeout => {}
                }

                let now = tokio::time::Instant::now();
                let ready: Vec<Uuid> = pending
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(p, _)| *p)
                    .collect();
                for pair in ready {
                    pending.remove(&pair);
                    scheduler.ensure_worker(pair);
                    scheduler.wake(pair);
                }
            }
        });
    }

    fn ensure_worker(self: &Arc<Self>, pair: Uuid) {
        if self.workers.contains_key(&pair) {
            return;
        }
        let worker = Arc::new(PairWorker {
            state: RwLock::new(SyncState::Idle),
            cancel: tokio::sync::Notify::new(),
            paused: std::sync::atomic::AtomicBool::new(false),
        });
        self.workers.insert(pair, worker);
    }

    fn wake(self: &Arc<Self>, pair: Uuid) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            if let Err(e) = scheduler.run_pair(pair).await {
                error!(pair = %pair, error = %e, "sync pair run failed");
            }
        });
    }

    pub async fn sync_now(self: &Arc<Self>, pair: Uuid) -> Result<(), ServiceError> {
        self.ensure_worker(pair);
        self.run_pair(pair).await
    }

    pub async fn sync_all(self: &Arc<Self>) {
        let pairs: Vec<Uuid> = self.workers.iter().map(|r| *r.key()).collect();
        for pair in pairs {
            self.wake(pair);
        }
    }

    pub async fn pause(&self, pair: Uuid) {
        if let Some(worker) = self.workers.get(&pair) {
            worker.paused.store(true, Ordering::SeqCst);
            *worker.state.write().await = SyncState::Paused;
        }
    }

    pub async fn resume(&self, pair: Uuid) {
        if let Some(worker) = self.workers.get(&pair) {
            worker.paused.store(false, Ordering::SeqCst);
            *worker.state.write().await = SyncState::Idle;
        }
    }

    /// Aborts the running file (spec §5: "the current file finishes its
    /// atomic step ... and no partial file is left in EXTERNAL").
    pub fn cancel(&self, pair: Uuid) {
        if let Some(worker) = self.workers.get(&pair) {
            worker.cancel.notify_waiters();
        }
    }

    pub async fn status(&self, pair: Uuid) -> Option<SyncState> {
        let worker = self.workers.get(&pair)?;
        Some(*worker.state.read().await)
    }

    /// One reconcile pass over the pair's dirty set; serialises files
    /// within the pair (spec §4.8: "files within a pair are serialised").
    async fn run_pair(self: &Arc<Self>, pair: Uuid) -> Result<(), ServiceError> {
        let worker = match self.workers.get(&pair) {
            Some(w) => w.clone(),
            None => return Ok(()),
        };
        if worker.paused.load(Ordering::SeqCst) {
            return Ok(());
        }

        let _permit = self
            .in_flight_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ServiceError::Internal("scheduler semaphore closed".into()))?;

        let Some(sync_pair) = self.pairs.get(&pair).map(|r| r.clone()) else {
            return Ok(());
        };

        *worker.state.write().await = SyncState::Starting;
        let Some((local_root, external_root)) = self.roots.roots(&sync_pair).await else {
            *worker.state.write().await = SyncState::Error;
            return Err(ServiceError::SourceUnavailable(pair.to_string()));
        };

        *worker.state.write().await = SyncState::Indexing;
        let dirty = self.index.dirty_for_pair(pair);
        if dirty.is_empty() {
            *worker.state.write().await = SyncState::Idle;
            return Ok(());
        }

        *worker.state.write().await = SyncState::Syncing;
        info!(pair = %pair, files = dirty.len(), "sync pair starting reconcile pass");
        self.activity.record(
            ActivityKind::SyncStarted,
            format!("Sync started for {pair}"),
            None,
            Some(pair),
            None,
            Some(dirty.len() as u64),
            None,
        );

        let mut synced = 0u64;
        let mut bytes = 0u64;
        let mut failed = false;

        for entry in dirty {
            if worker.paused.load(Ordering::SeqCst) {
                break;
            }
            let cancelled = tokio::select! {
                _ = worker.cancel.notified() => true,
                result = self.reconcile_one(pair, &entry, &local_root, external_root.as_deref()) => {
                    match result {
                        Ok(n) => { synced += 1; bytes += n; false }
                        Err(e) if e.recoverable() => {
                            warn!(pair = %pair, path = %entry.virtual_path, error = %e, "retryable sync failure");
                            self.retry_with_backoff(pair, &entry, &local_root, external_root.as_deref()).await;
                            false
                        }
                        Err(e) => {
                            error!(pair = %pair, path = %entry.virtual_path, error = %e, "sync failure");
                            failed = true;
                            false
                        }
                    }
                }
            };
            if cancelled {
                info!(pair = %pair, "sync cancelled, current file's atomic step finished cleanly");
                break;
            }
        }

        *worker.state.write().await = if failed { SyncState::Error } else { SyncState::Idle };

        if failed {
            self.activity.record(
                ActivityKind::SyncFailed,
                format!("Sync failed for {pair}"),
                None,
                Some(pair),
                None,
                Some(synced),
                Some(bytes),
            );
        } else {
            self.activity.record(
                ActivityKind::SyncCompleted,
                format!("Sync completed for {pair}"),
                None,
                Some(pair),
                None,
                Some(synced),
                Some(bytes),
            );
        }
        Ok(())
    }

    async fn retry_with_backoff(
        self: &Arc<Self>,
        pair: Uuid,
        entry: &FileEntry,
        local_root: &Path,
        external_root: Option<&Path>,
    ) {
        for delay in BACKOFF_SCHEDULE {
            tokio::time::sleep(delay).await;
            if self
                .reconcile_one(pair, entry, local_root, external_root)
                .await
                .is_ok()
            {
                return;
            }
        }
        warn!(pair = %pair, path = %entry.virtual_path, "exhausted retries, surfacing failure");
    }

    /// Reconciles a single dirty file: acquire `L→E` lock, copy via temp
    /// file + rename, optionally verify, handle conflicts, release lock,
    /// update Index (spec §4.8). Returns bytes copied.
    async fn reconcile_one(
        &self,
        pair: Uuid,
        entry: &FileEntry,
        local_root: &Path,
        external_root: Option<&Path>,
    ) -> Result<u64, ServiceError> {
        let external_root = external_root.ok_or(ServiceError::ExternalOffline)?;
        let local_abs = local_root.join(&entry.virtual_path);
        let external_abs = external_root.join(&entry.virtual_path);

        if tokio::fs::metadata(&local_abs).await.is_err() {
            return Err(ServiceError::SourceUnavailable(entry.virtual_path.clone()));
        }

        let guard = self
            .locks
            .acquire(
                pair,
                &entry.virtual_path,
                LockDirection::LocalToExternal,
                Duration::from_secs(30),
            )
            .await?;

        let config = self.config.read().await.clone();
        let result = self
            .copy_with_conflict_check(pair, entry, &local_abs, &external_abs, &config)
            .await;
        drop(guard);
        result
    }

    async fn copy_with_conflict_check(
        &self,
        pair: Uuid,
        entry: &FileEntry,
        local_abs: &Path,
        external_abs: &Path,
        config: &SyncConfig,
    ) -> Result<u64, ServiceError> {
        let external_meta = tokio::fs::metadata(external_abs).await.ok();

        let conflicted = if let Some(meta) = &external_meta {
            let ext_mtime = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
            ext_mtime > entry.modified_at
        } else {
            false
        };

        let target = if conflicted {
            let local_meta = tokio::fs::metadata(local_abs)
                .await
                .map_err(|e| ServiceError::Internal(e.to_string()))?;
            let external_meta = external_meta.unwrap();
            let ctx = conflict::ConflictContext {
                strategy: config.conflict_strategy,
                external_abs,
                local_size: local_meta.len(),
                local_mtime: local_meta.modified().unwrap_or(std::time::UNIX_EPOCH),
                external_size: external_meta.len(),
                external_mtime: external_meta.modified().unwrap_or(std::time::UNIX_EPOCH),
            };
            let resolution = conflict::resolve(ctx);
            if matches!(resolution, conflict::Resolution::Defer) {
                return Err(ServiceError::Conflict(entry.virtual_path.clone()));
            }
            conflict::apply_resolution(&resolution, local_abs, external_abs).await?
        } else {
            external_abs.to_path_buf()
        };

        let bytes = atomic_copy(local_abs, &target).await?;

        if config.verify_after_copy {
            let local_meta = tokio::fs::metadata(local_abs)
                .await
                .map_err(|e| ServiceError::Internal(e.to_string()))?;
            let copied_meta = tokio::fs::metadata(&target)
                .await
                .map_err(|e| ServiceError::Internal(e.to_string()))?;
            if local_meta.len() != copied_meta.len() {
                return Err(ServiceError::ChecksumMismatch(entry.virtual_path.clone()));
            }
        }

        self.index.mutate(pair, &entry.virtual_path, |e| {
            e.clear_dirty();
            e.location = Location::Both;
        });
        self.merge_view.invalidate(pair, &entry.virtual_path);
        Ok(bytes)
    }
}

/// Copies `from` to `to` via a temp file + rename so a reader of `to`
/// never observes a partially-written file, preserving mtime (spec §4.8).
async fn atomic_copy(from: &Path, to: &Path) -> Result<u64, ServiceError> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
    }
    let mut tmp_name = to.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tierfs-tmp");
    let tmp = to.with_file_name(tmp_name);
    let bytes = tokio::fs::copy(from, &tmp)
        .await
        .map_err(|e| ServiceError::Internal(e.to_string()))?;

    let source_meta = tokio::fs::metadata(from)
        .await
        .map_err(|e| ServiceError::Internal(e.to_string()))?;
    let mtime = FileTime::from_last_modification_time(&source_meta);
    let tmp_for_time = tmp.clone();
    tokio::task::spawn_blocking(move || filetime::set_file_mtime(&tmp_for_time, mtime))
        .await
        .map_err(|e| ServiceError::Internal(e.to_string()))?
        .map_err(|e| ServiceError::Internal(e.to_string()))?;

    tokio::fs::rename(&tmp, to)
        .await
        .map_err(|e| ServiceError::Internal(e.to_string()))?;
    Ok(bytes)
}
