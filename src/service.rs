//! Owns every process-wide singleton and brings them up in the dependency
//! order spec §5 prescribes: Index → TreeVersion reconcile → routers →
//! scheduler → eviction → FUSE bridge → IPC listener.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::activity::ActivityLog;
use crate::config::{Config, RuntimeStateStore};
use crate::control_plane::protocol::{
    ConfigUpdatePayload, EvictResult, FullState, Request, Response, SyncStatusView, VersionInfo,
};
use crate::control_plane::{ControlPlane, PeerAuth, RequestHandler};
use crate::error::{IpcError, ServiceError};
use crate::eviction::{EvictionEngine, LocalRoots};
use crate::fuse_bridge::TierFs;
use crate::index::Index;
use crate::lock_manager::LockManager;
use crate::merge_view::MergeView;
use crate::model::{ActivityKind, Disk, SyncPair};
use crate::path_resolver::PathResolver;
use crate::privileged::PrivilegedOps;
use crate::read_router::ReadRouter;
use crate::startup::{self, StartupCheck};
use crate::sync_scheduler::{PairRoots, SyncScheduler};
use crate::write_router::WriteRouter;

/// Service-wide protocol version surfaced by `get_version_info` (§4.11).
const PROTOCOL_VERSION: u32 = 1;
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Resolves each sync pair's LOCAL/EXTERNAL roots from the live disk
/// registry, shared by [`SyncScheduler`], [`EvictionEngine`], and every
/// mounted [`TierFs`] (spec §5: "the service maintains process-wide
/// singletons").
pub struct MountTable {
    pairs: DashMap<Uuid, SyncPair>,
    disks: DashMap<Uuid, Disk>,
    external_roots: DashMap<Uuid, PathBuf>,
}

impl MountTable {
    fn new() -> Arc<Self> {
        Arc::new(MountTable {
            pairs: DashMap::new(),
            disks: DashMap::new(),
            external_roots: DashMap::new(),
        })
    }

    fn register_pair(&self, pair: SyncPair) {
        if let Some(disk) = self.disks.get(&pair.disk_id) {
            if disk.connected() {
                self.external_roots.insert(pair.id, pair.external_dir(&disk.mount_path));
            }
        }
        self.pairs.insert(pair.id, pair);
    }

    fn register_disk(&self, disk: Disk) {
        self.disks.insert(disk.id, disk);
    }

    /// `disk_connected(name, mount_path)`: updates every pair on that disk
    /// (spec §4.11).
    fn disk_connected(&self, name: &str, mount_path: PathBuf) -> Option<Uuid> {
        let mut matched = None;
        for mut disk in self.disks.iter_mut() {
            if disk.name == name {
                disk.mount_path = mount_path.clone();
                matched = Some(disk.id);
            }
        }
        if let Some(disk_id) = matched {
            for pair in self.pairs.iter() {
                if pair.disk_id == disk_id {
                    self.external_roots
                        .insert(pair.id, pair.external_dir(&mount_path));
                }
            }
        }
        matched
    }

    fn disk_disconnected(&self, name: &str) -> Option<Uuid> {
        let disk_id = self.disks.iter().find(|d| d.name == name).map(|d| d.id)?;
        for pair in self.pairs.iter() {
            if pair.disk_id == disk_id {
                self.external_roots.remove(&pair.id);
            }
        }
        Some(disk_id)
    }
}

#[async_trait::async_trait]
impl PairRoots for MountTable {
    async fn roots(&self, pair: &SyncPair) -> Option<(PathBuf, Option<PathBuf>)> {
        Some((pair.local_dir(), self.external_roots.get(&pair.id).map(|r| r.clone())))
    }
}

#[async_trait::async_trait]
impl LocalRoots for MountTable {
    async fn local_root(&self, pair: &SyncPair) -> Option<PathBuf> {
        Some(pair.local_dir())
    }
}

/// A live FUSE mount: the cancellation handle for its session task.
struct Mount {
    abort: tokio::task::AbortHandle,
}

pub struct Service {
    pub config: Arc<RwLock<Config>>,
    pub runtime_state: Arc<RuntimeStateStore>,
    pub index: Arc<Index>,
    pub locks: Arc<LockManager>,
    pub merge_view: Arc<MergeView>,
    pub activity: Arc<ActivityLog>,
    pub read_router: Arc<ReadRouter>,
    pub write_router: Arc<WriteRouter>,
    pub scheduler: Arc<SyncScheduler>,
    pub eviction: Arc<EvictionEngine>,
    pub mounts_table: Arc<MountTable>,
    pub privileged: Arc<PrivilegedOps>,
    mounts: DashMap<Uuid, Mount>,
    start_time: Instant,
}

impl Service {
    pub async fn new(config: Config, index_path: PathBuf, runtime_state_path: PathBuf) -> Result<Arc<Self>, ServiceError> {
        let index = Index::load(index_path)
            .await
            .map_err(|e| ServiceError::DbCorrupted(e.to_string()))?;
        let locks = LockManager::new();
        let merge_view = Arc::new(MergeView::new(index.clone()));
        let activity = Arc::new(ActivityLog::new());
        let mounts_table = MountTable::new();

        for disk in &config.disks {
            mounts_table.register_disk(disk.clone());
        }
        for pair in &config.sync_pairs {
            mounts_table.register_pair(pair.clone());
        }

        let (dirty_tx, dirty_rx) = async_channel::unbounded();
        let read_router = Arc::new(ReadRouter::new(index.clone()));
        let write_router = Arc::new(WriteRouter::new(index.clone(), locks.clone(), merge_view.clone(), dirty_tx));

        let sync_config = Arc::new(RwLock::new(config.sync.clone()));
        let scheduler = SyncScheduler::new(
            index.clone(),
            locks.clone(),
            merge_view.clone(),
            activity.clone(),
            mounts_table.clone(),
            sync_config,
            dirty_rx,
        );

        let eviction_config = Arc::new(RwLock::new(config.eviction.clone()));
        let eviction = EvictionEngine::new(
            index.clone(),
            locks.clone(),
            merge_view.clone(),
            activity.clone(),
            mounts_table.clone(),
            eviction_config,
        );

        let resolver = PathResolver::new(&[])?;
        let privileged = Arc::new(PrivilegedOps::new(resolver));

        let runtime_state = Arc::new(RuntimeStateStore::load(runtime_state_path).await);

        Ok(Arc::new(Service {
            config: Arc::new(RwLock::new(config)),
            runtime_state,
            index,
            locks,
            merge_view,
            activity,
            read_router,
            write_router,
            scheduler,
            eviction,
            mounts_table,
            privileged,
            mounts: DashMap::new(),
            start_time: Instant::now(),
        }))
    }

    /// Runs TreeVersion reconciliation for every configured pair, then
    /// spawns the scheduler and eviction engine's background loops (spec
    /// §5 dependency order, §4.3).
    pub async fn reconcile_and_start_background(self: &Arc<Self>) -> Result<(), ServiceError> {
        let pairs: Vec<SyncPair> = self
            .mounts_table
            .pairs
            .iter()
            .map(|r| r.value().clone())
            .collect();

        for pair in &pairs {
            let resolver = PathResolver::new(&pair.exclude_patterns)?;
            let Some((local_root, external_root)) = self.mounts_table.roots(pair).await else {
                continue;
            };
            tokio::fs::create_dir_all(&local_root)
                .await
                .map_err(|e| ServiceError::Internal(e.to_string()))?;
            match crate::tree_version::reconcile_pair(&self.index, &resolver, pair.id, &local_root, external_root.as_deref()).await {
                Ok(outcome) => info!(
                    pair = %pair.id,
                    rebuilt_local = outcome.rebuilt_local,
                    rebuilt_external = outcome.rebuilt_external,
                    "startup reconciliation complete"
                ),
                Err(e) => warn!(pair = %pair.id, error = %e, "startup reconciliation failed, pair starts unscanned"),
            }
        }

        self.scheduler.spawn(pairs.clone());
        self.eviction.spawn(pairs);
        Ok(())
    }

    /// Mounts one sync pair's FUSE filesystem at `target_dir` (spec §4.11
    /// `mount`).
    pub async fn mount_pair(self: &Arc<Self>, pair: SyncPair, target_dir: PathBuf) -> Result<(), ServiceError> {
        if self.mounts.contains_key(&pair.id) {
            return Ok(());
        }
        let resolver = Arc::new(PathResolver::new(&pair.exclude_patterns)?);
        let sync_config = Arc::new(RwLock::new(self.config.read().await.sync.clone()));

        let fs = TierFs::new(
            pair.clone(),
            self.index.clone(),
            self.merge_view.clone(),
            self.read_router.clone(),
            self.write_router.clone(),
            resolver,
            self.mounts_table.clone() as Arc<dyn PairRoots>,
            sync_config,
        );

        let pair_id = pair.id;
        let handle = tokio::spawn(async move {
            if let Err(e) = fs.mount(&target_dir).await {
                error!(pair = %pair_id, error = %e, "fuse mount task exited with error");
            }
        });
        self.mounts.insert(pair_id, Mount { abort: handle.abort_handle() });
        Ok(())
    }

    pub fn unmount_pair(&self, pair: Uuid) {
        if let Some((_, mount)) = self.mounts.remove(&pair) {
            mount.abort.abort();
        }
        self.scheduler.cancel(pair);
    }

    pub fn unmount_all(&self) {
        let ids: Vec<Uuid> = self.mounts.iter().map(|r| *r.key()).collect();
        for id in ids {
            self.unmount_pair(id);
        }
    }

    async fn status_view(&self, pair: Uuid) -> SyncStatusView {
        let state = self.scheduler.status(pair).await.unwrap_or(crate::model::SyncState::Idle);
        let dirty = self.index.dirty_for_pair(pair).len() as u64;
        SyncStatusView { state, last_sync: None, pending: dirty, dirty }
    }
}

#[async_trait::async_trait]
impl RequestHandler for Service {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::SyncNow { sync_pair_id } => match self.scheduler.sync_now(sync_pair_id).await {
                Ok(()) => Response::Ok,
                Err(e) => Response::Error(IpcError::from_service_error("sync_scheduler", &e)),
            },
            Request::SyncAll => {
                self.scheduler.sync_all().await;
                Response::Ok
            }
            Request::SyncPause { sync_pair_id } => {
                self.scheduler.pause(sync_pair_id).await;
                Response::Ok
            }
            Request::SyncResume { sync_pair_id } => {
                self.scheduler.resume(sync_pair_id).await;
                Response::Ok
            }
            Request::SyncCancel { sync_pair_id } => {
                self.scheduler.cancel(sync_pair_id);
                Response::Ok
            }
            Request::SyncGetStatus { sync_pair_id } => Response::Status(self.status_view(sync_pair_id).await),
            Request::SyncGetAllStatus | Request::SyncGetProgress { .. } => {
                let mut out = Vec::new();
                for pair in self.mounts_table.pairs.iter() {
                    out.push((*pair.key(), self.status_view(*pair.key()).await));
                }
                Response::AllStatus(out)
            }
            Request::SyncGetHistory { limit } => Response::History(self.activity.recent(limit)),
            Request::Evict { sync_pair_id, target_free_space } => {
                match self.eviction.evict_now(sync_pair_id, target_free_space).await {
                    Ok(()) => Response::Evicted(EvictResult { freed_bytes: target_free_space, error: None }),
                    Err(ServiceError::EvictionFailed { freed_bytes, .. }) => {
                        Response::Evicted(EvictResult { freed_bytes, error: None })
                    }
                    Err(e) => Response::Evicted(EvictResult {
                        freed_bytes: 0,
                        error: Some(IpcError::from_service_error("eviction", &e)),
                    }),
                }
            }
            Request::ConfigGetAll => Response::Config(self.config.read().await.clone()),
            Request::ConfigUpdate { payload } => self.apply_config_update(payload).await,
            Request::ConfigAddDisk { disk } => {
                self.mounts_table.register_disk(disk.clone());
                self.config.write().await.disks.push(disk);
                Response::Ok
            }
            Request::ConfigRemoveDisk { disk_id } => {
                self.config.write().await.disks.retain(|d| d.id != disk_id);
                Response::Ok
            }
            Request::ConfigAddSyncPair { pair } => {
                self.mounts_table.register_pair(pair.clone());
                self.config.write().await.sync_pairs.push(pair);
                Response::Ok
            }
            Request::ConfigRemoveSyncPair { sync_pair_id } => {
                self.unmount_pair(sync_pair_id);
                self.config.write().await.sync_pairs.retain(|p| p.id != sync_pair_id);
                Response::Ok
            }
            Request::Mount { sync_pair_id, target_dir, .. } => {
                let pair = self.mounts_table.pairs.get(&sync_pair_id).map(|r| r.clone());
                match pair {
                    Some(pair) => match self.mount_pair(pair, target_dir).await {
                        Ok(()) => Response::Ok,
                        Err(e) => Response::Error(IpcError::from_service_error("fuse_bridge", &e)),
                    },
                    None => Response::Error(IpcError::from_service_error(
                        "fuse_bridge",
                        &ServiceError::FileNotFound(sync_pair_id.to_string()),
                    )),
                }
            }
            Request::Unmount { sync_pair_id } => {
                self.unmount_pair(sync_pair_id);
                Response::Ok
            }
            Request::UnmountAll => {
                self.unmount_all();
                Response::Ok
            }
            Request::DiskConnected { name, mount_path } => {
                if let Some(disk_id) = self.mounts_table.disk_connected(&name, mount_path) {
                    self.activity.record(
                        ActivityKind::DiskConnected,
                        format!("Disk {name} connected"),
                        None,
                        None,
                        Some(disk_id),
                        None,
                        None,
                    );
                }
                Response::Ok
            }
            Request::DiskDisconnected { name } => {
                if let Some(disk_id) = self.mounts_table.disk_disconnected(&name) {
                    self.activity.record(
                        ActivityKind::DiskDisconnected,
                        format!("Disk {name} disconnected"),
                        None,
                        None,
                        Some(disk_id),
                        None,
                        None,
                    );
                }
                Response::Ok
            }
            Request::GetFullState => Response::FullState(self.full_state().await),
            Request::GetVersionInfo => Response::Version(VersionInfo {
                service_version: SERVICE_VERSION.to_string(),
                protocol_version: PROTOCOL_VERSION,
            }),
            Request::CheckCompatibility { app_version } => {
                Response::Compatible(app_version.split('.').next() == SERVICE_VERSION.split('.').next())
            }
            Request::SyncFile { path, sync_pair_id } => match self.sync_single_file(sync_pair_id, &path).await {
                Ok(()) => Response::Ok,
                Err(e) => Response::Error(IpcError::from_service_error("sync_scheduler", &e)),
            },
            Request::EvictFile { path, sync_pair_id } => match self.eviction.evict_path(sync_pair_id, &path).await {
                Ok(freed_bytes) => Response::Evicted(EvictResult { freed_bytes, error: None }),
                Err(e) => Response::Evicted(EvictResult {
                    freed_bytes: 0,
                    error: Some(IpcError::from_service_error("eviction", &e)),
                }),
            },
            Request::PrefetchFile { path, sync_pair_id } => match self.prefetch_file(sync_pair_id, &path).await {
                Ok(()) => Response::Ok,
                Err(e) => Response::Error(IpcError::from_service_error("read_router", &e)),
            },
        }
    }
}

impl Service {
    async fn apply_config_update(&self, payload: ConfigUpdatePayload) -> Response {
        let mut config = self.config.write().await;
        if let Some(eviction) = payload.eviction {
            config.eviction = eviction;
        }
        if let Some(sync) = payload.sync {
            config.sync = sync;
        }
        if let Some(level) = payload.log_level {
            config.log_level = level;
        }
        self.activity.record(
            ActivityKind::ConfigUpdated,
            "Configuration updated".to_string(),
            None,
            None,
            None,
            None,
            None,
        );
        Response::Ok
    }

    async fn sync_single_file(&self, pair: Uuid, path: &str) -> Result<(), ServiceError> {
        if self.index.get(pair, path).is_none() {
            return Err(ServiceError::FileNotFound(path.to_string()));
        }
        self.scheduler.sync_now(pair).await
    }

    /// `prefetch_file` (spec §4.11): pulls an `ExternalOnly` file to LOCAL
    /// on demand, the same path `ReadRouter::route`'s read-time pull takes.
    async fn prefetch_file(&self, pair: Uuid, path: &str) -> Result<(), ServiceError> {
        let sync_pair = self
            .mounts_table
            .pairs
            .get(&pair)
            .map(|r| r.clone())
            .ok_or_else(|| ServiceError::FileNotFound(pair.to_string()))?;
        let (local_root, external_root) = self
            .mounts_table
            .roots(&sync_pair)
            .await
            .ok_or(ServiceError::ExternalOffline)?;
        let local_abs = local_root.join(path);
        let external_abs = external_root.map(|r| r.join(path));
        self.read_router
            .route(pair, path, &local_abs, external_abs.as_deref(), true)
            .await
            .map(|_| ())
    }

    async fn full_state(&self) -> FullState {
        let mut sync_pairs = Vec::new();
        for pair in self.mounts_table.pairs.iter() {
            sync_pairs.push((*pair.key(), self.status_view(*pair.key()).await));
        }
        FullState {
            global_state: if self.mounts.is_empty() { "idle".to_string() } else { "running".to_string() },
            sync_pairs,
            disks: self.mounts_table.disks.iter().map(|r| r.clone()).collect(),
            config_status: Vec::new(),
            uptime: self.start_time.elapsed(),
        }
    }
}

/// Assembles and runs the full daemon: startup checks, `Service`,
/// background loops, the ControlPlane listener, and SIGINT/SIGTERM
/// handling, returning once a shutdown has been requested (spec §5, §6).
pub async fn run(
    config_path: PathBuf,
    index_path: PathBuf,
    runtime_state_path: PathBuf,
    socket_path: PathBuf,
    log_dir: PathBuf,
) -> anyhow::Result<()> {
    let config = Config::load(&config_path).await?;
    let mut checks = startup::run_preflight(
        config_path.parent().unwrap_or_else(|| std::path::Path::new(".")),
        &log_dir,
    )
    .await;

    let service = Service::new(config, index_path, runtime_state_path).await?;
    startup::record(&mut checks, "config loaded", Ok(()));

    service.reconcile_and_start_background().await?;
    startup::record(&mut checks, "index built, scheduler up", Ok(()));

    let control_plane = ControlPlane::new(socket_path, PeerAuth::new(None), service.clone());
    let serving = tokio::spawn(control_plane.clone().serve());
    startup::record(&mut checks, "IPC listener up", Ok(()));

    control_plane.publish(crate::control_plane::protocol::Event::OnServiceReady);
    for check in &checks {
        if check.status == crate::startup::CheckStatus::Fail {
            warn!(check = %check.name, "continuing with a failed startup check");
        }
    }

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })?;

    tokio::select! {
        _ = shutdown_rx.recv() => info!("shutdown signal received"),
        result = serving => {
            if let Ok(Err(e)) = result {
                error!(error = %e, "control plane listener exited");
            }
        }
    }

    service.unmount_all();
    service.index.flush().await.ok();
    info!("tierfs daemon shutting down");
    Ok(())
}
