//! Wire types for the request/response + event channel to the UI process
//! (spec §4.11). Frames are newline-delimited JSON over the socket.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{Config, EvictionConfig, SyncConfig};
use crate::error::IpcError;
use crate::model::{ActivityRecord, Disk, SyncPair, SyncState};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Mount {
        sync_pair_id: Uuid,
        local_dir: PathBuf,
        external_dir: Option<PathBuf>,
        target_dir: PathBuf,
    },
    Unmount { sync_pair_id: Uuid },
    UnmountAll,
    SyncNow { sync_pair_id: Uuid },
    SyncAll,
    SyncFile { path: String, sync_pair_id: Uuid },
    SyncPause { sync_pair_id: Uuid },
    SyncResume { sync_pair_id: Uuid },
    SyncCancel { sync_pair_id: Uuid },
    SyncGetStatus { sync_pair_id: Uuid },
    SyncGetAllStatus,
    SyncGetProgress { sync_pair_id: Uuid },
    SyncGetHistory { limit: usize },
    Evict { sync_pair_id: Uuid, target_free_space: u64 },
    EvictFile { path: String, sync_pair_id: Uuid },
    PrefetchFile { path: String, sync_pair_id: Uuid },
    ConfigGetAll,
    ConfigUpdate { payload: ConfigUpdatePayload },
    ConfigAddDisk { disk: Disk },
    ConfigRemoveDisk { disk_id: Uuid },
    ConfigAddSyncPair { pair: SyncPair },
    ConfigRemoveSyncPair { sync_pair_id: Uuid },
    GetFullState,
    DiskConnected { name: String, mount_path: PathBuf },
    DiskDisconnected { name: String },
    GetVersionInfo,
    CheckCompatibility { app_version: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigUpdatePayload {
    pub eviction: Option<EvictionConfig>,
    pub sync: Option<SyncConfig>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatusView {
    pub state: SyncState,
    pub last_sync: Option<SystemTime>,
    pub pending: u64,
    pub dirty: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictResult {
    pub freed_bytes: u64,
    pub error: Option<IpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullState {
    pub global_state: String,
    pub sync_pairs: Vec<(Uuid, SyncStatusView)>,
    pub disks: Vec<Disk>,
    pub config_status: Vec<crate::startup::StartupCheck>,
    pub uptime: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub service_version: String,
    pub protocol_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Config(Config),
    Status(SyncStatusView),
    AllStatus(Vec<(Uuid, SyncStatusView)>),
    Evicted(EvictResult),
    FullState(FullState),
    Version(VersionInfo),
    Compatible(bool),
    History(Vec<ActivityRecord>),
    Error(IpcError),
}

/// One-way notifications pushed from service to UI (spec §4.11).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    OnStateChanged { state: String },
    OnSyncProgress { sync_pair_id: Uuid, files_done: u64, files_total: u64 },
    OnSyncStatusChanged { sync_pair_id: Uuid, state: SyncState },
    OnSyncCompleted { sync_pair_id: Uuid, files: u64, bytes: u64 },
    OnIndexProgress { sync_pair_id: Uuid, scanned: u64 },
    OnIndexReady { sync_pair_id: Uuid },
    OnEvictionProgress { sync_pair_id: Uuid, freed_bytes: u64 },
    OnComponentError { component: String, error: IpcError },
    OnConfigUpdated,
    OnServiceReady,
    OnConflictDetected { sync_pair_id: Uuid, path: String },
    OnDiskChanged { disk_id: Uuid, connected: bool },
    OnActivitiesUpdated { activities: Vec<ActivityRecord> },
}

/// A tagged request envelope carrying the correlation id the UI expects
/// echoed back on the matching [`ResponseEnvelope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: Uuid,
    pub request: Request,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: Uuid,
    pub response: Response,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum EventFrame {
    Event(Event),
}
