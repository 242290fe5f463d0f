//! Core data model (spec §3): sync pairs, disks, file entries, activity.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Direction a [`SyncPair`] reconciles in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "L2E")]
    LocalToExternal,
    #[serde(rename = "E2L")]
    ExternalToLocal,
    Bidi,
}

/// Strategy applied by [`crate::eviction::EvictionEngine`] when choosing
/// candidates (§4.9).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EvictionStrategy {
    AccessTime,
    ModifiedTime,
    SizeFirst,
}

impl Default for EvictionStrategy {
    fn default() -> Self {
        EvictionStrategy::AccessTime
    }
}

/// Conflict resolution policy applied by [`crate::sync_scheduler::SyncScheduler`]
/// (§4.8).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictStrategy {
    LocalWinsWithBackup,
    NewerWins,
    LargerWins,
    ExternalWins,
    KeepBoth,
    AskUser,
}

impl Default for ConflictStrategy {
    fn default() -> Self {
        ConflictStrategy::LocalWinsWithBackup
    }
}

/// A configured synchronisation pair, supplied by the UI (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPair {
    pub id: Uuid,
    pub disk_id: Uuid,
    pub local_path: PathBuf,
    pub external_relative_path: PathBuf,
    pub direction: Direction,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    pub max_local_cache_bytes: u64,
    pub target_free_bytes: u64,
    #[serde(default = "default_true")]
    pub auto_evict: bool,
}

fn default_true() -> bool {
    true
}

impl SyncPair {
    /// Mount point presented to the user (renamed user directory).
    pub fn target_dir(&self) -> &Path {
        &self.local_path
    }

    /// LOCAL_DIR: hot cache, derived by suffixing `local_path`.
    pub fn local_dir(&self) -> PathBuf {
        let mut os = self.local_path.clone().into_os_string();
        os.push("_Local");
        PathBuf::from(os)
    }

    /// EXTERNAL_DIR: authoritative copy under the disk's mount path.
    pub fn external_dir(&self, disk_mount_path: &Path) -> PathBuf {
        disk_mount_path.join(&self.external_relative_path)
    }
}

/// A removable disk the UI has registered (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    pub id: Uuid,
    pub name: String,
    pub mount_path: PathBuf,
    pub priority: i32,
    pub enabled: bool,
}

impl Disk {
    /// `connected` is a runtime query, not stored state (spec §3).
    pub fn connected(&self) -> bool {
        self.mount_path.exists()
    }
}

/// Where the bytes of a virtual path currently live.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Location {
    NotExists,
    LocalOnly,
    ExternalOnly,
    Both,
    Deleted,
}

/// Direction of an in-flight reconcile holding the lock on a path (§3 inv. 4).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockDirection {
    LocalToExternal,
    ExternalToLocal,
}

/// A per-path sync lock (§3, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathLock {
    pub direction: LockDirection,
    pub acquired_at: SystemTime,
}

impl PathLock {
    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.acquired_at
            .elapsed()
            .map(|age| age > max_age)
            .unwrap_or(false)
    }
}

/// Per-(sync pair, virtual path) metadata row (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub virtual_path: String,
    pub location: Location,
    pub size: i64,
    pub is_directory: bool,
    pub created_at: SystemTime,
    pub modified_at: SystemTime,
    pub accessed_at: SystemTime,
    pub checksum: Option<String>,
    pub is_dirty: bool,
    pub lock: Option<PathLock>,
    /// Since when this entry has been dirty, used for FIFO ordering (§4.8,
    /// §5 "dirty files are reconciled in the order they became dirty").
    pub dirty_since: Option<SystemTime>,
}

impl FileEntry {
    pub fn new_file(virtual_path: impl Into<String>, location: Location, size: i64) -> Self {
        let now = SystemTime::now();
        FileEntry {
            virtual_path: virtual_path.into(),
            location,
            size,
            is_directory: false,
            created_at: now,
            modified_at: now,
            accessed_at: now,
            checksum: None,
            is_dirty: false,
            lock: None,
            dirty_since: None,
        }
    }

    pub fn new_directory(virtual_path: impl Into<String>, location: Location) -> Self {
        let mut e = Self::new_file(virtual_path, location, 0);
        e.is_directory = true;
        e
    }

    /// Invariant 3: `is_dirty ⇒ location ∈ {LocalOnly, Both}`.
    pub fn mark_dirty(&mut self) {
        debug_assert!(matches!(self.location, Location::LocalOnly | Location::Both));
        if !self.is_dirty {
            self.dirty_since = Some(SystemTime::now());
        }
        self.is_dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.is_dirty = false;
        self.dirty_since = None;
    }

    /// Invariant 5: directories never carry dirty/lock state.
    pub fn evictable(&self) -> bool {
        !self.is_directory
            && self.location == Location::Both
            && !self.is_dirty
            && self.lock.is_none()
    }

    /// Garbage-collection predicate from the spec's Lifecycle note.
    pub fn is_garbage(&self) -> bool {
        matches!(self.location, Location::NotExists) && !self.is_dirty && self.lock.is_none()
    }
}

/// Kind of event recorded in the activity log (spec §3).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActivityKind {
    SyncStarted,
    SyncCompleted,
    SyncFailed,
    EvictionCompleted,
    EvictionFailed,
    DiskConnected,
    DiskDisconnected,
    IndexRebuilt,
    ConfigUpdated,
    Error,
}

/// A single entry in the five-most-recent activity ring buffer (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    pub id: Uuid,
    pub kind: ActivityKind,
    pub title: String,
    pub detail: Option<String>,
    pub timestamp: SystemTime,
    pub sync_pair_id: Option<Uuid>,
    pub disk_id: Option<Uuid>,
    pub files_count: Option<u64>,
    pub bytes_count: Option<u64>,
}

/// Per-pair scheduler state machine (§4.8).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncState {
    Idle,
    Starting,
    Indexing,
    Syncing,
    Paused,
    Error,
}
