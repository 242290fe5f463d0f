//! Service configuration and runtime state (spec §6).

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::model::{ConflictStrategy, Disk, EvictionStrategy, SyncPair, SyncState};

/// Environment variable read when running privileged, naming the real
/// user's home directory so `~`-prefixed config paths and logs resolve
/// correctly (spec §6).
pub const REAL_HOME_ENV: &str = "TIERFS_REAL_HOME";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvictionConfig {
    pub trigger_threshold: u64,
    pub target_free_space: u64,
    pub max_files_per_run: usize,
    pub min_file_age: Duration,
    pub check_interval: Duration,
    pub auto_enabled: bool,
    #[serde(default)]
    pub strategy: EvictionStrategy,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        EvictionConfig {
            trigger_threshold: 5 * 1024 * 1024 * 1024,
            target_free_space: 10 * 1024 * 1024 * 1024,
            max_files_per_run: 100,
            min_file_age: Duration::from_secs(3600),
            check_interval: Duration::from_secs(300),
            auto_enabled: true,
            strategy: EvictionStrategy::AccessTime,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    pub enable_checksum: bool,
    pub checksum_algorithm: String,
    pub verify_after_copy: bool,
    pub conflict_strategy: ConflictStrategy,
    pub enable_delete: bool,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    pub debounce_interval: Duration,
    pub auto_sync_interval: Duration,
    #[serde(default = "default_parallel_operations")]
    pub parallel_operations: usize,
    #[serde(default = "default_write_wait_timeout")]
    pub write_wait_timeout: Duration,
}

fn default_parallel_operations() -> usize {
    4
}

fn default_write_wait_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            enable_checksum: true,
            checksum_algorithm: "fnv1a".to_string(),
            verify_after_copy: true,
            conflict_strategy: ConflictStrategy::LocalWinsWithBackup,
            enable_delete: false,
            exclude_patterns: Vec::new(),
            debounce_interval: Duration::from_secs(5),
            auto_sync_interval: Duration::from_secs(60),
            parallel_operations: default_parallel_operations(),
            write_wait_timeout: default_write_wait_timeout(),
        }
    }
}

/// `Config` (spec §6) — loaded once at startup, updated via the
/// ControlPlane's `config_update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub eviction: EvictionConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub enable_performance_monitoring: bool,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: Duration,
    #[serde(default)]
    pub disks: Vec<Disk>,
    #[serde(default)]
    pub sync_pairs: Vec<SyncPair>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for Config {
    fn default() -> Self {
        Config {
            eviction: EvictionConfig::default(),
            sync: SyncConfig::default(),
            log_level: default_log_level(),
            enable_performance_monitoring: false,
            health_check_interval: default_health_check_interval(),
            disks: Vec::new(),
            sync_pairs: Vec::new(),
        }
    }
}

impl Config {
    pub async fn load(path: &Path) -> anyhow::Result<Config> {
        if !path.exists() {
            warn!(path = %path.display(), "config file missing, using defaults");
            return Ok(Config::default());
        }
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

/// Expands a `~`-prefixed path against the real user's home directory,
/// preferring [`REAL_HOME_ENV`] when the process runs privileged
/// (spec §6).
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var(REAL_HOME_ENV) {
            return PathBuf::from(home).join(rest);
        }
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Per-mount/per-pair/per-disk runtime state, persisted separately from
/// `Config` with a debounced (1s), atomic writer (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeState {
    pub service_start_time: Option<SystemTime>,
    pub mount_states: std::collections::HashMap<Uuid, bool>,
    pub sync_states: std::collections::HashMap<Uuid, SyncState>,
    pub disk_states: std::collections::HashMap<Uuid, bool>,
}

pub struct RuntimeStateStore {
    path: PathBuf,
    state: Mutex<RuntimeState>,
}

impl RuntimeStateStore {
    pub async fn load(path: PathBuf) -> Self {
        let state = if path.exists() {
            tokio::fs::read(&path)
                .await
                .ok()
                .and_then(|b| serde_json::from_slice(&b).ok())
                .unwrap_or_default()
        } else {
            RuntimeState::default()
        };
        RuntimeStateStore {
            path,
            state: Mutex::new(state),
        }
    }

    pub async fn mutate(&self, f: impl FnOnce(&mut RuntimeState)) {
        let mut guard = self.state.lock().await;
        f(&mut guard);
        let snapshot = guard.clone();
        drop(guard);
        if let Err(e) = self.flush(&snapshot).await {
            warn!(error = %e, "runtime state flush failed");
        }
    }

    pub async fn snapshot(&self) -> RuntimeState {
        self.state.lock().await.clone()
    }

    async fn flush(&self, state: &RuntimeState) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
