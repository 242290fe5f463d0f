//! Decides which backing store serves a `read`, optionally pulling
//! EXTERNAL-only files to LOCAL first (spec §4.5).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ServiceError;
use crate::index::Index;
use crate::model::{Location, LockDirection};

/// Which absolute path to read bytes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadSource {
    Local(PathBuf),
    External(PathBuf),
}

pub struct ReadRouter {
    index: Arc<Index>,
}

impl ReadRouter {
    pub fn new(index: Arc<Index>) -> Self {
        ReadRouter { index }
    }

    /// Implements the policy table in spec §4.5. `pull_on_demand` controls
    /// whether an `ExternalOnly` read with no lock eagerly copies to LOCAL
    /// first (the spec marks this optional).
    pub async fn route(
        &self,
        pair: Uuid,
        path: &str,
        local_abs: &Path,
        external_abs: Option<&Path>,
        pull_on_demand: bool,
    ) -> Result<ReadSource, ServiceError> {
        let entry = self
            .index
            .get(pair, path)
            .ok_or_else(|| ServiceError::FileNotFound(path.to_string()))?;

        let source = match (entry.location, entry.lock.as_ref().map(|l| l.direction)) {
            (Location::LocalOnly, _) => ReadSource::Local(local_abs.to_path_buf()),
            (Location::Both, None) => ReadSource::Local(local_abs.to_path_buf()),
            (Location::Both, Some(LockDirection::LocalToExternal)) => {
                ReadSource::Local(local_abs.to_path_buf())
            }
            (Location::Both, Some(LockDirection::ExternalToLocal)) => {
                let external = external_abs
                    .ok_or(ServiceError::ExternalOffline)?
                    .to_path_buf();
                ReadSource::External(external)
            }
            (Location::ExternalOnly, Some(LockDirection::ExternalToLocal)) | (Location::ExternalOnly, None) => {
                let external = external_abs
                    .ok_or(ServiceError::ExternalOffline)?
                    .to_path_buf();
                if pull_on_demand && entry.lock.is_none() {
                    if let Ok(pulled) = self
                        .pull_to_local(pair, path, &external, local_abs)
                        .await
                    {
                        return Ok(pulled);
                    }
                }
                ReadSource::External(external)
            }
            (Location::ExternalOnly, Some(LockDirection::LocalToExternal)) => {
                // Shouldn't happen (an ExternalOnly file has nothing to push),
                // but fall back to EXTERNAL rather than panic.
                let external = external_abs
                    .ok_or(ServiceError::ExternalOffline)?
                    .to_path_buf();
                ReadSource::External(external)
            }
            (Location::NotExists | Location::Deleted, _) => {
                return Err(ServiceError::FileNotFound(path.to_string()))
            }
        };

        self.index.touch_accessed(pair, path);
        Ok(source)
    }

    /// Copies EXTERNAL → LOCAL, ensuring parent directories exist, then
    /// marks the entry `Both, ¬dirty` (spec §4.5).
    async fn pull_to_local(
        &self,
        pair: Uuid,
        path: &str,
        external_abs: &Path,
        local_abs: &Path,
    ) -> Result<ReadSource, ServiceError> {
        if let Some(parent) = local_abs.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ServiceError::Internal(e.to_string()))?;
        }
        tokio::fs::copy(external_abs, local_abs)
            .await
            .map_err(|_| ServiceError::ExternalOffline)?;

        let meta = tokio::fs::metadata(local_abs)
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;

        self.index.mutate(pair, path, |entry| {
            entry.location = Location::Both;
            entry.clear_dirty();
            entry.size = meta.len() as i64;
        });
        info!(pair = %pair, path, "pulled external-only file to local cache");
        debug!(bytes = meta.len(), "pull complete");

        Ok(ReadSource::Local(local_abs.to_path_buf()))
    }
}
