//! Directs writes to LOCAL, marks entries dirty, and debounces a
//! notification to the [`crate::sync_scheduler::SyncScheduler`] (spec §4.6).

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ServiceError;
use crate::index::Index;
use crate::lock_manager::LockManager;
use crate::merge_view::MergeView;
use crate::model::{FileEntry, Location, LockDirection};

/// Default timeout a writer waits for an `L→E` lock to clear (spec §4.6).
pub const WRITE_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Debounce window before a dirtying operation's notification is folded
/// into a batch enqueue (spec §4.6).
pub const DEBOUNCE_WINDOW: Duration = Duration::from_secs(5);

pub struct WriteRouter {
    index: Arc<Index>,
    locks: Arc<LockManager>,
    merge_view: Arc<MergeView>,
    /// Fires once per pair whenever a dirtying op lands; the scheduler's
    /// debounce loop (§4.8) drains this.
    dirty_notify: async_channel::Sender<Uuid>,
}

impl WriteRouter {
    pub fn new(
        index: Arc<Index>,
        locks: Arc<LockManager>,
        merge_view: Arc<MergeView>,
        dirty_notify: async_channel::Sender<Uuid>,
    ) -> Self {
        WriteRouter {
            index,
            locks,
            merge_view,
            dirty_notify,
        }
    }

    /// `write`: waits out an `L→E` lock, preempts an `E→L` pull, then
    /// writes `data` to LOCAL at `offset` (spec §4.6).
    pub async fn write(
        &self,
        pair: Uuid,
        path: &str,
        local_abs: &Path,
        offset: u64,
        data: &[u8],
    ) -> Result<u32, ServiceError> {
        self.await_writable(pair, path).await?;

        if let Some(parent) = local_abs.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ServiceError::Internal(e.to_string()))?;
        }

        use tokio::io::AsyncWriteExt;
        use tokio::io::AsyncSeekExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(local_abs)
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        file.write_all(data)
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        file.flush().await.map_err(|e| ServiceError::Internal(e.to_string()))?;

        let meta = tokio::fs::metadata(local_abs)
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        self.apply_dirty(pair, path, meta.len() as i64);
        self.debounce_sync_notify(pair);
        Ok(data.len() as u32)
    }

    /// `create`: materialises parent directories and an empty LOCAL file,
    /// then behaves like a zero-byte write (spec §4.6, §4.10).
    pub async fn create(&self, pair: Uuid, path: &str, local_abs: &Path) -> Result<(), ServiceError> {
        if let Some(parent) = local_abs.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ServiceError::Internal(e.to_string()))?;
        }
        tokio::fs::File::create(local_abs)
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        self.apply_dirty(pair, path, 0);
        self.debounce_sync_notify(pair);
        Ok(())
    }

    pub async fn make_dir(&self, pair: Uuid, path: &str, local_abs: &Path) -> Result<(), ServiceError> {
        tokio::fs::create_dir_all(local_abs)
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        self.index
            .upsert(pair, path, FileEntry::new_directory(path, Location::LocalOnly));
        self.merge_view.invalidate(pair, path);
        Ok(())
    }

    /// `truncate`: changes LOCAL size and marks dirty (spec §4.10).
    pub async fn truncate(
        &self,
        pair: Uuid,
        path: &str,
        local_abs: &Path,
        size: u64,
    ) -> Result<(), ServiceError> {
        self.await_writable(pair, path).await?;
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(local_abs)
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        file.set_len(size)
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        self.apply_dirty(pair, path, size as i64);
        self.debounce_sync_notify(pair);
        Ok(())
    }

    /// `setxattr`: xattr writes always land on LOCAL and mark the entry
    /// dirty, regardless of which side currently holds the file (spec §4.10).
    pub async fn set_xattr(
        &self,
        pair: Uuid,
        path: &str,
        local_abs: &Path,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> Result<(), ServiceError> {
        self.await_writable(pair, path).await?;
        set_xattr_blocking(local_abs, name, value, flags)?;
        self.touch_dirty(pair, path);
        Ok(())
    }

    /// `removexattr`: same placement rule as [`Self::set_xattr`].
    pub async fn remove_xattr(&self, pair: Uuid, path: &str, local_abs: &Path, name: &OsStr) -> Result<(), ServiceError> {
        self.await_writable(pair, path).await?;
        remove_xattr_blocking(local_abs, name)?;
        self.touch_dirty(pair, path);
        Ok(())
    }

    /// `utimens`: fuse3 has no standalone utimens callback, it arrives via
    /// `setattr`'s `atime`/`mtime` fields. Updates LOCAL times; dirties the
    /// entry only when mtime changes, matching mtime's role as the signal a
    /// reconcile actually needs to care about (spec §4.10).
    pub async fn set_times(
        &self,
        pair: Uuid,
        path: &str,
        local_abs: &Path,
        mtime: Option<SystemTime>,
        atime: Option<SystemTime>,
    ) -> Result<(), ServiceError> {
        if mtime.is_none() && atime.is_none() {
            return Ok(());
        }
        self.await_writable(pair, path).await?;
        let meta = tokio::fs::metadata(local_abs)
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?;
        let new_mtime = mtime.unwrap_or_else(|| meta.modified().unwrap_or_else(|_| SystemTime::now()));
        let new_atime = atime.unwrap_or_else(|| meta.accessed().unwrap_or_else(|_| SystemTime::now()));

        let target = local_abs.to_path_buf();
        tokio::task::spawn_blocking(move || {
            filetime::set_file_times(
                &target,
                filetime::FileTime::from_system_time(new_atime),
                filetime::FileTime::from_system_time(new_mtime),
            )
        })
        .await
        .map_err(|e| ServiceError::Internal(e.to_string()))?
        .map_err(|e| ServiceError::Internal(e.to_string()))?;

        if mtime.is_some() {
            self.touch_dirty(pair, path);
        } else {
            self.index.mutate(pair, path, |e| e.accessed_at = new_atime);
        }
        Ok(())
    }

    /// `unlink`: drops LOCAL from `Both` without propagating to EXTERNAL
    /// unless `enable_delete` is set (§4.6, §9 open question 1, §13.1).
    pub async fn unlink(
        &self,
        pair: Uuid,
        path: &str,
        local_abs: &Path,
        external_abs: Option<&Path>,
        enable_delete: bool,
    ) -> Result<(), ServiceError> {
        let entry = self
            .index
            .get(pair, path)
            .ok_or_else(|| ServiceError::FileNotFound(path.to_string()))?;

        match entry.location {
            Location::Both => {
                let _ = tokio::fs::remove_file(local_abs).await;
                if enable_delete {
                    if let Some(external) = external_abs {
                        if let Err(e) = tokio::fs::remove_file(external).await {
                            warn!(path, error = %e, "enable_delete: external removal failed, continuing");
                        }
                    }
                    self.index.remove(pair, path);
                } else {
                    self.index.mutate(pair, path, |e| {
                        e.location = Location::ExternalOnly;
                        e.clear_dirty();
                    });
                }
            }
            Location::LocalOnly => {
                let _ = tokio::fs::remove_file(local_abs).await;
                self.index.remove(pair, path);
            }
            Location::ExternalOnly => {
                if enable_delete {
                    if let Some(external) = external_abs {
                        tokio::fs::remove_file(external)
                            .await
                            .map_err(|e| ServiceError::Internal(e.to_string()))?;
                    }
                    self.index.remove(pair, path);
                } else {
                    return Err(ServiceError::FileNotFound(path.to_string()));
                }
            }
            Location::NotExists | Location::Deleted => {
                return Err(ServiceError::FileNotFound(path.to_string()))
            }
        }
        self.merge_view.invalidate(pair, path);
        Ok(())
    }

    /// `rename`: moves LOCAL (and EXTERNAL best-effort), re-keys the Index
    /// entry, and invalidates both prefixes (spec §4.6 scenario 5).
    pub async fn rename(
        &self,
        pair: Uuid,
        from_path: &str,
        to_path: &str,
        from_local: &Path,
        to_local: &Path,
        from_external: Option<&Path>,
        to_external: Option<&Path>,
    ) -> Result<(), ServiceError> {
        if let Some(parent) = to_local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ServiceError::Internal(e.to_string()))?;
        }
        if tokio::fs::metadata(from_local).await.is_ok() {
            tokio::fs::rename(from_local, to_local)
                .await
                .map_err(|e| ServiceError::Internal(e.to_string()))?;
        }

        if let (Some(from_ext), Some(to_ext)) = (from_external, to_external) {
            if tokio::fs::metadata(from_ext).await.is_ok() {
                if let Some(parent) = to_ext.parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                if let Err(e) = tokio::fs::rename(from_ext, to_ext).await {
                    warn!(from_path, to_path, error = %e, "best-effort external rename failed");
                }
            }
        }

        self.index.rekey(pair, from_path, to_path);
        self.merge_view.invalidate_rename(pair, from_path, to_path);
        info!(from_path, to_path, "renamed");
        Ok(())
    }

    /// Invariant 3 (§3): `is_dirty ⇒ location ∈ {LocalOnly, Both}`. An
    /// `ExternalOnly` entry being written (the file was pulled to LOCAL by
    /// `open`'s write-intent path before the write reached us) becomes
    /// `Both`; anything else that isn't already `LocalOnly`/`Both` becomes
    /// `LocalOnly`.
    fn apply_dirty(&self, pair: Uuid, path: &str, size: i64) {
        let existing = self.index.get(pair, path);
        if existing.is_none() {
            self.index.upsert(pair, path, {
                let mut e = FileEntry::new_file(path, Location::LocalOnly, size);
                e.mark_dirty();
                e
            });
        } else {
            self.index.mutate(pair, path, |e| {
                e.location = match e.location {
                    Location::ExternalOnly => Location::Both,
                    Location::LocalOnly | Location::Both => e.location,
                    Location::NotExists | Location::Deleted => Location::LocalOnly,
                };
                e.size = size;
                e.modified_at = std::time::SystemTime::now();
                e.mark_dirty();
            });
        }
        self.merge_view.invalidate(pair, path);
    }

    /// Marks an entry dirty without touching its recorded size, for
    /// metadata-only writes (xattr, mtime) that don't change file bytes.
    fn touch_dirty(&self, pair: Uuid, path: &str) {
        self.index.mutate(pair, path, |e| {
            e.location = match e.location {
                Location::ExternalOnly => Location::Both,
                Location::LocalOnly | Location::Both => e.location,
                Location::NotExists | Location::Deleted => Location::LocalOnly,
            };
            e.mark_dirty();
        });
        self.merge_view.invalidate(pair, path);
        self.debounce_sync_notify(pair);
    }

    /// Waits for an `L→E` lock to clear; preempts (cancels) an `E→L` pull
    /// by simply proceeding, per §4.6 ("a running reconcile is preempted
    /// by a new local edit").
    async fn await_writable(&self, pair: Uuid, path: &str) -> Result<(), ServiceError> {
        match self.locks.direction_of(pair, path) {
            Some(LockDirection::LocalToExternal) => {
                // Poll-wait for the reconcile to release; a bare acquire+drop
                // would itself race a fresh writer in, so we use the lock
                // manager's own timeout mechanism and immediately release.
                let guard = self
                    .locks
                    .acquire(pair, path, LockDirection::LocalToExternal, WRITE_WAIT_TIMEOUT)
                    .await?;
                drop(guard);
                Ok(())
            }
            Some(LockDirection::ExternalToLocal) | None => Ok(()),
        }
    }

    fn debounce_sync_notify(&self, pair: Uuid) {
        let _ = self.dirty_notify.try_send(pair);
    }
}

#[cfg(target_os = "linux")]
fn set_xattr_blocking(path: &Path, name: &OsStr, value: &[u8], flags: i32) -> Result<(), ServiceError> {
    use std::ffi::CString;
    let c_path = CString::new(path.as_os_str().as_encoded_bytes()).map_err(|e| ServiceError::Internal(e.to_string()))?;
    let c_name = CString::new(name.as_encoded_bytes()).map_err(|e| ServiceError::Internal(e.to_string()))?;
    let rc = unsafe {
        libc::setxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            flags,
        )
    };
    if rc != 0 {
        return Err(ServiceError::Internal(std::io::Error::last_os_error().to_string()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_xattr_blocking(_path: &Path, _name: &OsStr, _value: &[u8], _flags: i32) -> Result<(), ServiceError> {
    Err(ServiceError::Internal("xattr not supported on this platform".to_string()))
}

#[cfg(target_os = "linux")]
fn remove_xattr_blocking(path: &Path, name: &OsStr) -> Result<(), ServiceError> {
    use std::ffi::CString;
    let c_path = CString::new(path.as_os_str().as_encoded_bytes()).map_err(|e| ServiceError::Internal(e.to_string()))?;
    let c_name = CString::new(name.as_encoded_bytes()).map_err(|e| ServiceError::Internal(e.to_string()))?;
    let rc = unsafe { libc::removexattr(c_path.as_ptr(), c_name.as_ptr()) };
    if rc != 0 {
        return Err(ServiceError::Internal(std::io::Error::last_os_error().to_string()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn remove_xattr_blocking(_path: &Path, _name: &OsStr) -> Result<(), ServiceError> {
    Err(ServiceError::Internal("xattr not supported on this platform".to_string()))
}
