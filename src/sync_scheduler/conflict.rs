//! Conflict resolution policies applied during reconcile (spec §4.8).

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;

use crate::error::ServiceError;
use crate::model::ConflictStrategy;

/// Outcome of applying a [`ConflictStrategy`] to a conflicting pair of
/// files. `Defer` means the policy is `AskUser` and the caller must leave
/// the entry dirty until an IPC resolution request arrives (spec §4.8,
/// §7: "a disabled auto-resolution policy must block").
pub enum Resolution {
    /// Proceed copying LOCAL over EXTERNAL at `external_target` (which may
    /// differ from the original EXTERNAL path, e.g. after a rename-aside).
    ProceedLocalToExternal { external_target: PathBuf },
    /// Proceed copying EXTERNAL over LOCAL instead (policy favoured the
    /// external/newer/larger file).
    ProceedExternalToLocal,
    /// Keep both: LOCAL is copied to EXTERNAL under a new name, the
    /// original EXTERNAL file is untouched.
    KeepBoth { external_target: PathBuf },
    Defer,
}

pub struct ConflictContext<'a> {
    pub strategy: ConflictStrategy,
    pub external_abs: &'a Path,
    pub local_size: u64,
    pub local_mtime: SystemTime,
    pub external_size: u64,
    pub external_mtime: SystemTime,
}

/// Decides how to resolve a detected conflict (spec §4.8: policy table).
pub fn resolve(ctx: ConflictContext<'_>) -> Resolution {
    let ts = ctx
        .local_mtime
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    match ctx.strategy {
        ConflictStrategy::LocalWinsWithBackup => {
            let backup = backup_path(ctx.external_abs, ts);
            info!(path = %ctx.external_abs.display(), backup = %backup.display(), "conflict: local wins with backup");
            Resolution::ProceedLocalToExternal {
                external_target: ctx.external_abs.to_path_buf(),
            }
            .with_backup(backup)
        }
        ConflictStrategy::ExternalWins => Resolution::ProceedExternalToLocal,
        ConflictStrategy::NewerWins => {
            if ctx.local_mtime >= ctx.external_mtime {
                Resolution::ProceedLocalToExternal {
                    external_target: ctx.external_abs.to_path_buf(),
                }
            } else {
                Resolution::ProceedExternalToLocal
            }
        }
        ConflictStrategy::LargerWins => {
            if ctx.local_size >= ctx.external_size {
                Resolution::ProceedLocalToExternal {
                    external_target: ctx.external_abs.to_path_buf(),
                }
            } else {
                Resolution::ProceedExternalToLocal
            }
        }
        ConflictStrategy::KeepBoth => Resolution::KeepBoth {
            external_target: backup_path(ctx.external_abs, ts),
        },
        ConflictStrategy::AskUser => Resolution::Defer,
    }
}

fn backup_path(original: &Path, ts: u64) -> PathBuf {
    let file_name = original
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    original.with_file_name(format!("{file_name}_backup_{ts}"))
}

impl Resolution {
    /// Helper so `LocalWinsWithBackup` can carry its backup path alongside
    /// the "proceed" decision without a third enum arm.
    fn with_backup(self, backup: PathBuf) -> Self {
        match self {
            Resolution::ProceedLocalToExternal { .. } => {
                Resolution::ProceedLocalToExternal { external_target: backup }
            }
            other => other,
        }
    }
}

/// Performs the filesystem side of a resolved conflict: rename-aside plus
/// copy, returning the absolute path LOCAL bytes end up at. Used by
/// [`super::SyncScheduler`] once [`resolve`] has decided a policy.
pub async fn apply_resolution(
    resolution: &Resolution,
    local_abs: &Path,
    external_abs: &Path,
) -> Result<PathBuf, ServiceError> {
    match resolution {
        Resolution::ProceedLocalToExternal { external_target } => {
            if external_target != external_abs && tokio::fs::metadata(external_abs).await.is_ok() {
                tokio::fs::rename(external_abs, external_target)
                    .await
                    .map_err(|e| ServiceError::Internal(e.to_string()))?;
            }
            Ok(external_abs.to_path_buf())
        }
        Resolution::KeepBoth { external_target } => {
            if tokio::fs::metadata(external_abs).await.is_ok() {
                tokio::fs::rename(external_abs, external_target)
                    .await
                    .map_err(|e| ServiceError::Internal(e.to_string()))?;
            }
            let _ = local_abs;
            Ok(external_abs.to_path_buf())
        }
        Resolution::ProceedExternalToLocal => Ok(external_abs.to_path_buf()),
        Resolution::Defer => Err(ServiceError::Conflict(
            external_abs.display().to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ctx(strategy: ConflictStrategy) -> ConflictContext<'static> {
        ConflictContext {
            strategy,
            external_abs: Path::new("/external/c.bin"),
            local_size: 20,
            local_mtime: UNIX_EPOCH + Duration::from_secs(200),
            external_size: 10,
            external_mtime: UNIX_EPOCH + Duration::from_secs(100),
        }
    }

    #[test]
    fn local_wins_with_backup_renames_aside() {
        match resolve(ctx(ConflictStrategy::LocalWinsWithBackup)) {
            Resolution::ProceedLocalToExternal { external_target } => {
                assert!(external_target.to_string_lossy().contains("_backup_"));
            }
            _ => panic!("expected ProceedLocalToExternal"),
        }
    }

    #[test]
    fn ask_user_defers() {
        assert!(matches!(resolve(ctx(ConflictStrategy::AskUser)), Resolution::Defer));
    }

    #[test]
    fn newer_wins_picks_local_when_local_is_newer() {
        assert!(matches!(
            resolve(ctx(ConflictStrategy::NewerWins)),
            Resolution::ProceedLocalToExternal { .. }
        ));
    }
}
