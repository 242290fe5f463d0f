//! Error taxonomy shared by every component.
//!
//! Mirrors the shape of [`crate`]'s component errors onto the recoverable /
//! fatal split from spec §7, the POSIX errno mapping from §4.10, and the
//! numeric IPC error ranges from §6.

use num_derive::{FromPrimitive, ToPrimitive};
use thiserror::Error;

/// Top-level error type every component error converts into.
#[derive(Debug, Error, Clone)]
pub enum ServiceError {
    #[error("path rejected: {0}")]
    InvalidPath(String),
    #[error("path not permitted: {0}")]
    PermissionDenied(String),
    #[error("no such file: {0}")]
    FileNotFound(String),
    #[error("write timed out waiting for lock on {0}")]
    WriteTimeout(String),
    #[error("file busy: {0}")]
    FileBusy(String),
    #[error("external store unreachable")]
    ExternalOffline,
    #[error("insufficient space on local store")]
    InsufficientSpace,
    #[error("eviction could not free enough space ({freed_bytes} of {requested_bytes} bytes)")]
    EvictionFailed { freed_bytes: u64, requested_bytes: u64 },
    #[error("checksum mismatch for {0}")]
    ChecksumMismatch(String),
    #[error("metadata corrupt: {0}")]
    MetadataCorrupt(String),
    #[error("lock unavailable for {0}")]
    LockFailure(String),
    #[error("index store corrupted: {0}")]
    DbCorrupted(String),
    #[error("database write failed: {0}")]
    DbWriteFailed(String),
    #[error("source unavailable for {0}")]
    SourceUnavailable(String),
    #[error("target is read-only")]
    TargetReadonly,
    #[error("unresolved conflict on {0}")]
    Conflict(String),
    #[error("configuration conflict: {0}")]
    ConfigConflict(String),
    #[error("FUSE could not be mounted: {0}")]
    MountFailed(String),
    #[error("insufficient privileges for this operation")]
    InsufficientPrivileges,
    #[error("IPC request timed out")]
    XpcTimeout,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Whether the taxonomy (§7) classifies this error as retryable rather
    /// than terminal for the owning component.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            ServiceError::ExternalOffline
                | ServiceError::FileBusy(_)
                | ServiceError::WriteTimeout(_)
                | ServiceError::LockFailure(_)
                | ServiceError::InsufficientSpace
                | ServiceError::DbWriteFailed(_)
                | ServiceError::ConfigConflict(_)
                | ServiceError::SourceUnavailable(_)
                | ServiceError::Conflict(_)
        )
    }

    /// POSIX errno this error surfaces through the FUSE bridge (§4.10).
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            ServiceError::FileNotFound(_) => libc::ENOENT,
            ServiceError::PermissionDenied(_) | ServiceError::InsufficientPrivileges => libc::EACCES,
            ServiceError::WriteTimeout(_) | ServiceError::FileBusy(_) => libc::EBUSY,
            ServiceError::ExternalOffline => libc::ENODEV,
            ServiceError::InsufficientSpace
            | ServiceError::EvictionFailed { .. } => libc::ENOSPC,
            ServiceError::ChecksumMismatch(_) | ServiceError::MetadataCorrupt(_) => libc::EIO,
            ServiceError::InvalidPath(_) => libc::EINVAL,
            ServiceError::LockFailure(_) => libc::EAGAIN,
            _ => libc::EIO,
        }
    }

    /// Numeric IPC error code (§6: "1xxx IPC, 2xxx config, 3xxx VFS, 4xxx
    /// index, 5xxx sync, 6xxx database").
    pub fn to_code(&self) -> ErrorCode {
        use ErrorCode::*;
        match self {
            ServiceError::XpcTimeout => IpcTimeout,
            ServiceError::ConfigConflict(_) => ConfigConflict,
            ServiceError::InvalidPath(_) => VfsInvalidPath,
            ServiceError::PermissionDenied(_) | ServiceError::InsufficientPrivileges => VfsPermissionDenied,
            ServiceError::FileNotFound(_) => VfsFileNotFound,
            ServiceError::DbCorrupted(_) => IndexCorrupted,
            ServiceError::DbWriteFailed(_) => IndexWriteFailed,
            ServiceError::ExternalOffline => SyncExternalOffline,
            ServiceError::WriteTimeout(_) | ServiceError::FileBusy(_) | ServiceError::LockFailure(_) => SyncLockTimeout,
            ServiceError::Conflict(_) => SyncConflict,
            ServiceError::InsufficientSpace | ServiceError::EvictionFailed { .. } => SyncInsufficientSpace,
            ServiceError::ChecksumMismatch(_) | ServiceError::MetadataCorrupt(_) => DatabaseChecksumMismatch,
            ServiceError::TargetReadonly => SyncTargetReadonly,
            ServiceError::SourceUnavailable(_) => SyncSourceUnavailable,
            ServiceError::MountFailed(_) => VfsMountFailed,
            ServiceError::Internal(_) => IpcInternal,
        }
    }
}

/// Numeric error codes exposed to external (IPC) callers (§6).
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(i32)]
pub enum ErrorCode {
    IpcTimeout = 1001,
    IpcInternal = 1002,
    ConfigConflict = 2001,
    ConfigInvalid = 2002,
    VfsInvalidPath = 3001,
    VfsPermissionDenied = 3002,
    VfsFileNotFound = 3003,
    VfsMountFailed = 3004,
    IndexCorrupted = 4001,
    IndexWriteFailed = 4002,
    SyncExternalOffline = 5001,
    SyncLockTimeout = 5002,
    SyncConflict = 5003,
    SyncInsufficientSpace = 5004,
    SyncTargetReadonly = 5005,
    SyncSourceUnavailable = 5006,
    DatabaseChecksumMismatch = 6001,
}

/// Structured error payload returned over the `ControlPlane` (§6).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IpcError {
    pub code: i32,
    pub message: String,
    pub component: Option<String>,
    pub recoverable: bool,
    pub context: Option<String>,
}

impl IpcError {
    pub fn from_service_error(component: &str, err: &ServiceError) -> Self {
        use num_traits::ToPrimitive;
        IpcError {
            code: err.to_code().to_i32().unwrap_or(1002),
            message: err.to_string(),
            component: Some(component.to_string()),
            recoverable: err.recoverable(),
            context: None,
        }
    }
}
