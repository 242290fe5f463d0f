//! Root-only file-tree operations, each validated against the PathResolver
//! allow/deny lists before it touches anything (spec §4.12).

use std::path::Path;

use tracing::info;

use crate::error::ServiceError;
use crate::path_resolver::PathResolver;

pub struct PrivilegedOps {
    resolver: PathResolver,
}

impl PrivilegedOps {
    pub fn new(resolver: PathResolver) -> Self {
        PrivilegedOps { resolver }
    }

    pub async fn lock_directory(&self, path: &Path) -> Result<(), ServiceError> {
        self.resolver.check_privileged(path)?;
        set_immutable(path, true)?;
        info!(path = %path.display(), "directory locked (immutable)");
        Ok(())
    }

    pub async fn unlock_directory(&self, path: &Path) -> Result<(), ServiceError> {
        self.resolver.check_privileged(path)?;
        set_immutable(path, false)?;
        info!(path = %path.display(), "directory unlocked");
        Ok(())
    }

    pub async fn set_acl(&self, path: &Path, deny: bool, perms: &str, user: &str) -> Result<(), ServiceError> {
        self.resolver.check_privileged(path)?;
        set_deny_write_acl(path, deny, perms, user)?;
        info!(path = %path.display(), user, "deny-write ACL installed");
        Ok(())
    }

    pub async fn remove_acl(&self, path: &Path, user: &str) -> Result<(), ServiceError> {
        self.resolver.check_privileged(path)?;
        remove_acl_entry(path, user)?;
        info!(path = %path.display(), user, "ACL entry removed");
        Ok(())
    }

    pub async fn hide_directory(&self, path: &Path) -> Result<(), ServiceError> {
        self.resolver.check_privileged(path)?;
        set_hidden(path, true)?;
        Ok(())
    }

    pub async fn unhide_directory(&self, path: &Path) -> Result<(), ServiceError> {
        self.resolver.check_privileged(path)?;
        set_hidden(path, false)?;
        Ok(())
    }

    /// Composite applied once to the user's original directory before it
    /// becomes `*_Local` (spec §4.12, §6 "one-time rename").
    pub async fn protect_directory(&self, path: &Path) -> Result<(), ServiceError> {
        self.hide_directory(path).await?;
        self.lock_directory(path).await?;
        Ok(())
    }

    pub async fn unprotect_directory(&self, path: &Path) -> Result<(), ServiceError> {
        self.unlock_directory(path).await?;
        self.unhide_directory(path).await?;
        Ok(())
    }

    pub async fn create_directory(&self, path: &Path) -> Result<(), ServiceError> {
        self.resolver.check_privileged(path)?;
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))
    }

    /// Elevated move used only for the one-time rename into `*_Local`
    /// (spec §4.12).
    pub async fn move_item(&self, from: &Path, to: &Path) -> Result<(), ServiceError> {
        self.resolver.check_privileged(from)?;
        self.resolver.check_privileged(to)?;
        tokio::fs::rename(from, to)
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))
    }

    pub async fn remove_item(&self, path: &Path) -> Result<(), ServiceError> {
        self.resolver.check_privileged(path)?;
        if tokio::fs::metadata(path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            tokio::fs::remove_dir_all(path)
                .await
                .map_err(|e| ServiceError::Internal(e.to_string()))
        } else {
            tokio::fs::remove_file(path)
                .await
                .map_err(|e| ServiceError::Internal(e.to_string()))
        }
    }
}

#[cfg(target_os = "linux")]
fn set_immutable(path: &Path, immutable: bool) -> Result<(), ServiceError> {
    use std::fs::OpenOptions;
    use std::os::unix::io::AsRawFd;

    const FS_IOC_GETFLAGS: libc::c_ulong = 0x8008_0001 as libc::c_ulong; // best-effort ioctl numbers
    const FS_IOC_SETFLAGS: libc::c_ulong = 0x4008_0002 as libc::c_ulong;
    const FS_IMMUTABLE_FL: libc::c_long = 0x0000_0010;

    let file = OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|e| ServiceError::Internal(e.to_string()))?;
    let fd = file.as_raw_fd();

    let mut flags: libc::c_long = 0;
    let rc = unsafe { libc::ioctl(fd, FS_IOC_GETFLAGS, &mut flags) };
    if rc != 0 {
        return Err(ServiceError::InsufficientPrivileges);
    }

    if immutable {
        flags |= FS_IMMUTABLE_FL;
    } else {
        flags &= !FS_IMMUTABLE_FL;
    }

    let rc = unsafe { libc::ioctl(fd, FS_IOC_SETFLAGS, &flags) };
    if rc != 0 {
        return Err(ServiceError::InsufficientPrivileges);
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_immutable(_path: &Path, _immutable: bool) -> Result<(), ServiceError> {
    Err(ServiceError::InsufficientPrivileges)
}

#[cfg(unix)]
fn set_deny_write_acl(path: &Path, deny: bool, perms: &str, user: &str) -> Result<(), ServiceError> {
    use exacl::{AclEntry, AclEntryKind, Perm};

    let uid = resolve_uid(user)?;
    let mut acl = exacl::getfacl(path, None).map_err(|e| ServiceError::Internal(e.to_string()))?;

    let mut perm_set = Perm::empty();
    if perms.contains('w') {
        perm_set |= Perm::WRITE;
    }
    if perms.contains('r') {
        perm_set |= Perm::READ;
    }
    if perms.contains('x') {
        perm_set |= Perm::EXECUTE;
    }

    acl.retain(|e| e.name != user || e.kind != AclEntryKind::User);
    let mut entry = AclEntry::allow_user(&user.to_string(), perm_set, None);
    if deny {
        entry.flags = exacl::Flag::empty();
        entry.allow = false;
    }
    let _ = uid;
    acl.push(entry);
    exacl::setfacl(&[path], &acl, None).map_err(|e| ServiceError::Internal(e.to_string()))
}

#[cfg(not(unix))]
fn set_deny_write_acl(_path: &Path, _deny: bool, _perms: &str, _user: &str) -> Result<(), ServiceError> {
    Err(ServiceError::InsufficientPrivileges)
}

#[cfg(unix)]
fn remove_acl_entry(path: &Path, user: &str) -> Result<(), ServiceError> {
    use exacl::AclEntryKind;
    let mut acl = exacl::getfacl(path, None).map_err(|e| ServiceError::Internal(e.to_string()))?;
    acl.retain(|e| !(e.name == user && e.kind == AclEntryKind::User));
    exacl::setfacl(&[path], &acl, None).map_err(|e| ServiceError::Internal(e.to_string()))
}

#[cfg(not(unix))]
fn remove_acl_entry(_path: &Path, _user: &str) -> Result<(), ServiceError> {
    Err(ServiceError::InsufficientPrivileges)
}

#[cfg(unix)]
fn resolve_uid(user: &str) -> Result<u32, ServiceError> {
    user.parse::<u32>()
        .map_err(|_| ServiceError::InvalidPath(format!("unknown user: {user}")))
}

#[cfg(target_os = "macos")]
fn set_hidden(path: &Path, hidden: bool) -> Result<(), ServiceError> {
    use std::ffi::CString;
    let c_path = CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|e| ServiceError::Internal(e.to_string()))?;
    let flags = if hidden { libc::UF_HIDDEN } else { 0 };
    let rc = unsafe { libc::chflags(c_path.as_ptr(), flags as libc::c_ulong) };
    if rc != 0 {
        return Err(ServiceError::InsufficientPrivileges);
    }
    Ok(())
}

#[cfg(not(target_os = "macos"))]
fn set_hidden(path: &Path, hidden: bool) -> Result<(), ServiceError> {
    // No native hidden-flag on this platform; fall back to the dotfile
    // convention by renaming is out of scope here (rename is a WriteRouter
    // concern) — report unsupported rather than silently no-op.
    let _ = (path, hidden);
    Err(ServiceError::InsufficientPrivileges)
}
