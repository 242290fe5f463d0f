//! The one [`fuse3::path::PathFilesystem`] implementation bridging FUSE
//! calls onto [`crate::merge_view::MergeView`], [`crate::read_router`], and
//! [`crate::write_router`] (spec §4.10, §13.3: exactly one bridge).

mod handles;

use std::collections::HashSet;
use std::ffi::OsStr;
use std::num::NonZeroU32;
use std::path::Path;
use std::time::{Duration, SystemTime};

use fuse3::path::prelude::*;
use fuse3::{Errno, FileType, MountOptions, Session};
use futures::stream;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::ServiceError;
use crate::merge_view::{MergedAttr, MergeView};
use crate::model::SyncPair;
use crate::path_resolver::PathResolver;
use crate::read_router::{ReadRouter, ReadSource};
use crate::sync_scheduler::PairRoots;
use crate::write_router::WriteRouter;

pub use handles::HandleTable;

/// Kernel attribute-cache TTL (spec §4.4 mirrors this for its own cache).
const ATTR_TTL: Duration = Duration::from_secs(5);
const PERM_FILE: u16 = 0o644;
const PERM_DIR: u16 = 0o755;

pub struct TierFs {
    pair: SyncPair,
    index: std::sync::Arc<crate::index::Index>,
    merge_view: std::sync::Arc<MergeView>,
    read_router: std::sync::Arc<ReadRouter>,
    write_router: std::sync::Arc<WriteRouter>,
    resolver: std::sync::Arc<PathResolver>,
    roots: std::sync::Arc<dyn PairRoots>,
    config: std::sync::Arc<RwLock<SyncConfig>>,
    handles: HandleTable,
    uid: u32,
    gid: u32,
    mount_time: SystemTime,
}

impl TierFs {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pair: SyncPair,
        index: std::sync::Arc<crate::index::Index>,
        merge_view: std::sync::Arc<MergeView>,
        read_router: std::sync::Arc<ReadRouter>,
        write_router: std::sync::Arc<WriteRouter>,
        resolver: std::sync::Arc<PathResolver>,
        roots: std::sync::Arc<dyn PairRoots>,
        config: std::sync::Arc<RwLock<SyncConfig>>,
    ) -> Self {
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        TierFs {
            pair,
            index,
            merge_view,
            read_router,
            write_router,
            resolver,
            roots,
            config,
            handles: HandleTable::new(),
            uid,
            gid,
            mount_time: SystemTime::now(),
        }
    }

    /// Mounts at `mountpoint` (the renamed `*_Local` swap target's original
    /// name) and blocks until unmounted (spec §6, §4.12).
    pub async fn mount(self, mountpoint: &Path) -> std::io::Result<()> {
        let mut opts = MountOptions::default();
        opts.fs_name("tierfs");
        opts.force_readdir_plus(true);

        info!(mountpoint = %mountpoint.display(), "mounting tierfs");
        let handle = Session::new(opts)
            .mount_with_unprivileged(self, mountpoint)
            .await?;
        handle.await
    }

    fn virtual_path(path: &OsStr) -> Result<String, ServiceError> {
        let s = path
            .to_str()
            .ok_or_else(|| ServiceError::InvalidPath("non-utf8 path".to_string()))?;
        Ok(s.trim_start_matches('/').to_string())
    }

    async fn resolve_both(&self, vpath: &str) -> Result<(std::path::PathBuf, Option<std::path::PathBuf>), ServiceError> {
        self.resolver.validate(vpath)?;
        let (local_root, external_root) = self
            .roots
            .roots(&self.pair)
            .await
            .ok_or(ServiceError::ExternalOffline)?;
        let local_abs = local_root.join(vpath);
        let external_abs = external_root.map(|root| root.join(vpath));
        Ok((local_abs, external_abs))
    }

    fn attr_from(&self, attr: &MergedAttr) -> FileAttr {
        let size = attr.size.max(0) as u64;
        FileAttr {
            size,
            blocks: size.div_ceil(512),
            atime: attr.accessed_at,
            mtime: attr.modified_at,
            ctime: attr.modified_at,
            #[cfg(target_os = "macos")]
            crtime: attr.modified_at,
            kind: if attr.is_directory { FileType::Directory } else { FileType::RegularFile },
            perm: if attr.is_directory { PERM_DIR } else { PERM_FILE },
            nlink: if attr.is_directory { 2 } else { 1 },
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
            #[cfg(target_os = "macos")]
            flags: 0,
        }
    }

    fn root_attr(&self) -> FileAttr {
        FileAttr {
            size: 0,
            blocks: 0,
            atime: self.mount_time,
            mtime: self.mount_time,
            ctime: self.mount_time,
            #[cfg(target_os = "macos")]
            crtime: self.mount_time,
            kind: FileType::Directory,
            perm: PERM_DIR,
            nlink: 2,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
            #[cfg(target_os = "macos")]
            flags: 0,
        }
    }
}

impl PathFilesystem for TierFs {
    async fn init(&self, _req: Request) -> fuse3::Result<ReplyInit> {
        debug!(pair = %self.pair.id, "tierfs init");
        Ok(ReplyInit {
            max_write: NonZeroU32::new(1024 * 1024).unwrap(),
        })
    }

    async fn destroy(&self, _req: Request) {
        info!(pair = %self.pair.id, "tierfs unmounted");
    }

    async fn getattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        _fh: Option<u64>,
        _flags: u32,
    ) -> fuse3::Result<ReplyAttr> {
        let Some(path) = path else {
            return Err(Errno::from(libc::EINVAL));
        };
        let vpath = Self::virtual_path(path).map_err(|e| Errno::from(e.to_errno()))?;
        if vpath.is_empty() {
            return Ok(ReplyAttr { ttl: ATTR_TTL, attr: self.root_attr() });
        }
        match self.merge_view.get_attributes(self.pair.id, &vpath) {
            Some(attr) => Ok(ReplyAttr { ttl: ATTR_TTL, attr: self.attr_from(&attr) }),
            None => Err(Errno::from(libc::ENOENT)),
        }
    }

    async fn lookup(&self, _req: Request, parent: &OsStr, name: &OsStr) -> fuse3::Result<ReplyEntry> {
        let parent_vpath = Self::virtual_path(parent).map_err(|e| Errno::from(e.to_errno()))?;
        let name = name.to_str().ok_or(Errno::from(libc::EINVAL))?;
        let vpath = if parent_vpath.is_empty() {
            name.to_string()
        } else {
            format!("{parent_vpath}/{name}")
        };
        match self.merge_view.get_attributes(self.pair.id, &vpath) {
            Some(attr) => Ok(ReplyEntry { ttl: ATTR_TTL, attr: self.attr_from(&attr) }),
            None => Err(Errno::from(libc::ENOENT)),
        }
    }

    type DirEntryStream<'a>
        = stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntry>>>
    where
        Self: 'a;
    type DirEntryPlusStream<'a>
        = stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntryPlus>>>
    where
        Self: 'a;

    async fn opendir(&self, _req: Request, _path: &OsStr, _flags: u32) -> fuse3::Result<ReplyOpen> {
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        path: &'a OsStr,
        _fh: u64,
        offset: i64,
    ) -> fuse3::Result<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let vpath = Self::virtual_path(path).map_err(|e| Errno::from(e.to_errno()))?;
        let mut entries = Vec::new();
        let mut next = 0i64;
        for name in [".", ".."] {
            if next >= offset {
                entries.push(Ok(DirectoryEntry { kind: FileType::Directory, name: name.into(), offset: next + 1 }));
            }
            next += 1;
        }
        for name in self.merge_view.list_directory(self.pair.id, &vpath) {
            if next >= offset {
                let child_vpath = if vpath.is_empty() { name.clone() } else { format!("{vpath}/{name}") };
                let kind = match self.merge_view.get_attributes(self.pair.id, &child_vpath) {
                    Some(attr) if attr.is_directory => FileType::Directory,
                    _ => FileType::RegularFile,
                };
                entries.push(Ok(DirectoryEntry { kind, name: name.into(), offset: next + 1 }));
            }
            next += 1;
        }
        Ok(ReplyDirectory { entries: stream::iter(entries) })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        path: &'a OsStr,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> fuse3::Result<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let vpath = Self::virtual_path(path).map_err(|e| Errno::from(e.to_errno()))?;
        let offset = offset as i64;
        let mut entries = Vec::new();
        let mut next = 0i64;
        let dot_attr = self.root_attr();
        for name in [".", ".."] {
            if next >= offset {
                entries.push(Ok(DirectoryEntryPlus {
                    kind: FileType::Directory,
                    name: name.into(),
                    offset: next + 1,
                    attr: dot_attr,
                    entry_ttl: ATTR_TTL,
                    attr_ttl: ATTR_TTL,
                }));
            }
            next += 1;
        }
        let mut seen = HashSet::new();
        for name in self.merge_view.list_directory(self.pair.id, &vpath) {
            if !seen.insert(name.clone()) {
                continue;
            }
            let child_vpath = if vpath.is_empty() { name.clone() } else { format!("{vpath}/{name}") };
            let Some(attr) = self.merge_view.get_attributes(self.pair.id, &child_vpath) else {
                next += 1;
                continue;
            };
            if next >= offset {
                entries.push(Ok(DirectoryEntryPlus {
                    kind: if attr.is_directory { FileType::Directory } else { FileType::RegularFile },
                    name: name.into(),
                    offset: next + 1,
                    attr: self.attr_from(&attr),
                    entry_ttl: ATTR_TTL,
                    attr_ttl: ATTR_TTL,
                }));
            }
            next += 1;
        }
        Ok(ReplyDirectoryPlus { entries: stream::iter(entries) })
    }

    async fn releasedir(&self, _req: Request, _path: &OsStr, _fh: u64, _flags: u32) -> fuse3::Result<()> {
        Ok(())
    }

    async fn open(&self, _req: Request, path: &OsStr, flags: u32) -> fuse3::Result<ReplyOpen> {
        let vpath = Self::virtual_path(path).map_err(|e| Errno::from(e.to_errno()))?;
        let entry = self.index.get(self.pair.id, &vpath).ok_or(Errno::from(libc::ENOENT))?;

        // Write-intent opens must pull an ExternalOnly file to LOCAL before
        // the kernel's first `write` lands, or that write would overwrite
        // whatever partial content a bare read pull left behind (spec §4.10).
        let access_mode = (flags as i32) & libc::O_ACCMODE;
        let write_intent = access_mode == libc::O_WRONLY || access_mode == libc::O_RDWR;
        if write_intent && entry.location == crate::model::Location::ExternalOnly {
            let (local_abs, external_abs) = self.resolve_both(&vpath).await.map_err(|e| Errno::from(e.to_errno()))?;
            self.read_router
                .route(self.pair.id, &vpath, &local_abs, external_abs.as_deref(), true)
                .await
                .map_err(|e| Errno::from(e.to_errno()))?;
        }

        let fh = self.handles.open(self.pair.id, vpath).await;
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn create(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
        _mode: u32,
        _flags: u32,
    ) -> fuse3::Result<ReplyCreated> {
        let parent_vpath = Self::virtual_path(parent).map_err(|e| Errno::from(e.to_errno()))?;
        let name = name.to_str().ok_or(Errno::from(libc::EINVAL))?;
        let vpath = if parent_vpath.is_empty() { name.to_string() } else { format!("{parent_vpath}/{name}") };

        let (local_abs, _) = self.resolve_both(&vpath).await.map_err(|e| Errno::from(e.to_errno()))?;
        self.write_router
            .create(self.pair.id, &vpath, &local_abs)
            .await
            .map_err(|e| Errno::from(e.to_errno()))?;

        let attr = self
            .merge_view
            .get_attributes(self.pair.id, &vpath)
            .ok_or(Errno::from(libc::EIO))?;
        let fh = self.handles.open(self.pair.id, vpath).await;
        Ok(ReplyCreated { ttl: ATTR_TTL, attr: self.attr_from(&attr), generation: 0, fh, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> fuse3::Result<ReplyData> {
        let vpath = match path {
            Some(p) => Self::virtual_path(p).map_err(|e| Errno::from(e.to_errno()))?,
            None => self.handles.get(fh).await.ok_or(Errno::from(libc::EBADF))?.virtual_path,
        };
        let (local_abs, external_abs) = self.resolve_both(&vpath).await.map_err(|e| Errno::from(e.to_errno()))?;

        let source = self
            .read_router
            .route(self.pair.id, &vpath, &local_abs, external_abs.as_deref(), true)
            .await
            .map_err(|e| Errno::from(e.to_errno()))?;

        let abs = match source {
            ReadSource::Local(p) | ReadSource::External(p) => p,
        };

        use tokio::io::{AsyncReadExt, AsyncSeekExt};
        let mut file = tokio::fs::File::open(&abs).await.map_err(|_| Errno::from(libc::EIO))?;
        file.seek(std::io::SeekFrom::Start(offset)).await.map_err(|_| Errno::from(libc::EIO))?;
        let mut buf = vec![0u8; size as usize];
        let n = file.read(&mut buf).await.map_err(|_| Errno::from(libc::EIO))?;
        buf.truncate(n);
        Ok(ReplyData { data: buf.into() })
    }

    async fn write(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> fuse3::Result<ReplyWrite> {
        let vpath = match path {
            Some(p) => Self::virtual_path(p).map_err(|e| Errno::from(e.to_errno()))?,
            None => self.handles.get(fh).await.ok_or(Errno::from(libc::EBADF))?.virtual_path,
        };
        let (local_abs, _) = self.resolve_both(&vpath).await.map_err(|e| Errno::from(e.to_errno()))?;
        let written = self
            .write_router
            .write(self.pair.id, &vpath, &local_abs, offset, data)
            .await
            .map_err(|e| Errno::from(e.to_errno()))?;
        Ok(ReplyWrite { written })
    }

    async fn release(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> fuse3::Result<()> {
        self.handles.close(fh).await;
        Ok(())
    }

    async fn flush(&self, _req: Request, _path: Option<&OsStr>, _fh: u64, _lock_owner: u64) -> fuse3::Result<()> {
        Ok(())
    }

    async fn fsync(&self, _req: Request, _path: &OsStr, _fh: u64, _datasync: bool) -> fuse3::Result<()> {
        Ok(())
    }

    async fn setattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> fuse3::Result<ReplyAttr> {
        let Some(path) = path else {
            return Err(Errno::from(libc::EINVAL));
        };
        let vpath = Self::virtual_path(path).map_err(|e| Errno::from(e.to_errno()))?;
        if set_attr.size.is_some() || set_attr.atime.is_some() || set_attr.mtime.is_some() {
            let (local_abs, _) = self.resolve_both(&vpath).await.map_err(|e| Errno::from(e.to_errno()))?;
            if let Some(size) = set_attr.size {
                self.write_router
                    .truncate(self.pair.id, &vpath, &local_abs, size)
                    .await
                    .map_err(|e| Errno::from(e.to_errno()))?;
            }
            if set_attr.atime.is_some() || set_attr.mtime.is_some() {
                self.write_router
                    .set_times(self.pair.id, &vpath, &local_abs, set_attr.mtime, set_attr.atime)
                    .await
                    .map_err(|e| Errno::from(e.to_errno()))?;
            }
        }
        let attr = self
            .merge_view
            .get_attributes(self.pair.id, &vpath)
            .ok_or(Errno::from(libc::ENOENT))?;
        Ok(ReplyAttr { ttl: ATTR_TTL, attr: self.attr_from(&attr) })
    }

    async fn getxattr(&self, _req: Request, path: &OsStr, name: &OsStr, size: u32) -> fuse3::Result<ReplyXAttr> {
        let vpath = Self::virtual_path(path).map_err(|e| Errno::from(e.to_errno()))?;
        let (local_abs, external_abs) = self.resolve_both(&vpath).await.map_err(|e| Errno::from(e.to_errno()))?;
        let chosen = chosen_read_path(&local_abs, external_abs.as_deref()).await;
        let value = get_xattr_blocking(&chosen, name).map_err(|e| Errno::from(e.raw_os_error().unwrap_or(libc::EIO)))?;
        if size == 0 {
            Ok(ReplyXAttr::Size(value.len() as u32))
        } else if value.len() > size as usize {
            Err(Errno::from(libc::ERANGE))
        } else {
            Ok(ReplyXAttr::Data(value.into()))
        }
    }

    async fn listxattr(&self, _req: Request, path: &OsStr, size: u32) -> fuse3::Result<ReplyXAttr> {
        let vpath = Self::virtual_path(path).map_err(|e| Errno::from(e.to_errno()))?;
        let (local_abs, external_abs) = self.resolve_both(&vpath).await.map_err(|e| Errno::from(e.to_errno()))?;
        let chosen = chosen_read_path(&local_abs, external_abs.as_deref()).await;
        let names = list_xattr_blocking(&chosen).map_err(|e| Errno::from(e.raw_os_error().unwrap_or(libc::EIO)))?;
        if size == 0 {
            Ok(ReplyXAttr::Size(names.len() as u32))
        } else if names.len() > size as usize {
            Err(Errno::from(libc::ERANGE))
        } else {
            Ok(ReplyXAttr::Data(names.into()))
        }
    }

    async fn setxattr(
        &self,
        _req: Request,
        path: &OsStr,
        name: &OsStr,
        value: &[u8],
        flags: u32,
        _position: u32,
    ) -> fuse3::Result<()> {
        let vpath = Self::virtual_path(path).map_err(|e| Errno::from(e.to_errno()))?;
        let (local_abs, _) = self.resolve_both(&vpath).await.map_err(|e| Errno::from(e.to_errno()))?;
        self.write_router
            .set_xattr(self.pair.id, &vpath, &local_abs, name, value, flags as i32)
            .await
            .map_err(|e| Errno::from(e.to_errno()))
    }

    async fn removexattr(&self, _req: Request, path: &OsStr, name: &OsStr) -> fuse3::Result<()> {
        let vpath = Self::virtual_path(path).map_err(|e| Errno::from(e.to_errno()))?;
        let (local_abs, _) = self.resolve_both(&vpath).await.map_err(|e| Errno::from(e.to_errno()))?;
        self.write_router
            .remove_xattr(self.pair.id, &vpath, &local_abs, name)
            .await
            .map_err(|e| Errno::from(e.to_errno()))
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
    ) -> fuse3::Result<ReplyEntry> {
        let parent_vpath = Self::virtual_path(parent).map_err(|e| Errno::from(e.to_errno()))?;
        let name = name.to_str().ok_or(Errno::from(libc::EINVAL))?;
        let vpath = if parent_vpath.is_empty() { name.to_string() } else { format!("{parent_vpath}/{name}") };
        let (local_abs, _) = self.resolve_both(&vpath).await.map_err(|e| Errno::from(e.to_errno()))?;
        self.write_router
            .make_dir(self.pair.id, &vpath, &local_abs)
            .await
            .map_err(|e| Errno::from(e.to_errno()))?;
        let attr = self
            .merge_view
            .get_attributes(self.pair.id, &vpath)
            .ok_or(Errno::from(libc::EIO))?;
        Ok(ReplyEntry { ttl: ATTR_TTL, attr: self.attr_from(&attr) })
    }

    async fn unlink(&self, _req: Request, parent: &OsStr, name: &OsStr) -> fuse3::Result<()> {
        let parent_vpath = Self::virtual_path(parent).map_err(|e| Errno::from(e.to_errno()))?;
        let name = name.to_str().ok_or(Errno::from(libc::EINVAL))?;
        let vpath = if parent_vpath.is_empty() { name.to_string() } else { format!("{parent_vpath}/{name}") };
        let (local_abs, external_abs) = self.resolve_both(&vpath).await.map_err(|e| Errno::from(e.to_errno()))?;
        let enable_delete = self.config.read().await.enable_delete;
        self.write_router
            .unlink(self.pair.id, &vpath, &local_abs, external_abs.as_deref(), enable_delete)
            .await
            .map_err(|e| Errno::from(e.to_errno()))
    }

    async fn rmdir(&self, req: Request, parent: &OsStr, name: &OsStr) -> fuse3::Result<()> {
        self.unlink(req, parent, name).await
    }

    async fn rename(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
        new_parent: &OsStr,
        new_name: &OsStr,
    ) -> fuse3::Result<()> {
        let parent_vpath = Self::virtual_path(parent).map_err(|e| Errno::from(e.to_errno()))?;
        let name = name.to_str().ok_or(Errno::from(libc::EINVAL))?;
        let from_vpath = if parent_vpath.is_empty() { name.to_string() } else { format!("{parent_vpath}/{name}") };

        let new_parent_vpath = Self::virtual_path(new_parent).map_err(|e| Errno::from(e.to_errno()))?;
        let new_name = new_name.to_str().ok_or(Errno::from(libc::EINVAL))?;
        let to_vpath = if new_parent_vpath.is_empty() {
            new_name.to_string()
        } else {
            format!("{new_parent_vpath}/{new_name}")
        };

        let (from_local, from_external) = self.resolve_both(&from_vpath).await.map_err(|e| Errno::from(e.to_errno()))?;
        let (to_local, to_external) = self.resolve_both(&to_vpath).await.map_err(|e| Errno::from(e.to_errno()))?;

        self.write_router
            .rename(
                self.pair.id,
                &from_vpath,
                &to_vpath,
                &from_local,
                &to_local,
                from_external.as_deref(),
                to_external.as_deref(),
            )
            .await
            .map_err(|e| Errno::from(e.to_errno()))
    }

    async fn statfs(&self, _req: Request, _path: &OsStr) -> fuse3::Result<ReplyStatFs> {
        let max_bytes = self.pair.max_local_cache_bytes.max(1);
        Ok(ReplyStatFs {
            blocks: max_bytes / 4096,
            bfree: max_bytes / 4096 / 2,
            bavail: max_bytes / 4096 / 2,
            files: 1 << 20,
            ffree: 1 << 19,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }
}

/// xattr reads delegate to whichever side currently holds the bytes, LOCAL
/// taking priority the same way [`MergeView::get_attributes`] prefers it.
async fn chosen_read_path(local_abs: &Path, external_abs: Option<&Path>) -> std::path::PathBuf {
    if tokio::fs::metadata(local_abs).await.is_ok() {
        local_abs.to_path_buf()
    } else if let Some(external) = external_abs {
        external.to_path_buf()
    } else {
        local_abs.to_path_buf()
    }
}

#[cfg(target_os = "linux")]
fn get_xattr_blocking(path: &Path, name: &OsStr) -> std::io::Result<Vec<u8>> {
    use std::ffi::CString;
    let c_path = CString::new(path.as_os_str().as_encoded_bytes())?;
    let c_name = CString::new(name.as_encoded_bytes())?;
    let needed = unsafe { libc::getxattr(c_path.as_ptr(), c_name.as_ptr(), std::ptr::null_mut(), 0) };
    if needed < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let mut buf = vec![0u8; needed as usize];
    if needed > 0 {
        let written =
            unsafe { libc::getxattr(c_path.as_ptr(), c_name.as_ptr(), buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if written < 0 {
            return Err(std::io::Error::last_os_error());
        }
        buf.truncate(written as usize);
    }
    Ok(buf)
}

#[cfg(not(target_os = "linux"))]
fn get_xattr_blocking(_path: &Path, _name: &OsStr) -> std::io::Result<Vec<u8>> {
    Err(std::io::Error::from_raw_os_error(libc::ENOSYS))
}

#[cfg(target_os = "linux")]
fn list_xattr_blocking(path: &Path) -> std::io::Result<Vec<u8>> {
    use std::ffi::CString;
    let c_path = CString::new(path.as_os_str().as_encoded_bytes())?;
    let needed = unsafe { libc::listxattr(c_path.as_ptr(), std::ptr::null_mut(), 0) };
    if needed < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let mut buf = vec![0u8; needed as usize];
    if needed > 0 {
        let written = unsafe { libc::listxattr(c_path.as_ptr(), buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if written < 0 {
            return Err(std::io::Error::last_os_error());
        }
        buf.truncate(written as usize);
    }
    Ok(buf)
}

#[cfg(not(target_os = "linux"))]
fn list_xattr_blocking(_path: &Path) -> std::io::Result<Vec<u8>> {
    Err(std::io::Error::from_raw_os_error(libc::ENOSYS))
}
