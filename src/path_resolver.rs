//! Maps virtual paths to backing-store pairs and enforces the allow/deny
//! and exclude-pattern policy (spec §4.1).

use std::path::{Component, Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::ServiceError;
use crate::model::SyncPair;

/// Reserved directory hidden from the merged namespace (spec §4.1, §6).
pub const RESERVED_DIR: &str = ".FUSE";

/// Global allow-list guarding privileged operations (spec §4.1).
const DEFAULT_ALLOW: &[&str] = &["**/Downloads/**", "**/Documents/**", "/Volumes/*/**"];

/// Global deny-list guarding privileged operations (spec §4.1).
const DEFAULT_DENY: &[&str] = &["/System/**", "/usr/**", "/bin/**", "/sbin/**", "/etc/**"];

pub struct PathResolver {
    exclude: GlobSet,
    allow: GlobSet,
    deny: GlobSet,
}

impl PathResolver {
    pub fn new(exclude_patterns: &[String]) -> Result<Self, ServiceError> {
        Ok(PathResolver {
            exclude: build_globset(exclude_patterns)?,
            allow: build_globset(&DEFAULT_ALLOW.iter().map(|s| s.to_string()).collect::<Vec<_>>())?,
            deny: build_globset(&DEFAULT_DENY.iter().map(|s| s.to_string()).collect::<Vec<_>>())?,
        })
    }

    /// Validate a virtual path and resolve it against a sync pair's two
    /// backing roots. Rejects `..` traversal, the reserved `.FUSE` subtree,
    /// and anything matching an exclude pattern (spec §4.1, §3 inv. 6).
    pub fn resolve(
        &self,
        pair: &SyncPair,
        external_mount_path: Option<&Path>,
        virtual_path: &str,
    ) -> Result<(PathBuf, Option<PathBuf>), ServiceError> {
        self.validate(virtual_path)?;

        let rel = Path::new(virtual_path);
        let local_abs = pair.local_dir().join(rel);
        let external_abs = external_mount_path.map(|mp| pair.external_dir(mp).join(rel));
        Ok((local_abs, external_abs))
    }

    /// Structural + exclude-pattern validation only, independent of a
    /// sync pair (used by directory listings and rename targets).
    pub fn validate(&self, virtual_path: &str) -> Result<(), ServiceError> {
        if virtual_path.starts_with('/') {
            return Err(ServiceError::InvalidPath(format!(
                "virtual path must be relative: {virtual_path}"
            )));
        }

        let path = Path::new(virtual_path);
        for component in path.components() {
            match component {
                Component::ParentDir => {
                    return Err(ServiceError::InvalidPath(format!(
                        "path escapes root via '..': {virtual_path}"
                    )))
                }
                Component::Normal(part) => {
                    if part == RESERVED_DIR.as_ref() as &std::ffi::OsStr {
                        return Err(ServiceError::InvalidPath(format!(
                            "path enters reserved directory: {virtual_path}"
                        )));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(ServiceError::InvalidPath(format!(
                        "path must be relative: {virtual_path}"
                    )))
                }
                Component::CurDir => {}
            }
        }

        if self.exclude.is_match(path) {
            return Err(ServiceError::InvalidPath(format!(
                "path matches an exclude pattern: {virtual_path}"
            )));
        }

        Ok(())
    }

    /// Guard for [`crate::privileged`] operations: the absolute path must
    /// be under the allow-list and must not match the deny-list (§4.1,
    /// §4.12).
    pub fn check_privileged(&self, absolute_path: &Path) -> Result<(), ServiceError> {
        if self.deny.is_match(absolute_path) {
            return Err(ServiceError::PermissionDenied(format!(
                "path is in the deny list: {}",
                absolute_path.display()
            )));
        }
        if !self.allow.is_match(absolute_path) {
            return Err(ServiceError::PermissionDenied(format!(
                "path is not in the allow list: {}",
                absolute_path.display()
            )));
        }
        Ok(())
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, ServiceError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| ServiceError::InvalidPath(format!("bad pattern {pattern}: {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| ServiceError::InvalidPath(format!("could not build pattern set: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> SyncPair {
        SyncPair {
            id: uuid::Uuid::nil(),
            disk_id: uuid::Uuid::nil(),
            local_path: PathBuf::from("/Users/a/Documents"),
            external_relative_path: PathBuf::from("Documents"),
            direction: crate::model::Direction::Bidi,
            exclude_patterns: vec!["*.tmp".into(), "node_modules".into()],
            max_local_cache_bytes: 0,
            target_free_bytes: 0,
            auto_evict: true,
        }
    }

    #[test]
    fn rejects_parent_traversal() {
        let resolver = PathResolver::new(&pair().exclude_patterns).unwrap();
        assert!(resolver.validate("a/../../etc/passwd").is_err());
    }

    #[test]
    fn rejects_reserved_dir() {
        let resolver = PathResolver::new(&pair().exclude_patterns).unwrap();
        assert!(resolver.validate(".FUSE/db.json").is_err());
    }

    #[test]
    fn rejects_excluded_pattern() {
        let resolver = PathResolver::new(&pair().exclude_patterns).unwrap();
        assert!(resolver.validate("scratch.tmp").is_err());
        assert!(resolver.validate("project/node_modules").is_err());
    }

    #[test]
    fn accepts_plain_path() {
        let resolver = PathResolver::new(&pair().exclude_patterns).unwrap();
        assert!(resolver.validate("a/b.txt").is_ok());
    }

    #[test]
    fn resolve_builds_both_sides() {
        let p = pair();
        let resolver = PathResolver::new(&p.exclude_patterns).unwrap();
        let (local, external) = resolver
            .resolve(&p, Some(Path::new("/Volumes/Backup")), "a/b.txt")
            .unwrap();
        assert_eq!(local, p.local_dir().join("a/b.txt"));
        assert_eq!(external, Some(Path::new("/Volumes/Backup/Documents/a/b.txt").to_path_buf()));
    }
}
