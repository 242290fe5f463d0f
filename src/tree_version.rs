//! Startup reconciler (spec §4.3): reads `.FUSE/db.json` manifests, decides
//! whether a backing store needs a rescan, and merges freshly-scanned
//! sides back into the [`Index`].

use std::collections::HashMap;
use std::hash::Hasher;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::index::Index;
use crate::model::{Direction, FileEntry, Location, LockDirection, PathLock};
use crate::path_resolver::{PathResolver, RESERVED_DIR};

/// Manifest format tag (spec §6).
pub const FORMAT_TAG: &str = "DMSA_TREE_V1";

/// One backing store's manifest, serialized as `.FUSE/db.json` (spec §3,
/// §6). Field names follow the wire's `camelCase` convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeVersionManifest {
    pub version: i32,
    pub format: String,
    pub source: String,
    pub tree_version: String,
    pub last_scan_at: DateTime<Utc>,
    pub file_count: u64,
    pub total_size: u64,
    pub checksum: String,
    pub entries: HashMap<String, ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub size: Option<u64>,
    pub modified_at: DateTime<Utc>,
    pub checksum: Option<String>,
    pub is_directory: Option<bool>,
}

/// Which side of a pair a manifest describes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Side {
    Local,
    External,
}

/// Non-cryptographic checksum of `(path, mtime, size)`, integrity-against-
/// accidents only (spec §9 open question 2, §13 decision 2): an FNV-1a
/// fold, not a cryptographic hash.
fn fnv1a_fold(entries: &[(String, SystemTime, u64)]) -> String {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut hash = FNV_OFFSET;
    let mut sorted = entries.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    for (path, mtime, size) in &sorted {
        for byte in path.as_bytes() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        let secs = mtime
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        for byte in secs.to_le_bytes().iter().chain(size.to_le_bytes().iter()) {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    format!("{hash:016x}")
}

/// New opaque tree-version string: timestamp plus a random suffix
/// (spec §4.3).
pub fn new_tree_version() -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    hasher.write_u128(
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos(),
    );
    hasher.write_u64(Uuid::new_v4().as_u128() as u64);
    format!("{:016x}", hasher.finish())
}

pub async fn read_manifest(store_root: &Path) -> Option<TreeVersionManifest> {
    let manifest_path = store_root.join(RESERVED_DIR).join("db.json");
    let bytes = tokio::fs::read(&manifest_path).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

pub async fn write_manifest(
    store_root: &Path,
    source: &str,
    entries: &[(String, SystemTime, u64, bool)],
) -> Result<TreeVersionManifest, ServiceError> {
    let checksum = fnv1a_fold(
        &entries
            .iter()
            .map(|(p, m, s, _)| (p.clone(), *m, *s))
            .collect::<Vec<_>>(),
    );

    let manifest = TreeVersionManifest {
        version: 1,
        format: FORMAT_TAG.to_string(),
        source: source.to_string(),
        tree_version: new_tree_version(),
        last_scan_at: Utc::now(),
        file_count: entries.len() as u64,
        total_size: entries.iter().map(|(_, _, s, _)| *s).sum(),
        checksum,
        entries: entries
            .iter()
            .map(|(path, mtime, size, is_dir)| {
                (
                    path.clone(),
                    ManifestEntry {
                        size: Some(*size),
                        modified_at: DateTime::<Utc>::from(*mtime),
                        checksum: None,
                        is_directory: Some(*is_dir),
                    },
                )
            })
            .collect(),
    };

    let manifest_dir = store_root.join(RESERVED_DIR);
    tokio::fs::create_dir_all(&manifest_dir)
        .await
        .map_err(|e| ServiceError::Internal(e.to_string()))?;
    let manifest_path = manifest_dir.join("db.json");
    let tmp = manifest_dir.join("db.json.tmp");
    let bytes = serde_json::to_vec_pretty(&manifest)
        .map_err(|e| ServiceError::Internal(e.to_string()))?;
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| ServiceError::Internal(e.to_string()))?;
    tokio::fs::rename(&tmp, &manifest_path)
        .await
        .map_err(|e| ServiceError::Internal(e.to_string()))?;
    Ok(manifest)
}

/// Recursively scans `root`, skipping `.FUSE/` and exclude-matched paths,
/// returning `(virtual_path, mtime, size, is_directory)` rows (spec §4.3).
pub async fn scan_tree(
    root: &Path,
    resolver: &PathResolver,
) -> Result<Vec<(String, SystemTime, u64, bool)>, ServiceError> {
    let mut out = Vec::new();
    let mut stack = vec![PathBuf::new()];
    while let Some(rel) = stack.pop() {
        let abs = root.join(&rel);
        let mut dir = match tokio::fs::read_dir(&abs).await {
            Ok(d) => d,
            Err(_) => continue,
        };
        while let Ok(Some(entry)) = dir.next_entry().await {
            let name = entry.file_name();
            let child_rel = if rel.as_os_str().is_empty() {
                PathBuf::from(&name)
            } else {
                rel.join(&name)
            };
            let vpath = child_rel.to_string_lossy().replace('\\', "/");
            if resolver.validate(&vpath).is_err() {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if meta.is_dir() {
                out.push((vpath, mtime, 0, true));
                stack.push(child_rel);
            } else {
                out.push((vpath, mtime, meta.len(), false));
            }
        }
    }
    Ok(out)
}

/// Result of reconciling one sync pair at startup (spec §4.3 scenario 6).
pub struct ReconcileOutcome {
    pub rebuilt_local: bool,
    pub rebuilt_external: bool,
}

/// Runs the full startup reconciliation for a sync pair: compares each
/// present side's manifest `tree_version` against what the Index last
/// recorded, rebuilds mismatched sides, and merges dual rebuilds (spec
/// §4.3, §8 scenario 6).
pub async fn reconcile_pair(
    index: &Index,
    resolver: &PathResolver,
    pair: Uuid,
    local_root: &Path,
    external_root: Option<&Path>,
) -> Result<ReconcileOutcome, ServiceError> {
    let recorded_local = recorded_version(index, pair, Side::Local);
    let recorded_external = external_root.and_then(|_| recorded_version(index, pair, Side::External));

    let local_manifest = read_manifest(local_root).await;
    let needs_local_rebuild = match &local_manifest {
        Some(m) => Some(m.tree_version.clone()) != recorded_local,
        None => true,
    };

    let external_manifest = if let Some(ext) = external_root {
        read_manifest(ext).await
    } else {
        None
    };
    let needs_external_rebuild = external_root.is_some()
        && match &external_manifest {
            Some(m) => Some(m.tree_version.clone()) != recorded_external,
            None => true,
        };

    let mut local_rows = Vec::new();
    if needs_local_rebuild {
        local_rows = scan_tree(local_root, resolver).await?;
        let manifest = write_manifest(local_root, "local", &local_rows).await?;
        record_version(index, pair, Side::Local, &manifest.tree_version);
        info!(pair = %pair, "rebuilt local tree version");
    }

    let mut external_rows = Vec::new();
    if needs_external_rebuild {
        if let Some(ext) = external_root {
            external_rows = scan_tree(ext, resolver).await?;
            let manifest = write_manifest(ext, "external", &external_rows).await?;
            record_version(index, pair, Side::External, &manifest.tree_version);
            info!(pair = %pair, "rebuilt external tree version");
        }
    }

    if needs_local_rebuild && needs_external_rebuild {
        merge_dual_rebuild(index, pair, local_rows, external_rows);
    } else if needs_local_rebuild {
        merge_single_side(index, pair, local_rows, Location::LocalOnly);
    } else if needs_external_rebuild {
        merge_single_side(index, pair, external_rows, Location::ExternalOnly);
    }

    Ok(ReconcileOutcome {
        rebuilt_local: needs_local_rebuild,
        rebuilt_external: needs_external_rebuild,
    })
}

fn merge_single_side(
    index: &Index,
    pair: Uuid,
    rows: Vec<(String, SystemTime, u64, bool)>,
    location_if_new: Location,
) {
    for (path, mtime, size, is_dir) in rows {
        let mut entry = index.get(pair, &path).unwrap_or_else(|| {
            if is_dir {
                FileEntry::new_directory(&path, location_if_new)
            } else {
                FileEntry::new_file(&path, location_if_new, size as i64)
            }
        });
        entry.modified_at = mtime;
        entry.size = size as i64;
        index.upsert(pair, &path, entry);
    }
}

/// When both sides rebuild: same path on both with equal size/mtime ⇒
/// `Both, ¬dirty`; otherwise `Both, dirty` with a default `L→E` lock
/// direction unless the pair's configured direction says otherwise (spec
/// §4.3).
fn merge_dual_rebuild(
    index: &Index,
    pair: Uuid,
    local_rows: Vec<(String, SystemTime, u64, bool)>,
    external_rows: Vec<(String, SystemTime, u64, bool)>,
) {
    let external_map: HashMap<String, (SystemTime, u64, bool)> = external_rows
        .iter()
        .map(|(p, m, s, d)| (p.clone(), (*m, *s, *d)))
        .collect();
    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();

    for (path, mtime, size, is_dir) in &local_rows {
        seen.insert(path.clone());
        let mut entry = if *is_dir {
            FileEntry::new_directory(path, Location::Both)
        } else {
            FileEntry::new_file(path, Location::Both, *size as i64)
        };
        entry.modified_at = *mtime;

        match external_map.get(path) {
            Some((ext_mtime, ext_size, _)) if ext_mtime == mtime && ext_size == size => {
                entry.location = Location::Both;
            }
            Some(_) => {
                entry.location = Location::Both;
                entry.mark_dirty();
                entry.lock = None;
            }
            None => {
                entry.location = Location::LocalOnly;
            }
        }
        index.upsert(pair, path, entry);
    }

    for (path, mtime, size, is_dir) in external_rows {
        if seen.contains(&path) {
            continue;
        }
        let mut entry = if is_dir {
            FileEntry::new_directory(&path, Location::ExternalOnly)
        } else {
            FileEntry::new_file(&path, Location::ExternalOnly, size as i64)
        };
        entry.modified_at = mtime;
        index.upsert(pair, &path, entry);
    }
}

fn recorded_version(index: &Index, pair: Uuid, side: Side) -> Option<String> {
    let marker_key = version_marker_key(side);
    index
        .get(pair, &marker_key)
        .and_then(|e| e.checksum)
}

fn record_version(index: &Index, pair: Uuid, side: Side, version: &str) {
    let marker_key = version_marker_key(side);
    let mut entry = FileEntry::new_file(&marker_key, Location::Deleted, 0);
    entry.checksum = Some(version.to_string());
    index.upsert(pair, &marker_key, entry);
}

/// Tree versions are recorded durably on the LOCAL side's Index under a
/// reserved key outside the visible namespace (spec §4.3: "the store also
/// records `(sync_pair_id, source) → tree_version_string` durably").
fn version_marker_key(side: Side) -> String {
    match side {
        Side::Local => format!("{RESERVED_DIR}/tree_version/local"),
        Side::External => format!("{RESERVED_DIR}/tree_version/external"),
    }
}

/// Applies a pair's configured [`Direction`] to decide the default lock
/// direction recorded for a dual-rebuild conflict (spec §4.3: "unless the
/// sync pair direction dictates otherwise").
pub fn default_conflict_lock_direction(direction: Direction) -> LockDirection {
    match direction {
        Direction::ExternalToLocal => LockDirection::ExternalToLocal,
        Direction::LocalToExternal | Direction::Bidi => LockDirection::LocalToExternal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_stable_under_reordering() {
        let a = vec![
            ("a.txt".to_string(), SystemTime::UNIX_EPOCH, 1u64),
            ("b.txt".to_string(), SystemTime::UNIX_EPOCH, 2u64),
        ];
        let b = vec![a[1].clone(), a[0].clone()];
        assert_eq!(fnv1a_fold(&a), fnv1a_fold(&b));
    }

    #[test]
    fn checksum_changes_with_content() {
        let a = vec![("a.txt".to_string(), SystemTime::UNIX_EPOCH, 1u64)];
        let b = vec![("a.txt".to_string(), SystemTime::UNIX_EPOCH, 2u64)];
        assert_ne!(fnv1a_fold(&a), fnv1a_fold(&b));
    }

    #[tokio::test]
    async fn rebuilding_twice_without_changes_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), b"hello").await.unwrap();

        let resolver = PathResolver::new(&[]).unwrap();
        let rows = scan_tree(dir.path(), &resolver).await.unwrap();
        let m1 = write_manifest(dir.path(), "local", &rows).await.unwrap();
        let rows2 = scan_tree(dir.path(), &resolver).await.unwrap();
        let m2 = write_manifest(dir.path(), "local", &rows2).await.unwrap();
        assert_eq!(m1.checksum, m2.checksum);
        assert_eq!(m1.total_size, m2.total_size);
        assert_eq!(m1.file_count, m2.file_count);
    }
}
