//! Answers `readdir`/`getattr` by unioning Index entries under a prefix,
//! with a bounded, TTL'd directory-listing cache (spec §4.4).

use std::path::Path;
use std::time::{Duration, SystemTime};

use moka::sync::Cache;
use uuid::Uuid;

use crate::index::Index;
use crate::model::{FileEntry, Location};

/// Cache capacity and TTL from spec §4.4.
const CACHE_CAPACITY: u64 = 100;
const CACHE_TTL: Duration = Duration::from_secs(5);

/// Attributes returned by [`MergeView::get_attributes`]: Index metadata
/// merged with on-disk size/mtime from whichever side was actually read.
#[derive(Debug, Clone)]
pub struct MergedAttr {
    pub virtual_path: String,
    pub is_directory: bool,
    pub size: i64,
    pub modified_at: SystemTime,
    pub accessed_at: SystemTime,
}

pub struct MergeView {
    index: std::sync::Arc<Index>,
    cache: Cache<(Uuid, String), Vec<String>>,
}

impl MergeView {
    pub fn new(index: std::sync::Arc<Index>) -> Self {
        MergeView {
            index,
            cache: Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(CACHE_TTL)
                .build(),
        }
    }

    /// `list_directory(prefix)`: distinct first path components under
    /// `prefix`, sorted in natural case-insensitive order (spec §4.4, §8
    /// invariant 6). The root directory is `prefix = ""`.
    pub fn list_directory(&self, pair: Uuid, prefix: &str) -> Vec<String> {
        let key = (pair, prefix.to_string());
        if let Some(cached) = self.cache.get(&key) {
            return cached;
        }

        let search_prefix = if prefix.is_empty() {
            String::new()
        } else {
            format!("{prefix}/")
        };

        let mut names: Vec<String> = self
            .index
            .entries_under(pair, &search_prefix)
            .into_iter()
            .filter(|e| !matches!(e.location, Location::NotExists | Location::Deleted))
            .filter_map(|e| {
                let rest = e.virtual_path.strip_prefix(&search_prefix)?;
                rest.split('/').next().map(|s| s.to_string())
            })
            .collect();

        names.sort();
        names.dedup();
        names.sort_by(|a, b| a.to_lowercase().cmp(&b.to_lowercase()));

        self.cache.insert(key, names.clone());
        names
    }

    /// Combines Index metadata with the size/mtime of whichever backing
    /// side is chosen (LOCAL if present, else EXTERNAL) (spec §4.4). The
    /// root always exists.
    pub fn get_attributes(&self, pair: Uuid, path: &str) -> Option<MergedAttr> {
        if path.is_empty() {
            return Some(MergedAttr {
                virtual_path: String::new(),
                is_directory: true,
                size: 0,
                modified_at: SystemTime::now(),
                accessed_at: SystemTime::now(),
            });
        }

        if let Some(entry) = self.index.get(pair, path) {
            if !matches!(entry.location, Location::NotExists | Location::Deleted) {
                return Some(to_attr(&entry));
            }
        }

        // An entry may not exist for `path` itself yet still be a
        // directory because deeper paths exist under it (spec §4.4).
        let search_prefix = format!("{path}/");
        if self
            .index
            .entries_under(pair, &search_prefix)
            .into_iter()
            .any(|e| !matches!(e.location, Location::NotExists | Location::Deleted))
        {
            return Some(MergedAttr {
                virtual_path: path.to_string(),
                is_directory: true,
                size: 0,
                modified_at: SystemTime::now(),
                accessed_at: SystemTime::now(),
            });
        }

        None
    }

    /// Invalidation propagates from `path` up to the root so every ancestor
    /// directory listing refreshes (spec §4.4, §5: "cache invalidation
    /// precedes the IPC event announcing the mutation").
    pub fn invalidate(&self, pair: Uuid, path: &str) {
        let mut current = path;
        loop {
            self.cache.invalidate(&(pair, current.to_string()));
            match current.rfind('/') {
                Some(idx) => current = &current[..idx],
                None => {
                    if !current.is_empty() {
                        self.cache.invalidate(&(pair, String::new()));
                    }
                    break;
                }
            }
        }
    }

    /// Invalidates both endpoints of a rename (spec §4.6 scenario 5).
    pub fn invalidate_rename(&self, pair: Uuid, from: &str, to: &str) {
        self.invalidate(pair, from);
        self.invalidate(pair, to);
    }
}

fn to_attr(entry: &FileEntry) -> MergedAttr {
    MergedAttr {
        virtual_path: entry.virtual_path.clone(),
        is_directory: entry.is_directory,
        size: entry.size,
        modified_at: entry.modified_at,
        accessed_at: entry.accessed_at,
    }
}

/// Computes on-disk size/mtime for whichever side is preferred, used when
/// populating [`FileEntry`] rows during routing (not part of the cached
/// read path).
pub async fn stat_preferred(local: &Path, external: Option<&Path>) -> Option<(i64, SystemTime)> {
    if let Ok(meta) = tokio::fs::metadata(local).await {
        return Some((meta.len() as i64, meta.modified().ok()?));
    }
    if let Some(external) = external {
        if let Ok(meta) = tokio::fs::metadata(external).await {
            return Some((meta.len() as i64, meta.modified().ok()?));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn index() -> Arc<Index> {
        let dir = tempfile::tempdir().unwrap();
        Index::load(dir.path().join("index.json")).await.unwrap()
    }

    #[tokio::test]
    async fn list_directory_dedupes_and_sorts() {
        let idx = index().await;
        let pair = Uuid::new_v4();
        idx.upsert(pair, "a/b.txt", FileEntry::new_file("a/b.txt", Location::LocalOnly, 1));
        idx.upsert(pair, "a/c/d.txt", FileEntry::new_file("a/c/d.txt", Location::LocalOnly, 1));
        idx.upsert(pair, "a/Banana.txt", FileEntry::new_file("a/Banana.txt", Location::LocalOnly, 1));

        let view = MergeView::new(idx);
        let listing = view.list_directory(pair, "a");
        assert_eq!(listing, vec!["b.txt".to_string(), "Banana.txt".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn deleted_entries_are_omitted() {
        let idx = index().await;
        let pair = Uuid::new_v4();
        let mut deleted = FileEntry::new_file("a/gone.txt", Location::Deleted, 0);
        deleted.location = Location::Deleted;
        idx.upsert(pair, "a/gone.txt", deleted);

        let view = MergeView::new(idx);
        assert!(view.list_directory(pair, "a").is_empty());
    }

    #[tokio::test]
    async fn nested_dir_reports_as_directory_even_without_own_entry() {
        let idx = index().await;
        let pair = Uuid::new_v4();
        idx.upsert(pair, "a/b/c.txt", FileEntry::new_file("a/b/c.txt", Location::LocalOnly, 1));

        let view = MergeView::new(idx);
        let attr = view.get_attributes(pair, "a/b").unwrap();
        assert!(attr.is_directory);
    }
}
