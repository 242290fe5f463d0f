//! Property tests for the invariants spec §8 enumerates: directory listings
//! and eviction candidate selection must hold for arbitrary Index contents,
//! not just the handful of cases the scenario tests exercise.

use std::collections::BTreeSet;
use std::time::SystemTime;

use proptest::prelude::*;
use proptest::test_runner::{Config, TestRunner};
use uuid::Uuid;

use tierfs::index::Index;
use tierfs::merge_view::MergeView;
use tierfs::model::{EvictionStrategy, FileEntry, Location, LockDirection, PathLock};

fn path_component() -> impl Strategy<Value = String> {
    "[a-z]{1,6}"
}

fn virtual_path() -> impl Strategy<Value = String> {
    proptest::collection::vec(path_component(), 1..4).prop_map(|parts| parts.join("/"))
}

/// Invariant 6 (§8): `list_directory` returns exactly the distinct first
/// path components of the entries under a prefix, with no duplicates.
#[tokio::test]
async fn list_directory_matches_distinct_first_components() {
    let dir = tempfile::tempdir().unwrap();
    let index = Index::load(dir.path().join("index.json")).await.unwrap();

    let mut runner = TestRunner::new(Config::with_cases(64));
    let strategy = proptest::collection::vec(virtual_path(), 0..20);
    runner
        .run(&strategy, |paths| {
            let pair = Uuid::new_v4();
            for (i, p) in paths.iter().enumerate() {
                index.upsert(pair, p, FileEntry::new_file(p.clone(), Location::LocalOnly, i as i64));
            }

            let view = MergeView::new(index.clone());
            let listing = view.list_directory(pair, "");

            let mut sorted = listing.clone();
            sorted.sort();
            sorted.dedup();
            prop_assert_eq!(sorted.len(), listing.len(), "list_directory returned duplicates");

            let expected: BTreeSet<String> = paths
                .iter()
                .filter_map(|p| p.split('/').next().map(str::to_string))
                .collect();
            let actual: BTreeSet<String> = listing.into_iter().collect();
            prop_assert_eq!(actual, expected);
            Ok(())
        })
        .unwrap();
}

#[derive(Debug, Clone, Copy)]
struct EntrySpec {
    location: Location,
    dirty: bool,
    locked: bool,
    is_directory: bool,
}

fn arbitrary_entry_spec() -> impl Strategy<Value = EntrySpec> {
    (
        prop_oneof![
            Just(Location::NotExists),
            Just(Location::LocalOnly),
            Just(Location::ExternalOnly),
            Just(Location::Both),
            Just(Location::Deleted),
        ],
        any::<bool>(),
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(|(location, dirty, locked, is_directory)| EntrySpec { location, dirty, locked, is_directory })
}

/// Invariant 5 (§8): eviction never selects a dirty, locked, or directory
/// entry, regardless of what's sitting in the Index.
#[tokio::test]
async fn evictable_candidates_are_never_dirty_locked_or_directories() {
    let dir = tempfile::tempdir().unwrap();
    let index = Index::load(dir.path().join("index.json")).await.unwrap();

    let mut runner = TestRunner::new(Config::with_cases(64));
    let strategy = proptest::collection::vec(arbitrary_entry_spec(), 0..20);
    runner
        .run(&strategy, |rows| {
            let pair = Uuid::new_v4();
            for (i, spec) in rows.iter().enumerate() {
                let mut entry = FileEntry::new_file(format!("f{i}"), spec.location, 10);
                entry.is_directory = spec.is_directory;
                // `is_dirty` only makes sense under Invariant 3: a dirty
                // entry must already be LocalOnly/Both, so a dirty request
                // against any other location is simply not representable.
                if spec.dirty && matches!(spec.location, Location::LocalOnly | Location::Both) {
                    entry.is_dirty = true;
                }
                if spec.locked {
                    entry.lock = Some(PathLock {
                        direction: LockDirection::LocalToExternal,
                        acquired_at: SystemTime::now(),
                    });
                }
                index.upsert(pair, &entry.virtual_path.clone(), entry);
            }

            let candidates = index.evictable_for_pair(pair, EvictionStrategy::AccessTime);
            for c in &candidates {
                prop_assert!(c.evictable());
                prop_assert_eq!(c.location, Location::Both);
                prop_assert!(!c.is_dirty);
                prop_assert!(c.lock.is_none());
                prop_assert!(!c.is_directory);
            }
            Ok(())
        })
        .unwrap();
}
