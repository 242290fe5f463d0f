//! End-to-end scenario 2 (spec §8): eviction under pressure frees the
//! oldest-accessed clean files until the target is met.

mod common;

use std::time::{Duration, SystemTime};

use tierfs::model::{FileEntry, Location};

#[tokio::test]
async fn frees_oldest_files_first_until_target_met() {
    let fx = common::Fixture::new().await;
    let pair = fx.pair.id;

    // 6 files of 100 bytes, ages 1..6 days, all Both/clean.
    for day in 1..=6u64 {
        let name = format!("f{day}.bin");
        tokio::fs::write(fx.local_path(&name), vec![0u8; 100]).await.unwrap();
        tokio::fs::write(fx.external_path(&name), vec![0u8; 100]).await.unwrap();
        let mut entry = FileEntry::new_file(&name, Location::Both, 100);
        entry.accessed_at = SystemTime::now() - Duration::from_secs(day * 86_400);
        entry.modified_at = entry.accessed_at;
        fx.index.upsert(pair, &name, entry);
    }

    fx.eviction.evict_now(pair, 250).await.unwrap();

    // Oldest three (f6, f5, f4) should have been evicted to clear >= 250 bytes.
    for name in ["f6.bin", "f5.bin", "f4.bin"] {
        assert_eq!(fx.index.get(pair, name).unwrap().location, Location::ExternalOnly);
    }
    for name in ["f1.bin", "f2.bin", "f3.bin"] {
        assert_eq!(fx.index.get(pair, name).unwrap().location, Location::Both);
    }
}

#[tokio::test]
async fn dirty_and_locked_entries_are_never_evicted() {
    let fx = common::Fixture::new().await;
    let pair = fx.pair.id;

    tokio::fs::write(fx.local_path("dirty.bin"), vec![0u8; 10]).await.unwrap();
    let mut dirty = FileEntry::new_file("dirty.bin", Location::Both, 10);
    dirty.mark_dirty();
    dirty.accessed_at = SystemTime::UNIX_EPOCH;
    fx.index.upsert(pair, "dirty.bin", dirty);

    let result = fx.eviction.evict_now(pair, 10).await;
    assert!(result.is_err());
    assert_eq!(fx.index.get(pair, "dirty.bin").unwrap().location, Location::Both);
}
