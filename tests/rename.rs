//! End-to-end scenario 5 (spec §8): renaming across a subtree moves both
//! backing copies, re-keys the Index, and invalidates both directories'
//! cached listings.

mod common;

#[tokio::test]
async fn rename_moves_entry_and_invalidates_both_directories() {
    let fx = common::Fixture::new().await;
    let pair = fx.pair.id;

    fx.write_router
        .create(pair, "x/y.txt", &fx.local_path("x/y.txt"))
        .await
        .unwrap();
    fx.write_router
        .write(pair, "x/y.txt", &fx.local_path("x/y.txt"), 0, b"payload")
        .await
        .unwrap();
    fx.scheduler.sync_now(pair).await.unwrap();
    assert!(fx.merge_view.list_directory(pair, "x").contains(&"y.txt".to_string()));

    fx.write_router
        .rename(
            pair,
            "x/y.txt",
            "z/y.txt",
            &fx.local_path("x/y.txt"),
            &fx.local_path("z/y.txt"),
            Some(&fx.external_path("x/y.txt")),
            Some(&fx.external_path("z/y.txt")),
        )
        .await
        .unwrap();

    assert!(fx.index.get(pair, "x/y.txt").is_none());
    let moved = fx.index.get(pair, "z/y.txt").unwrap();
    assert_eq!(moved.virtual_path, "z/y.txt");

    assert!(!fx.merge_view.list_directory(pair, "x").contains(&"y.txt".to_string()));
    assert!(fx.merge_view.list_directory(pair, "z").contains(&"y.txt".to_string()));

    assert!(tokio::fs::metadata(fx.local_path("z/y.txt")).await.is_ok());
    assert!(tokio::fs::metadata(fx.local_path("x/y.txt")).await.is_err());
    assert!(tokio::fs::metadata(fx.external_path("z/y.txt")).await.is_ok());
}
