#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{file, names, vpath};
use sort_fuse::fs::snapshot::SnapshotCache;
use sort_fuse::fs::sort::order;
use sort_fuse::fs::{FsError, SortOrder, SortedListing, VPath};
use tokio::sync::Notify;

fn listing_of(path: &VPath, files: &[&str]) -> SortedListing {
    order(
        path.clone(),
        files.iter().map(|n| file(n, 0)).collect(),
        &SortOrder::default(),
    )
}

#[tokio::test]
async fn miss_refreshes_then_hit_serves_cache() {
    let cache = SnapshotCache::new(Duration::from_secs(60));
    let dir = vpath("/d");
    let calls = AtomicUsize::new(0);
    let refresh = || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(listing_of(&dir, &["a", "b"]))
    };

    let first = cache.get_or_refresh(&dir, refresh).await.unwrap();
    let second = cache.get_or_refresh(&dir, refresh).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(names(first.entries()), ["a", "b"]);
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn expired_record_is_refreshed_and_old_listing_is_untouched() {
    let cache = SnapshotCache::new(Duration::from_millis(20));
    let dir = vpath("/d");

    let first = cache
        .get_or_refresh(&dir, || async { Ok(listing_of(&dir, &["a"])) })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    let second = cache
        .get_or_refresh(&dir, || async { Ok(listing_of(&dir, &["a", "new"])) })
        .await
        .unwrap();

    assert_eq!(names(first.entries()), ["a"]);
    assert_eq!(names(second.entries()), ["a", "new"]);
}

#[tokio::test]
async fn invalidate_forces_refresh_within_window() {
    let cache = SnapshotCache::new(Duration::from_secs(60));
    let dir = vpath("/d");
    let calls = AtomicUsize::new(0);
    let refresh = || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(listing_of(&dir, &["a"]))
    };

    cache.get_or_refresh(&dir, refresh).await.unwrap();
    assert!(cache.invalidate(&dir));
    cache.get_or_refresh(&dir, refresh).await.unwrap();
    cache.get_or_refresh(&dir, refresh).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn invalidate_unknown_path_is_false() {
    let cache = SnapshotCache::new(Duration::from_secs(1));
    assert!(!cache.invalidate(&vpath("/never")));
    assert!(cache.cached(&vpath("/never")).is_none());
}

#[tokio::test]
async fn failed_refresh_publishes_nothing_and_allows_retry() {
    let cache = SnapshotCache::new(Duration::from_secs(60));
    let dir = vpath("/d");

    let err = cache
        .get_or_refresh(&dir, || async { Err(FsError::PermissionDenied) })
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::PermissionDenied));
    assert!(cache.cached(&dir).is_none());

    let listing = cache
        .get_or_refresh(&dir, || async { Ok(listing_of(&dir, &["x"])) })
        .await
        .unwrap();
    assert_eq!(names(listing.entries()), ["x"]);
}

#[tokio::test]
async fn failed_refresh_keeps_prior_record() {
    let cache = SnapshotCache::new(Duration::ZERO);
    let dir = vpath("/d");

    cache
        .get_or_refresh(&dir, || async { Ok(listing_of(&dir, &["kept"])) })
        .await
        .unwrap();
    let result = cache
        .get_or_refresh(&dir, || async { Err(FsError::Internal("boom".to_owned())) })
        .await;

    assert!(result.is_err());
    assert_eq!(names(cache.cached(&dir).unwrap().entries()), ["kept"]);
}

#[tokio::test]
async fn evict_drops_the_slot() {
    let cache = SnapshotCache::new(Duration::from_secs(60));
    let dir = vpath("/d");
    cache
        .get_or_refresh(&dir, || async { Ok(listing_of(&dir, &["a"])) })
        .await
        .unwrap();

    assert!(cache.evict(&dir));
    assert!(!cache.evict(&dir));
    assert!(cache.is_empty());
    assert!(cache.record(&dir).is_none());
}

#[tokio::test]
async fn record_carries_path_and_generation() {
    let cache = SnapshotCache::new(Duration::from_secs(60));
    let dir = vpath("/d");
    cache
        .get_or_refresh(&dir, || async { Ok(listing_of(&dir, &["a"])) })
        .await
        .unwrap();
    let first = cache.record(&dir).unwrap();
    assert_eq!(first.path, dir);

    cache.invalidate(&dir);
    cache
        .get_or_refresh(&dir, || async { Ok(listing_of(&dir, &["a"])) })
        .await
        .unwrap();
    let second = cache.record(&dir).unwrap();
    assert!(second.generation > first.generation);
    assert!(second.verified_at >= first.verified_at);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_misses_share_one_refresh() {
    let cache = Arc::new(SnapshotCache::new(Duration::from_secs(60)));
    let dir = vpath("/d");
    let calls = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(Notify::new());
    let started = Arc::new(Notify::new());

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let cache = Arc::clone(&cache);
        let dir = dir.clone();
        let calls = Arc::clone(&calls);
        let release = Arc::clone(&release);
        let started = Arc::clone(&started);
        tasks.push(tokio::spawn(async move {
            cache
                .get_or_refresh(&dir, || {
                    let calls = Arc::clone(&calls);
                    let release = Arc::clone(&release);
                    let started = Arc::clone(&started);
                    let dir = dir.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        started.notify_one();
                        release.notified().await;
                        Ok(listing_of(&dir, &["a", "b", "c"]))
                    }
                })
                .await
        }));
    }

    started.notified().await;
    // Let the other callers reach the in-progress branch.
    tokio::time::sleep(Duration::from_millis(50)).await;
    release.notify_one();

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap().unwrap());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for listing in &results {
        assert!(Arc::ptr_eq(listing, &results[0]));
        assert_eq!(listing.len(), 3);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn in_flight_refresh_serves_prior_record() {
    let cache = Arc::new(SnapshotCache::new(Duration::from_secs(60)));
    let dir = vpath("/d");
    let old = cache
        .get_or_refresh(&dir, || async { Ok(listing_of(&dir, &["old"])) })
        .await
        .unwrap();
    cache.invalidate(&dir);

    let release = Arc::new(Notify::new());
    let started = Arc::new(Notify::new());
    let refresher = {
        let cache = Arc::clone(&cache);
        let dir = dir.clone();
        let release = Arc::clone(&release);
        let started = Arc::clone(&started);
        tokio::spawn(async move {
            cache
                .get_or_refresh(&dir, || {
                    let release = Arc::clone(&release);
                    let started = Arc::clone(&started);
                    let dir = dir.clone();
                    async move {
                        started.notify_one();
                        release.notified().await;
                        Ok(listing_of(&dir, &["new", "old"]))
                    }
                })
                .await
        })
    };
    started.notified().await;

    let second_refreshes = AtomicUsize::new(0);
    let during = cache
        .get_or_refresh(&dir, || async {
            second_refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(listing_of(&dir, &["wrong"]))
        })
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&during, &old));
    assert_eq!(second_refreshes.load(Ordering::SeqCst), 0);

    release.notify_one();
    let new = refresher.await.unwrap().unwrap();
    assert_eq!(names(new.entries()), ["new", "old"]);
    assert_eq!(names(old.entries()), ["old"]);
}

#[tokio::test]
async fn cancelled_refresh_releases_claim() {
    let cache = SnapshotCache::new(Duration::from_secs(60));
    let dir = vpath("/d");

    let stuck = cache.get_or_refresh(&dir, || async {
        std::future::pending::<()>().await;
        Ok(listing_of(&dir, &[]))
    });
    let timed_out = tokio::time::timeout(Duration::from_millis(10), stuck).await;
    assert!(timed_out.is_err());

    let listing = tokio::time::timeout(
        Duration::from_secs(5),
        cache.get_or_refresh(&dir, || async { Ok(listing_of(&dir, &["after"])) }),
    )
    .await
    .expect("a cancelled refresh must not wedge the slot")
    .unwrap();
    assert_eq!(names(listing.entries()), ["after"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn waiter_retries_after_failed_refresh() {
    let cache = Arc::new(SnapshotCache::new(Duration::from_secs(60)));
    let dir = vpath("/d");
    let release = Arc::new(Notify::new());
    let started = Arc::new(Notify::new());

    let failing = {
        let cache = Arc::clone(&cache);
        let dir = dir.clone();
        let release = Arc::clone(&release);
        let started = Arc::clone(&started);
        tokio::spawn(async move {
            cache
                .get_or_refresh(&dir, || {
                    let release = Arc::clone(&release);
                    let started = Arc::clone(&started);
                    async move {
                        started.notify_one();
                        release.notified().await;
                        Err(FsError::Internal("transient".to_owned()))
                    }
                })
                .await
        })
    };
    started.notified().await;

    let waiter = {
        let cache = Arc::clone(&cache);
        let dir = dir.clone();
        tokio::spawn(async move {
            cache
                .get_or_refresh(&dir, || {
                    let dir = dir.clone();
                    async move { Ok(listing_of(&dir, &["retried"])) }
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    release.notify_one();

    assert!(failing.await.unwrap().is_err());
    let listing = waiter.await.unwrap().unwrap();
    assert_eq!(names(listing.entries()), ["retried"]);
}

#[tokio::test]
async fn sweep_drops_only_stale_slots() {
    let cache = SnapshotCache::new(Duration::from_millis(20));
    for i in 0..10 {
        let dir = vpath(&format!("/old{i}"));
        cache
            .get_or_refresh(&dir, || async { Ok(listing_of(&dir, &["x"])) })
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(40)).await;

    let fresh = vpath("/fresh");
    cache
        .get_or_refresh(&fresh, || async { Ok(listing_of(&fresh, &["y"])) })
        .await
        .unwrap();
    assert_eq!(cache.len(), 11);

    assert_eq!(cache.sweep(), 10);
    assert_eq!(cache.len(), 1);
    assert!(cache.record(&fresh).is_some());
}

#[tokio::test]
async fn growing_cache_sweeps_stale_slots() {
    let cache = SnapshotCache::new(Duration::from_millis(20));
    for i in 0..50 {
        let dir = vpath(&format!("/gone{i}"));
        cache
            .get_or_refresh(&dir, || async { Ok(listing_of(&dir, &["x"])) })
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(40)).await;

    for i in 0..100 {
        let dir = vpath(&format!("/new{i}"));
        cache
            .get_or_refresh(&dir, || async { Ok(listing_of(&dir, &["x"])) })
            .await
            .unwrap();
    }
    for i in 0..50 {
        assert!(cache.record(&vpath(&format!("/gone{i}"))).is_none());
    }
    assert!(cache.len() <= 100, "len {}", cache.len());
}
