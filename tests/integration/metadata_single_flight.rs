//! Single-flight behaviour of the metadata cache.

#![allow(missing_docs)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use futures::future::join_all;
use odata_query::metadata::{JsonModelLoader, MetadataCache, MetadataDocument};
use odata_query::protocol::ProtocolVersion;
use odata_query::types::Error;

const CALLERS: usize = 16;

#[tokio::test]
async fn concurrent_callers_share_one_fetch() {
    let cache = MetadataCache::new();
    let fetches = Arc::new(AtomicUsize::new(0));
    let callers = (0..CALLERS).map(|_| {
        let cache = cache.clone();
        let fetches = Arc::clone(&fetches);
        async move {
            cache
                .get_or_add_async("https://svc", move |_| async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok(MetadataDocument::new(common::northwind_json("4.0")))
                })
                .await
        }
    });
    let entries: Vec<_> = join_all(callers)
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert!(entries.iter().all(|entry| Arc::ptr_eq(entry, &entries[0])));
    assert_eq!(cache.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn spawned_callers_share_one_fetch() {
    let cache = MetadataCache::new();
    let fetches = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..CALLERS {
        let cache = cache.clone();
        let fetches = Arc::clone(&fetches);
        handles.push(tokio::spawn(async move {
            cache
                .get_or_add_async("https://svc", move |_| async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(MetadataDocument::new(common::northwind_json("4.0")))
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_fetch_reaches_every_waiter_and_is_retried() {
    let cache = MetadataCache::new();
    let fetches = Arc::new(AtomicUsize::new(0));
    let callers = (0..CALLERS).map(|_| {
        let cache = cache.clone();
        let fetches = Arc::clone(&fetches);
        async move {
            cache
                .get_or_add_async("https://svc", move |_| async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Err::<MetadataDocument, _>(Error::Transport("connection reset".into()))
                })
                .await
        }
    });
    let results = join_all(callers).await;
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    for result in &results {
        assert_eq!(
            result.as_ref().unwrap_err(),
            &Error::Transport("connection reset".into())
        );
    }
    assert!(!cache.contains("https://svc"));

    let retry_fetches = Arc::clone(&fetches);
    let entry = cache
        .get_or_add_async("https://svc", move |_| async move {
            retry_fetches.fetch_add(1, Ordering::SeqCst);
            Ok(MetadataDocument::new(common::northwind_json("4.0")))
        })
        .await
        .unwrap();
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
    assert_eq!(entry.key(), "https://svc");
}

#[tokio::test]
async fn fetch_bodies_are_serialized_across_keys() {
    let cache = MetadataCache::new();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let callers = (0..4).map(|idx| {
        let cache = cache.clone();
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        async move {
            cache
                .get_or_add_async(&format!("https://svc{idx}"), move |_| async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(MetadataDocument::new(common::northwind_json("4.0")))
                })
                .await
        }
    });
    for result in join_all(callers).await {
        result.unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(cache.len(), 4);
}

#[tokio::test]
async fn abandoned_fetch_does_not_block_other_keys() {
    let cache = MetadataCache::new();
    let abandoned = tokio::time::timeout(
        Duration::from_millis(20),
        cache.get_or_add_async("https://svc-a", |_| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(MetadataDocument::new(common::northwind_json("4.0")))
        }),
    )
    .await;
    assert!(abandoned.is_err());

    let other = tokio::time::timeout(
        Duration::from_secs(2),
        cache.get_or_add_async("https://svc-b", |_| async {
            Ok(MetadataDocument::new(common::northwind_json("3.0")))
        }),
    )
    .await
    .expect("unrelated key finishes")
    .unwrap();
    assert_eq!(other.key(), "https://svc-b");
    assert!(cache.contains("https://svc-a"));
}

#[tokio::test]
async fn clear_cancels_in_flight_fetch() {
    let cache = MetadataCache::new();
    let fetches = Arc::new(AtomicUsize::new(0));
    let waiter = {
        let cache = cache.clone();
        let fetches = Arc::clone(&fetches);
        tokio::spawn(async move {
            cache
                .get_or_add_async("https://svc", move |cancel| async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    tokio::select! {
                        _ = cancel.cancelled() => Err(Error::Cancelled),
                        _ = tokio::time::sleep(Duration::from_secs(30)) => {
                            Ok(MetadataDocument::new(common::northwind_json("4.0")))
                        }
                    }
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cache.clear("https://svc");

    let err = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("cleared fetch ends promptly")
        .unwrap()
        .unwrap_err();
    assert_eq!(err, Error::Cancelled);
    assert!(!cache.contains("https://svc"));

    let retry_fetches = Arc::clone(&fetches);
    cache
        .get_or_add_async("https://svc", move |_| async move {
            retry_fetches.fetch_add(1, Ordering::SeqCst);
            Ok(MetadataDocument::new(common::northwind_json("4.0")))
        })
        .await
        .unwrap();
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
}

#[test]
fn synchronous_factory_runs_once_across_threads() {
    let cache = MetadataCache::new();
    let fetches = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = cache.clone();
            let fetches = Arc::clone(&fetches);
            thread::spawn(move || {
                cache
                    .get_or_add("https://svc", || {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(20));
                        Ok(MetadataDocument::new(common::northwind_json("4.0")))
                    })
                    .unwrap()
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn clear_evicts_entries_and_resolvers() {
    let cache = MetadataCache::new();
    let entry = cache
        .get_or_add("https://svc", || {
            Ok(MetadataDocument::new(common::northwind_json("3.0")))
        })
        .unwrap();
    let bound = cache.bind(&entry, &JsonModelLoader).await.unwrap();
    assert_eq!(bound.version, ProtocolVersion::V3);
    assert_eq!(cache.resolver_count(), 1);

    cache.clear("https://svc");
    assert!(!cache.contains("https://svc"));
    assert_eq!(cache.resolver_count(), 0);

    cache
        .get_or_add("https://other", || {
            Ok(MetadataDocument::new(common::northwind_json("4.0")))
        })
        .unwrap();
    cache.clear_all();
    assert!(cache.is_empty());
}
