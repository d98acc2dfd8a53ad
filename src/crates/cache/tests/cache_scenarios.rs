//! End-to-end cache behavior over the filesystem backend

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use cache::{ArtifactCache, CacheLimits, FilesystemStorage};

async fn filesystem_cache(dir: &std::path::Path, max_cache_size: u64) -> ArtifactCache {
    let storage = Arc::new(FilesystemStorage::new(dir).await.unwrap());
    let limits = CacheLimits {
        max_cache_size,
        max_entry_size: max_cache_size,
        default_ttl_seconds: 0,
    };
    ArtifactCache::open(storage, limits).await.unwrap()
}

fn meta(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn cache_hit_and_miss() {
    let dir = tempfile::tempdir().unwrap();
    let cache = filesystem_cache(dir.path(), 1 << 20).await;

    let payload = vec![7u8; 1024];
    cache.put("K1", &payload, meta(&[]), None).await.unwrap();

    let hit = cache.get("K1").await.unwrap().expect("K1 should be found");
    assert_eq!(hit.size, 1024);
    assert_eq!(hit.payload, payload);

    assert!(cache.get("Kmissing").await.unwrap().is_none());

    let stats = cache.stats().await;
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
}

#[tokio::test]
async fn lru_eviction_keeps_recently_accessed() {
    let dir = tempfile::tempdir().unwrap();
    // Budget of 3 KiB with 1 KiB entries: a fourth put must evict one
    let cache = filesystem_cache(dir.path(), 3 * 1024).await;
    let block = vec![0u8; 1024];

    cache.put("K1", &block, meta(&[]), None).await.unwrap();
    cache.put("K2", &block, meta(&[]), None).await.unwrap();
    cache.put("K3", &block, meta(&[]), None).await.unwrap();
    // K1 becomes most-recently-used, leaving K2 as the LRU victim
    cache.get("K1").await.unwrap().unwrap();
    cache.put("K4", &block, meta(&[]), None).await.unwrap();

    let mut keys = cache.live_keys().await;
    keys.sort();
    assert_eq!(keys, vec!["K1", "K3", "K4"]);
    assert!(cache.get("K2").await.unwrap().is_none());

    let stats = cache.stats().await;
    assert!(stats.total_bytes <= 3 * 1024);
}

#[tokio::test]
async fn ttl_expiry_removes_entry_from_index() {
    let dir = tempfile::tempdir().unwrap();
    let cache = filesystem_cache(dir.path(), 1 << 20).await;

    cache.put("K", b"payload", meta(&[]), Some(1)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(cache.get("K").await.unwrap().is_none());
    assert!(cache.live_keys().await.is_empty());
}

#[tokio::test]
async fn index_rebuild_round_trip() {
    let dir = tempfile::tempdir().unwrap();

    let first = filesystem_cache(dir.path(), 1 << 20).await;
    first
        .put("alpha", b"one", meta(&[("task", "assemble")]), None)
        .await
        .unwrap();
    first
        .put("beta", b"two-two", meta(&[("task", "test")]), None)
        .await
        .unwrap();
    first.put("gamma", b"three", meta(&[]), None).await.unwrap();
    first.delete("gamma").await.unwrap();
    let original_hash = first.get("alpha").await.unwrap().unwrap().hash;
    drop(first);

    // A fresh instance over the same directory must see the same live set
    let second = filesystem_cache(dir.path(), 1 << 20).await;
    let mut keys = second.live_keys().await;
    keys.sort();
    assert_eq!(keys, vec!["alpha", "beta"]);

    let alpha = second.get("alpha").await.unwrap().unwrap();
    assert_eq!(alpha.payload, b"one");
    assert_eq!(alpha.hash, original_hash);
    assert_eq!(alpha.metadata.get("task").map(String::as_str), Some("assemble"));

    let beta = second.get("beta").await.unwrap().unwrap();
    assert_eq!(beta.payload, b"two-two");
}

#[tokio::test]
async fn size_budget_holds_across_many_puts() {
    let dir = tempfile::tempdir().unwrap();
    let cache = filesystem_cache(dir.path(), 4 * 1024).await;

    for i in 0..16 {
        let key = format!("entry-{i}");
        cache.put(&key, &vec![1u8; 1024], meta(&[]), None).await.unwrap();
        let stats = cache.stats().await;
        assert!(
            stats.total_bytes <= 4 * 1024,
            "budget exceeded after put {i}: {} bytes",
            stats.total_bytes
        );
    }
    assert_eq!(cache.stats().await.entry_count, 4);
}

#[tokio::test]
async fn sweeper_evicts_expired_entries() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(filesystem_cache(dir.path(), 1 << 20).await);
    let shutdown = protocol::Shutdown::new();

    cache.put("short", b"x", meta(&[]), Some(1)).await.unwrap();
    cache.put("keep", b"y", meta(&[]), None).await.unwrap();

    let handle = cache.spawn_sweeper(Duration::from_millis(200), shutdown.clone());
    tokio::time::sleep(Duration::from_millis(1500)).await;
    shutdown.trigger();
    handle.await.unwrap();

    let mut keys = cache.live_keys().await;
    keys.sort();
    assert_eq!(keys, vec!["keep"]);
}
