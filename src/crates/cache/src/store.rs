//! The artifact cache proper: index, admission, eviction, expiry, stats
//!
//! The index is the authority on live keys. `put`/`delete` (and the expiry
//! paths) hold the index write lock across the backend call, so operations
//! on the same key are linearized and the index never claims less than
//! storage holds. Access accounting is in-memory only; it reverts across a
//! restart, which the LRU contract tolerates.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use protocol::Shutdown;

use crate::entry::{payload_hash, validate_key, EntryMeta};
use crate::error::{CacheError, CacheResult};
use crate::retry::{retry_transient, RetryPolicy};
use crate::storage::StorageBackend;

/// Size and TTL budgets for one cache instance.
#[derive(Debug, Clone)]
pub struct CacheLimits {
    /// Upper bound on the sum of live entry sizes, in bytes
    pub max_cache_size: u64,
    /// Upper bound on a single entry, in bytes
    pub max_entry_size: u64,
    /// TTL applied when the caller does not pass one; 0 = no expiry
    pub default_ttl_seconds: u64,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_cache_size: 1024 * 1024 * 1024, // 1 GiB
            max_entry_size: 256 * 1024 * 1024,
            default_ttl_seconds: 0,
        }
    }
}

/// A successful cache probe.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub payload: Vec<u8>,
    pub metadata: BTreeMap<String, String>,
    pub hash: String,
    pub size: u64,
}

/// Monotonic counters reported by `stats()`; reset only on process restart.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entry_count: u64,
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub expirations: u64,
    pub uptime_seconds: u64,
}

struct IndexState {
    entries: HashMap<String, EntryMeta>,
    total_size: u64,
}

/// Keyed blob store with TTL and size-bounded LRU eviction.
pub struct ArtifactCache {
    storage: Arc<dyn StorageBackend>,
    index: RwLock<IndexState>,
    limits: CacheLimits,
    retry: RetryPolicy,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    started_at: Instant,
}

impl ArtifactCache {
    /// Open a cache over `storage`, rebuilding the index from whatever the
    /// backend already holds.
    pub async fn open(storage: Arc<dyn StorageBackend>, limits: CacheLimits) -> CacheResult<Self> {
        let recovered = storage.iterate_keys().await?;
        let total_size = recovered.iter().map(|m| m.size).sum();
        let mut entries = HashMap::with_capacity(recovered.len());
        for meta in recovered {
            entries.insert(meta.key.clone(), meta);
        }
        info!(
            entries = entries.len(),
            total_bytes = total_size,
            "cache index rebuilt from storage"
        );
        Ok(Self {
            storage,
            index: RwLock::new(IndexState { entries, total_size }),
            limits,
            retry: RetryPolicy::default(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            started_at: Instant::now(),
        })
    }

    /// Store `payload` under `key`, evicting as needed to honor the size
    /// budget. Visible to `get` on this node as soon as this returns.
    pub async fn put(
        &self,
        key: &str,
        payload: &[u8],
        metadata: BTreeMap<String, String>,
        ttl_seconds: Option<u64>,
    ) -> CacheResult<EntryMeta> {
        if !validate_key(key) {
            return Err(CacheError::InvalidKey(key.to_string()));
        }
        let size = payload.len() as u64;
        if size > self.limits.max_entry_size {
            return Err(CacheError::EntryTooLarge {
                size,
                limit: self.limits.max_entry_size,
            });
        }
        if size > self.limits.max_cache_size {
            return Err(CacheError::EntryTooLarge {
                size,
                limit: self.limits.max_cache_size,
            });
        }

        let ttl = ttl_seconds.unwrap_or(self.limits.default_ttl_seconds);
        let meta = EntryMeta::for_payload(key, payload, metadata, ttl);

        let mut state = self.index.write().await;

        // Overwrite: the old entry leaves the budget before admission
        if let Some(previous) = state.entries.remove(key) {
            state.total_size = state.total_size.saturating_sub(previous.size);
        }

        self.evict_for_space(&mut state, size).await;

        let storage = Arc::clone(&self.storage);
        retry_transient(&self.retry, "put_blob", || {
            let storage = Arc::clone(&storage);
            let meta = meta.clone();
            async move { storage.put_blob(&meta.key, payload, &meta).await }
        })
        .await
        .map_err(|e| CacheError::Storage(format!("put {key}: {e}")))?;

        state.total_size += size;
        state.entries.insert(key.to_string(), meta.clone());
        debug!(key, size, ttl, "cache entry stored");
        Ok(meta)
    }

    /// Probe for `key`. Expired entries are removed on the fly and reported
    /// as absent; a hit updates the LRU accounting.
    pub async fn get(&self, key: &str) -> CacheResult<Option<CacheHit>> {
        let now = Utc::now();
        let mut state = self.index.write().await;

        let meta = match state.entries.get(key) {
            Some(meta) => meta.clone(),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        };

        if meta.is_expired_at(now) {
            self.remove_entry(&mut state, key, "expired").await;
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let storage = Arc::clone(&self.storage);
        let payload = retry_transient(&self.retry, "get_blob", || {
            let storage = Arc::clone(&storage);
            let key = key.to_string();
            async move { storage.get_blob(&key).await }
        })
        .await
        .map_err(|e| CacheError::Storage(format!("get {key}: {e}")))?;

        let payload = match payload {
            Some(payload) => payload,
            None => {
                // Index claimed a key storage no longer holds (crash leftover)
                warn!(key, "index entry had no payload in storage, dropping");
                self.drop_index_entry(&mut state, key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        };

        if payload_hash(&payload) != meta.hash {
            warn!(key, "payload integrity mismatch, evicting entry");
            self.remove_entry(&mut state, key, "corrupt").await;
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        if let Some(entry) = state.entries.get_mut(key) {
            entry.touch(now);
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(CacheHit {
            metadata: meta.metadata,
            hash: meta.hash,
            size: meta.size,
            payload,
        }))
    }

    /// Remove `key`; succeeds whether or not the key exists.
    pub async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut state = self.index.write().await;
        if state.entries.contains_key(key) {
            self.remove_entry(&mut state, key, "deleted").await;
        } else {
            // Still clear any stray blob so storage stays an exact subset
            let storage = Arc::clone(&self.storage);
            if let Err(e) = storage.delete_blob(key).await {
                warn!(key, error = %e, "delete of unindexed blob failed");
            }
        }
        Ok(())
    }

    /// Evict every expired entry now; returns how many were removed.
    pub async fn cleanup(&self) -> CacheResult<usize> {
        let now = Utc::now();
        let mut state = self.index.write().await;
        let expired: Vec<String> = state
            .entries
            .values()
            .filter(|m| m.is_expired_at(now))
            .map(|m| m.key.clone())
            .collect();
        for key in &expired {
            self.remove_entry(&mut state, key, "expired").await;
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        if !expired.is_empty() {
            info!(removed = expired.len(), "ttl sweep evicted expired entries");
        }
        Ok(expired.len())
    }

    /// Current counters.
    pub async fn stats(&self) -> CacheStats {
        let state = self.index.read().await;
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            entry_count: state.entries.len() as u64,
            total_bytes: state.total_size,
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Keys currently live in the index, unordered.
    pub async fn live_keys(&self) -> Vec<String> {
        self.index.read().await.entries.keys().cloned().collect()
    }

    /// Periodic TTL sweep until shutdown.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        period: Duration,
        shutdown: Shutdown,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = cache.cleanup().await {
                            warn!(error = %e, "ttl sweep failed");
                        }
                    }
                    _ = shutdown.wait() => {
                        debug!("ttl sweeper stopping");
                        return;
                    }
                }
            }
        })
    }

    /// Evict until `incoming` more bytes fit inside the budget. Expired
    /// entries go first; live entries leave in LRU order (ties by lower
    /// access count, then key). Never fails: a backend error is logged and
    /// the index entry is removed regardless, keeping the index an upper
    /// bound on live storage.
    async fn evict_for_space(&self, state: &mut IndexState, incoming: u64) {
        let now = Utc::now();
        while state.total_size + incoming > self.limits.max_cache_size {
            let victim = state
                .entries
                .values()
                .filter(|m| m.is_expired_at(now))
                .min_by_key(|m| m.eviction_rank())
                .or_else(|| state.entries.values().min_by_key(|m| m.eviction_rank()))
                .map(|m| m.key.clone());
            let Some(key) = victim else {
                break;
            };
            self.remove_entry(state, &key, "evicted").await;
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Remove one entry from index and storage; storage failures are logged
    /// and do not keep the entry alive.
    async fn remove_entry(&self, state: &mut IndexState, key: &str, reason: &str) {
        if let Err(e) = self.storage.delete_blob(key).await {
            warn!(key, reason, error = %e, "backend delete failed, dropping index entry anyway");
        }
        self.drop_index_entry(state, key);
        debug!(key, reason, "cache entry removed");
    }

    fn drop_index_entry(&self, state: &mut IndexState, key: &str) {
        if let Some(meta) = state.entries.remove(key) {
            state.total_size = state.total_size.saturating_sub(meta.size);
        }
    }
}
