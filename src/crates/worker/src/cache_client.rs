//! Worker-side cache access
//!
//! One handle over the two deployment shapes: an embedded filesystem cache
//! for single-host setups, or a remote cache server for fleets. Probe
//! failures degrade to misses and populate failures are logged; the cache
//! never fails a build.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use cache::{ArtifactCache, CacheLimits, FilesystemStorage};

use crate::config::WorkerConfig;
use crate::error::WorkerError;

/// Cache access for the build state machine.
pub enum CacheHandle {
    /// Caching disabled by configuration
    Disabled,
    /// Embedded cache over a local directory
    Local(Arc<ArtifactCache>),
    /// Remote cache server speaking the cache HTTP surface
    Remote(RemoteCache),
}

impl CacheHandle {
    /// Build the handle the worker config asks for.
    pub async fn from_config(config: &WorkerConfig) -> Result<Self, WorkerError> {
        if !config.cache_enabled {
            return Ok(CacheHandle::Disabled);
        }
        if let Some(address) = &config.cache_address {
            debug!(address, "using remote artifact cache");
            return Ok(CacheHandle::Remote(RemoteCache::new(address.clone())));
        }
        let dir = config.cache_dir();
        let storage = Arc::new(FilesystemStorage::new(&dir).await?);
        let limits = CacheLimits {
            max_cache_size: config.max_cache_size,
            ..Default::default()
        };
        let cache = ArtifactCache::open(storage, limits).await?;
        debug!(dir = %dir.display(), "using embedded artifact cache");
        Ok(CacheHandle::Local(Arc::new(cache)))
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, CacheHandle::Disabled)
    }

    /// Probe for a bundle. Any failure is a miss.
    pub async fn probe(&self, key: &str) -> Option<Vec<u8>> {
        match self {
            CacheHandle::Disabled => None,
            CacheHandle::Local(cache) => match cache.get(key).await {
                Ok(hit) => hit.map(|h| h.payload),
                Err(e) => {
                    warn!(key, error = %e, "cache probe failed, treating as miss");
                    None
                }
            },
            CacheHandle::Remote(remote) => remote.get(key).await,
        }
    }

    /// Store a bundle. Failures are logged and swallowed.
    pub async fn populate(&self, key: &str, payload: &[u8], metadata: BTreeMap<String, String>) {
        match self {
            CacheHandle::Disabled => {}
            CacheHandle::Local(cache) => {
                if let Err(e) = cache.put(key, payload, metadata, None).await {
                    warn!(key, error = %e, "cache populate failed, build result unaffected");
                }
            }
            CacheHandle::Remote(remote) => remote.put(key, payload, metadata).await,
        }
    }
}

/// HTTP client against a `cache-server` instance.
pub struct RemoteCache {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteCache {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            base_url = format!("http://{base_url}");
        }
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let url = format!("{}/cache/{key}", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                response.bytes().await.ok().map(|b| b.to_vec())
            }
            Ok(response) if response.status() == reqwest::StatusCode::NOT_FOUND => None,
            Ok(response) => {
                warn!(key, status = %response.status(), "remote cache probe failed");
                None
            }
            Err(e) => {
                warn!(key, error = %e, "remote cache unreachable, treating as miss");
                None
            }
        }
    }

    async fn put(&self, key: &str, payload: &[u8], metadata: BTreeMap<String, String>) {
        let url = format!("{}/cache/{key}", self.base_url);
        let meta_json = serde_json::to_string(&metadata).unwrap_or_else(|_| "{}".to_string());
        match self
            .client
            .put(&url)
            .header("x-meta", meta_json)
            .body(payload.to_vec())
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!(key, status = %response.status(), "remote cache populate rejected");
            }
            Err(e) => {
                warn!(key, error = %e, "remote cache populate failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_handle_never_hits() {
        let handle = CacheHandle::Disabled;
        assert!(!handle.is_enabled());
        assert!(handle.probe("any").await.is_none());
        // populate must be a no-op, not a panic
        handle.populate("any", b"data", BTreeMap::new()).await;
    }

    #[tokio::test]
    async fn test_local_handle_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorkerConfig {
            cache_enabled: true,
            cache_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let handle = CacheHandle::from_config(&config).await.unwrap();
        assert!(handle.is_enabled());

        assert!(handle.probe("fp1").await.is_none());
        handle.populate("fp1", b"bundle", BTreeMap::new()).await;
        assert_eq!(handle.probe("fp1").await.unwrap(), b"bundle");
    }

    #[tokio::test]
    async fn test_disabled_by_config() {
        let config = WorkerConfig {
            cache_enabled: false,
            ..Default::default()
        };
        let handle = CacheHandle::from_config(&config).await.unwrap();
        assert!(!handle.is_enabled());
    }

    #[test]
    fn test_remote_base_url_normalization() {
        let remote = RemoteCache::new("10.0.0.9:8085");
        assert_eq!(remote.base_url, "http://10.0.0.9:8085");
        let remote = RemoteCache::new("https://cache.internal/");
        assert_eq!(remote.base_url, "https://cache.internal");
    }
}
