//! Pluggable storage backends
//!
//! The cache owns the index and the eviction policy; a backend is strictly
//! a byte store with the capability set `{put_blob, get_blob, delete_blob,
//! iterate_keys, total_bytes}`. Crash durability is the backend's business;
//! `iterate_keys` is what lets the index rebuild itself at startup.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::entry::EntryMeta;
use crate::error::{CacheError, CacheResult};

/// Byte-store capability set the cache is polymorphic over.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store a payload and its metadata sidecar. Overwrites an existing key.
    async fn put_blob(&self, key: &str, payload: &[u8], meta: &EntryMeta) -> CacheResult<()>;

    /// Fetch a payload. `None` when the key is absent.
    async fn get_blob(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Remove a payload and its sidecar. Absent keys are a no-op.
    async fn delete_blob(&self, key: &str) -> CacheResult<()>;

    /// Walk the store, yielding each live key's metadata sidecar.
    async fn iterate_keys(&self) -> CacheResult<Vec<EntryMeta>>;

    /// Total payload bytes currently stored.
    async fn total_bytes(&self) -> CacheResult<u64>;
}

/// Storage variant selector, as it appears in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageType {
    Filesystem,
    ObjectStore,
    Memory,
}

/// Blobs as files under a base directory: `<dir>/<key>.data` holds the
/// payload, `<dir>/<key>.meta` the JSON metadata sidecar. A key with a
/// missing or unreadable half is treated as absent on load.
pub struct FilesystemStorage {
    base_dir: PathBuf,
}

impl FilesystemStorage {
    pub async fn new(base_dir: impl Into<PathBuf>) -> CacheResult<Self> {
        let base_dir = base_dir.into();
        tokio::fs::create_dir_all(&base_dir).await?;
        Ok(Self { base_dir })
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{key}.data"))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{key}.meta"))
    }
}

#[async_trait]
impl StorageBackend for FilesystemStorage {
    async fn put_blob(&self, key: &str, payload: &[u8], meta: &EntryMeta) -> CacheResult<()> {
        let sidecar = serde_json::to_vec_pretty(meta)?;
        tokio::fs::write(self.data_path(key), payload).await?;
        tokio::fs::write(self.meta_path(key), sidecar).await?;
        Ok(())
    }

    async fn get_blob(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        match tokio::fs::read(self.data_path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::Io(e)),
        }
    }

    async fn delete_blob(&self, key: &str) -> CacheResult<()> {
        for path in [self.data_path(key), self.meta_path(key)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::Io(e)),
            }
        }
        Ok(())
    }

    async fn iterate_keys(&self) -> CacheResult<Vec<EntryMeta>> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(dirent) = dir.next_entry().await? {
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("meta") {
                continue;
            }
            let meta = match read_sidecar(&path).await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable metadata sidecar");
                    continue;
                }
            };
            // A sidecar without its payload is a crash leftover
            if !tokio::fs::try_exists(self.data_path(&meta.key)).await? {
                debug!(key = %meta.key, "sidecar has no payload, treating as absent");
                continue;
            }
            entries.push(meta);
        }
        Ok(entries)
    }

    async fn total_bytes(&self) -> CacheResult<u64> {
        Ok(self.iterate_keys().await?.iter().map(|m| m.size).sum())
    }
}

async fn read_sidecar(path: &Path) -> CacheResult<EntryMeta> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// In-memory byte store; payloads live only for the process lifetime.
#[derive(Default)]
pub struct MemoryStorage {
    blobs: RwLock<HashMap<String, (Vec<u8>, EntryMeta)>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn put_blob(&self, key: &str, payload: &[u8], meta: &EntryMeta) -> CacheResult<()> {
        self.blobs
            .write()
            .await
            .insert(key.to_string(), (payload.to_vec(), meta.clone()));
        Ok(())
    }

    async fn get_blob(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(key).map(|(payload, _)| payload.clone()))
    }

    async fn delete_blob(&self, key: &str) -> CacheResult<()> {
        self.blobs.write().await.remove(key);
        Ok(())
    }

    async fn iterate_keys(&self) -> CacheResult<Vec<EntryMeta>> {
        Ok(self
            .blobs
            .read()
            .await
            .values()
            .map(|(_, meta)| meta.clone())
            .collect())
    }

    async fn total_bytes(&self) -> CacheResult<u64> {
        Ok(self
            .blobs
            .read()
            .await
            .values()
            .map(|(payload, _)| payload.len() as u64)
            .sum())
    }
}

/// Remote byte store over plain HTTP.
///
/// Contract: `PUT <base>/<key>` stores the raw body (metadata travels in the
/// `x-meta` header as JSON), `GET <base>/<key>` returns it (404 = absent),
/// `DELETE <base>/<key>` removes it, and `GET <base>/` lists the stored
/// sidecars as a JSON array. Any S3-proxy-style byte store that speaks this
/// surface plugs in here.
pub struct ObjectStoreStorage {
    client: reqwest::Client,
    base_url: String,
}

impl ObjectStoreStorage {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn key_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreStorage {
    async fn put_blob(&self, key: &str, payload: &[u8], meta: &EntryMeta) -> CacheResult<()> {
        let meta_json = serde_json::to_string(meta)?;
        let response = self
            .client
            .put(self.key_url(key))
            .header("x-meta", meta_json)
            .body(payload.to_vec())
            .send()
            .await
            .map_err(|e| CacheError::Storage(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CacheError::Storage(format!(
                "object store put returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn get_blob(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let response = self
            .client
            .get(self.key_url(key))
            .send()
            .await
            .map_err(|e| CacheError::Storage(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(CacheError::Storage(format!(
                "object store get returned {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| CacheError::Storage(e.to_string()))?;
        Ok(Some(bytes.to_vec()))
    }

    async fn delete_blob(&self, key: &str) -> CacheResult<()> {
        let response = self
            .client
            .delete(self.key_url(key))
            .send()
            .await
            .map_err(|e| CacheError::Storage(e.to_string()))?;
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(CacheError::Storage(format!(
                "object store delete returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn iterate_keys(&self) -> CacheResult<Vec<EntryMeta>> {
        let response = self
            .client
            .get(format!("{}/", self.base_url))
            .send()
            .await
            .map_err(|e| CacheError::Storage(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CacheError::Storage(format!(
                "object store list returned {}",
                response.status()
            )));
        }
        response
            .json::<Vec<EntryMeta>>()
            .await
            .map_err(|e| CacheError::Storage(e.to_string()))
    }

    async fn total_bytes(&self) -> CacheResult<u64> {
        Ok(self.iterate_keys().await?.iter().map(|m| m.size).sum())
    }
}
