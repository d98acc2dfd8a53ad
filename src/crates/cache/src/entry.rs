//! Cache entry metadata
//!
//! One `EntryMeta` per live key. The same struct is persisted as the
//! filesystem backend's `.meta` sidecar, so the index can be rebuilt from
//! disk at startup.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Metadata tracked for one cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMeta {
    pub key: String,
    /// SHA-256 hex digest over the payload
    pub hash: String,
    /// Payload size in bytes
    pub size: u64,
    /// Caller-supplied metadata, opaque to the cache
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    #[serde(default)]
    pub access_count: u64,
    /// 0 disables expiry for this entry
    #[serde(default)]
    pub ttl_seconds: u64,
}

impl EntryMeta {
    /// Build metadata for a payload about to be stored.
    pub fn for_payload(
        key: impl Into<String>,
        payload: &[u8],
        metadata: BTreeMap<String, String>,
        ttl_seconds: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            hash: payload_hash(payload),
            size: payload.len() as u64,
            metadata,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            ttl_seconds,
        }
    }

    /// Whether `created_at + ttl` is in the past. TTL 0 never expires.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        if self.ttl_seconds == 0 {
            return false;
        }
        self.created_at + Duration::seconds(self.ttl_seconds as i64) <= now
    }

    /// Record one access for LRU accounting.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_accessed_at = now;
        self.access_count += 1;
    }

    /// Eviction ordering key: least-recently-accessed first, ties broken by
    /// lower access count, then lexicographic key.
    pub fn eviction_rank(&self) -> (DateTime<Utc>, u64, String) {
        (self.last_accessed_at, self.access_count, self.key.clone())
    }
}

/// SHA-256 hex digest of a payload.
pub fn payload_hash(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Validate a key against the safe charset shared by all backends.
pub fn validate_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}
