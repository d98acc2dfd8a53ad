//! Artifact cache for gantry
//!
//! A keyed blob store with TTL expiry and size-bounded LRU eviction. The
//! cache owns its index and eviction policy and is polymorphic over a
//! storage backend capability set (filesystem, object store, in-memory).
//! It embeds into the worker or runs standalone behind `cache-server` for
//! distributed deployments.

pub mod config;
pub mod entry;
pub mod error;
pub mod retry;
pub mod server;
pub mod storage;
pub mod store;

pub use config::{CacheServiceConfig, ConfigError};
pub use entry::{payload_hash, EntryMeta};
pub use error::{CacheError, CacheResult};
pub use server::{create_router, AppState};
pub use storage::{
    FilesystemStorage, MemoryStorage, ObjectStoreStorage, StorageBackend, StorageType,
};
pub use store::{ArtifactCache, CacheHit, CacheLimits, CacheStats};
