//! Cache error types

use thiserror::Error;

/// Errors surfaced by the cache and its storage backends.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Backend I/O failed after transient retries were exhausted
    #[error("storage error: {0}")]
    Storage(String),

    /// Payload exceeds the per-entry size limit
    #[error("entry of {size} bytes exceeds the per-entry limit of {limit} bytes")]
    EntryTooLarge { size: u64, limit: u64 },

    /// Key contains characters the storage layer cannot represent safely
    #[error("invalid cache key {0:?}: keys must match [A-Za-z0-9._-]+")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata serialization error: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Result alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

impl CacheError {
    /// Whether retrying the operation might help.
    pub fn is_transient(&self) -> bool {
        matches!(self, CacheError::Io(_) | CacheError::Storage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_too_large_message() {
        let err = CacheError::EntryTooLarge { size: 2048, limit: 1024 };
        assert!(err.to_string().contains("2048"));
        assert!(err.to_string().contains("1024"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(CacheError::Storage("disk full".to_string()).is_transient());
        assert!(!CacheError::InvalidKey("a/b".to_string()).is_transient());
        assert!(!CacheError::EntryTooLarge { size: 1, limit: 0 }.is_transient());
    }
}
