//! Error taxonomy shared across components
//!
//! Every error carries a kind, a human message, an optional correlation id,
//! a timestamp, and a detail map. HTTP status mapping lives next to the
//! kinds so the API layers stay in agreement.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Classified error kinds, grouped by how callers should react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Validation: never retried
    BadRequest,
    InvalidConfig,
    // Authorization
    Unauthorized,
    Forbidden,
    // Not found
    BuildNotFound,
    WorkerNotFound,
    // Capacity: caller may retry after backoff
    QueueFull,
    WorkerCapacityExceeded,
    ServiceUnavailable,
    // Timeouts
    BuildTimeout,
    WorkerTimeout,
    // Internal: always logged, retryable for builds
    StorageError,
    CacheError,
    WorkerInternal,
    InternalError,
}

impl ErrorKind {
    /// HTTP status code this kind surfaces as.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::BadRequest | ErrorKind::InvalidConfig => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::BuildNotFound | ErrorKind::WorkerNotFound => 404,
            ErrorKind::BuildTimeout | ErrorKind::WorkerTimeout => 408,
            ErrorKind::QueueFull
            | ErrorKind::WorkerCapacityExceeded
            | ErrorKind::ServiceUnavailable => 503,
            ErrorKind::StorageError
            | ErrorKind::CacheError
            | ErrorKind::WorkerInternal
            | ErrorKind::InternalError => 500,
        }
    }

    /// Whether a build failure of this kind goes back through the dispatch
    /// queue (worker faults) rather than terminating the record.
    pub fn is_retryable_build_failure(&self) -> bool {
        matches!(
            self,
            ErrorKind::WorkerInternal
                | ErrorKind::WorkerTimeout
                | ErrorKind::WorkerCapacityExceeded
                | ErrorKind::ServiceUnavailable
        )
    }

    /// Stable identifier used in wire payloads and logs.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "BAD_REQUEST",
            ErrorKind::InvalidConfig => "INVALID_CONFIG",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::BuildNotFound => "BUILD_NOT_FOUND",
            ErrorKind::WorkerNotFound => "WORKER_NOT_FOUND",
            ErrorKind::QueueFull => "QUEUE_FULL",
            ErrorKind::WorkerCapacityExceeded => "WORKER_CAPACITY_EXCEEDED",
            ErrorKind::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorKind::BuildTimeout => "BUILD_TIMEOUT",
            ErrorKind::WorkerTimeout => "WORKER_TIMEOUT",
            ErrorKind::StorageError => "STORAGE_ERROR",
            ErrorKind::CacheError => "CACHE_ERROR",
            ErrorKind::WorkerInternal => "WORKER_INTERNAL",
            ErrorKind::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Structured error surfaced across component boundaries.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ServiceError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

/// Convenience alias for fallible cross-component operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    /// Create a new error with the given kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            correlation_id: None,
            timestamp: Utc::now(),
            details: BTreeMap::new(),
        }
    }

    /// Attach a correlation id (typically the build request id).
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Attach one structured detail entry.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Shorthand for an internal error wrapping a lower-level failure.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        ServiceError::new(ErrorKind::InternalError, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(ErrorKind::BadRequest.http_status(), 400);
        assert_eq!(ErrorKind::Unauthorized.http_status(), 401);
        assert_eq!(ErrorKind::Forbidden.http_status(), 403);
        assert_eq!(ErrorKind::BuildNotFound.http_status(), 404);
        assert_eq!(ErrorKind::BuildTimeout.http_status(), 408);
        assert_eq!(ErrorKind::QueueFull.http_status(), 503);
        assert_eq!(ErrorKind::WorkerCapacityExceeded.http_status(), 503);
        assert_eq!(ErrorKind::StorageError.http_status(), 500);
    }

    #[test]
    fn test_retryable_build_failures() {
        assert!(ErrorKind::WorkerInternal.is_retryable_build_failure());
        assert!(ErrorKind::WorkerTimeout.is_retryable_build_failure());
        assert!(ErrorKind::WorkerCapacityExceeded.is_retryable_build_failure());
        // User-space problems are never retried
        assert!(!ErrorKind::BadRequest.is_retryable_build_failure());
        assert!(!ErrorKind::BuildTimeout.is_retryable_build_failure());
    }

    #[test]
    fn test_error_builder() {
        let err = ServiceError::new(ErrorKind::QueueFull, "queue at capacity")
            .with_correlation_id("req-42")
            .with_detail("capacity", "100");
        assert_eq!(err.kind, ErrorKind::QueueFull);
        assert_eq!(err.correlation_id.as_deref(), Some("req-42"));
        assert_eq!(err.details.get("capacity").map(String::as_str), Some("100"));
        assert!(err.to_string().contains("QUEUE_FULL"));
    }

    #[test]
    fn test_error_round_trips_as_json() {
        let err = ServiceError::new(ErrorKind::WorkerInternal, "disk full");
        let json = serde_json::to_string(&err).unwrap();
        let back: ServiceError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, ErrorKind::WorkerInternal);
        assert_eq!(back.message, "disk full");
    }
}
