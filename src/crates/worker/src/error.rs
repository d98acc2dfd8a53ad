//! Worker error types

use std::time::Duration;
use thiserror::Error;

use protocol::{ErrorKind, ServiceError};

/// Failures inside the worker.
///
/// A non-zero exit from the build tool is not an error at this level; it is
/// a successfully delivered failed build. These variants cover the worker's
/// own faults and request problems.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("invalid build request: {0}")]
    InvalidRequest(String),

    #[error("worker at capacity: {in_flight} of {max_concurrent} builds in flight")]
    CapacityExceeded { in_flight: u32, max_concurrent: u32 },

    #[error("build timed out after {0:?}")]
    BuildTimeout(Duration),

    #[error("failed to run build tool {tool:?}: {reason}")]
    ToolSpawn { tool: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache error: {0}")]
    Cache(#[from] cache::CacheError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal worker error: {0}")]
    Internal(String),
}

impl WorkerError {
    /// The taxonomy kind this failure reports as.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::InvalidRequest(_) => ErrorKind::BadRequest,
            WorkerError::CapacityExceeded { .. } => ErrorKind::WorkerCapacityExceeded,
            WorkerError::BuildTimeout(_) => ErrorKind::BuildTimeout,
            WorkerError::Config(_) => ErrorKind::InvalidConfig,
            WorkerError::Cache(_) => ErrorKind::CacheError,
            WorkerError::ToolSpawn { .. } | WorkerError::Io(_) | WorkerError::Internal(_) => {
                ErrorKind::WorkerInternal
            }
        }
    }
}

impl From<WorkerError> for ServiceError {
    fn from(err: WorkerError) -> Self {
        ServiceError::new(err.kind(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(
            WorkerError::InvalidRequest("x".into()).kind(),
            ErrorKind::BadRequest
        );
        assert_eq!(
            WorkerError::CapacityExceeded { in_flight: 2, max_concurrent: 2 }.kind(),
            ErrorKind::WorkerCapacityExceeded
        );
        assert_eq!(
            WorkerError::BuildTimeout(Duration::from_secs(1)).kind(),
            ErrorKind::BuildTimeout
        );
        let spawn = WorkerError::ToolSpawn { tool: "gradle".into(), reason: "missing".into() };
        assert_eq!(spawn.kind(), ErrorKind::WorkerInternal);
    }

    #[test]
    fn test_converts_to_service_error() {
        let err: ServiceError = WorkerError::InvalidRequest("empty task".into()).into();
        assert_eq!(err.kind, ErrorKind::BadRequest);
        assert!(err.message.contains("empty task"));
    }
}
