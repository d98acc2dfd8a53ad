//! Build domain types
//!
//! The coordinator owns `BuildRecord` and the worker registry; workers own
//! their in-flight build contexts. These are the value types that move
//! between them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{ErrorKind, ServiceError};

/// A client's request to run one task on one project.
///
/// `request_id` is the primary key everywhere once the coordinator accepts
/// the request; the coordinator mints one when the client leaves it empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Unique request id (minted by the coordinator when absent)
    #[serde(default)]
    pub request_id: String,
    /// Project path, interpreted by the worker that runs the build
    pub project_path: String,
    /// Task name recognized by the external build tool
    pub task_name: String,
    /// Build options, keys unique; sorted map so fingerprints are stable
    #[serde(default)]
    pub build_options: BTreeMap<String, String>,
    /// Whether the artifact cache may be probed and populated
    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,
    /// Capabilities a worker must have to run this build (e.g. "gradle")
    #[serde(default)]
    pub requirements: Vec<String>,
    /// Stamped by the coordinator on accept
    #[serde(default = "Utc::now")]
    pub submitted_at: DateTime<Utc>,
}

fn default_cache_enabled() -> bool {
    true
}

impl BuildRequest {
    /// Validate client-supplied fields before admission.
    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.project_path.is_empty() {
            return Err(ServiceError::new(
                ErrorKind::BadRequest,
                "project_path must not be empty",
            ));
        }
        if self.task_name.is_empty() {
            return Err(ServiceError::new(
                ErrorKind::BadRequest,
                "task_name must not be empty",
            ));
        }
        Ok(())
    }
}

/// Lifecycle state of a build record.
///
/// Transitions form a DAG: `Queued -> Dispatched -> Running -> terminal`,
/// with `Dispatched`/`Running` allowed back to `Queued` when the assigned
/// worker fails and the build is retried. Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Queued,
    Dispatched,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl BuildState {
    /// Whether this state is terminal (no further transitions allowed).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildState::Succeeded | BuildState::Failed | BuildState::TimedOut | BuildState::Cancelled
        )
    }

    /// Whether the declared transition DAG permits `self -> next`.
    pub fn can_transition_to(&self, next: BuildState) -> bool {
        use BuildState::*;
        match self {
            Queued => matches!(next, Dispatched | Cancelled),
            Dispatched => matches!(next, Running | Queued | Failed | TimedOut | Cancelled),
            Running => matches!(next, Succeeded | Failed | TimedOut | Cancelled | Queued),
            _ => false,
        }
    }
}

/// Outcome summary recorded on a terminal build record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSummary {
    /// Exit status of the build tool, when it ran
    pub exit_code: Option<i32>,
    /// Absolute paths of collected artifacts on the worker
    pub artifacts: Vec<String>,
    /// Error message on failure
    pub error_message: Option<String>,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
    /// Fraction of the build served from cache (0.0 or 1.0 today)
    pub cache_hit_rate: f64,
}

/// The coordinator's authoritative state for one build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
    pub request: BuildRequest,
    pub state: BuildState,
    pub assigned_worker: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Dispatch attempts so far, >= 1 once dispatched
    pub attempts: u32,
    pub result: Option<ResultSummary>,
}

impl BuildRecord {
    /// Create a fresh record for an accepted request.
    pub fn new(request: BuildRequest) -> Self {
        Self {
            request,
            state: BuildState::Queued,
            assigned_worker: None,
            started_at: None,
            finished_at: None,
            attempts: 0,
            result: None,
        }
    }
}

/// A worker's report for one completed (or failed) build.
///
/// A non-zero exit from the build tool is a successful delivery of a failed
/// build (`success=false`, no `error_kind`); a worker-side fault carries
/// `error_kind=WorkerInternal` and is retryable by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub request_id: String,
    pub worker_id: String,
    pub success: bool,
    pub duration_ms: u64,
    pub exit_code: Option<i32>,
    /// Captured stdout, truncated to the worker's log budget
    #[serde(default)]
    pub stdout: String,
    /// Captured stderr, truncated to the worker's log budget
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub cache_hit_rate: f64,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Set when the failure is the worker's fault rather than the build's
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
}

impl BuildResult {
    /// Whether the coordinator should retry this build on another worker.
    pub fn is_worker_fault(&self) -> bool {
        matches!(
            self.error_kind,
            Some(ErrorKind::WorkerInternal) | Some(ErrorKind::WorkerTimeout)
        )
    }
}

/// Registry status of a worker as tracked by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Unreachable,
    Draining,
}

/// Snapshot of one worker registry entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub worker_id: String,
    /// host:port of the worker's RPC listener, reachable by the coordinator
    pub address: String,
    pub capabilities: Vec<String>,
    pub max_concurrent: u32,
    pub status: WorkerStatus,
    pub in_flight: u32,
    pub last_heartbeat_at: DateTime<Utc>,
}

/// Reply shape of the worker's `GetStatus` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRuntimeStatus {
    pub worker_id: String,
    pub in_flight: u32,
    pub queue_length: u32,
    pub is_healthy: bool,
    pub capabilities: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_empty_task() {
        let req = BuildRequest {
            request_id: "r1".to_string(),
            project_path: "/proj".to_string(),
            task_name: String::new(),
            build_options: BTreeMap::new(),
            cache_enabled: true,
            requirements: vec![],
            submitted_at: Utc::now(),
        };
        let err = req.validate().unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadRequest);
    }

    #[test]
    fn test_validate_rejects_empty_project_path() {
        let req = BuildRequest {
            request_id: "r1".to_string(),
            project_path: String::new(),
            task_name: "assemble".to_string(),
            build_options: BTreeMap::new(),
            cache_enabled: true,
            requirements: vec![],
            submitted_at: Utc::now(),
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        for terminal in [
            BuildState::Succeeded,
            BuildState::Failed,
            BuildState::TimedOut,
            BuildState::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            for next in [
                BuildState::Queued,
                BuildState::Dispatched,
                BuildState::Running,
                BuildState::Succeeded,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_transition_dag_paths() {
        assert!(BuildState::Queued.can_transition_to(BuildState::Dispatched));
        assert!(BuildState::Dispatched.can_transition_to(BuildState::Running));
        assert!(BuildState::Running.can_transition_to(BuildState::Succeeded));
        // Retry path: a dispatched or running build may re-enter the queue
        assert!(BuildState::Dispatched.can_transition_to(BuildState::Queued));
        assert!(BuildState::Running.can_transition_to(BuildState::Queued));
        // But never skip dispatch
        assert!(!BuildState::Queued.can_transition_to(BuildState::Running));
        assert!(!BuildState::Queued.can_transition_to(BuildState::Succeeded));
    }

    #[test]
    fn test_unknown_fields_ignored_on_read() {
        let json = r#"{
            "request_id": "r9",
            "project_path": "/p",
            "task_name": "build",
            "some_future_field": {"nested": true}
        }"#;
        let req: BuildRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.request_id, "r9");
        assert!(req.cache_enabled);
        assert!(req.build_options.is_empty());
    }

    #[test]
    fn test_worker_fault_detection() {
        let mut result = BuildResult {
            request_id: "r1".to_string(),
            worker_id: "w1".to_string(),
            success: false,
            duration_ms: 10,
            exit_code: Some(1),
            stdout: String::new(),
            stderr: String::new(),
            artifacts: vec![],
            cache_hit_rate: 0.0,
            error_message: Some("compile error".to_string()),
            error_kind: None,
        };
        // User-space failure: not the worker's fault
        assert!(!result.is_worker_fault());

        result.error_kind = Some(ErrorKind::WorkerInternal);
        assert!(result.is_worker_fault());
    }
}
