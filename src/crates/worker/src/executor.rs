//! Build execution state machine
//!
//! One build moves through Prepared -> CacheProbed -> Executing ->
//! ArtifactsCollected -> Reported; any step may fail the build, and only
//! the reported result is visible to the coordinator. The per-build scratch
//! directory is created on entry and removed on every exit path.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::process::Command;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};

use protocol::{BuildRequest, BuildResult, WorkerRuntimeStatus};

use crate::artifacts;
use crate::cache_client::CacheHandle;
use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::fingerprint::compute_fingerprint;

/// Captured stdout/stderr budget per stream.
const MAX_LOG_BYTES: usize = 64 * 1024;

/// Steps of the per-build state machine, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    Prepared,
    CacheProbed,
    Executing,
    ArtifactsCollected,
    Reported,
}

/// Runs builds with bounded concurrency.
pub struct BuildExecutor {
    config: Arc<WorkerConfig>,
    cache: CacheHandle,
    tool_version: String,
    permits: Arc<Semaphore>,
    cancellations: Mutex<HashMap<String, Arc<Notify>>>,
    last_ping_at: Mutex<chrono::DateTime<chrono::Utc>>,
}

impl BuildExecutor {
    /// Prepare the executor: scratch root, cache handle, tool version probe.
    pub async fn new(config: Arc<WorkerConfig>) -> Result<Self, WorkerError> {
        tokio::fs::create_dir_all(&config.build_dir).await?;
        let cache = CacheHandle::from_config(&config).await?;
        let tool_version = probe_tool_version(&config.build_tool_path).await;
        info!(
            tool = %config.build_tool_path,
            version = %tool_version,
            max_concurrent = config.max_concurrent_builds,
            "build executor ready"
        );
        Ok(Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent_builds as usize)),
            cancellations: Mutex::new(HashMap::new()),
            last_ping_at: Mutex::new(chrono::Utc::now()),
            cache,
            tool_version,
            config,
        })
    }

    /// Record a liveness probe from the coordinator.
    pub fn record_ping(&self) {
        *self.last_ping_at.lock() = chrono::Utc::now();
    }

    /// When the coordinator last pinged this worker.
    pub fn last_ping_at(&self) -> chrono::DateTime<chrono::Utc> {
        *self.last_ping_at.lock()
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Builds currently in flight.
    pub fn in_flight(&self) -> u32 {
        self.config.max_concurrent_builds - self.permits.available_permits() as u32
    }

    /// Reply for the `GetStatus` operation.
    pub fn status(&self) -> WorkerRuntimeStatus {
        WorkerRuntimeStatus {
            worker_id: self.config.worker_id.clone(),
            in_flight: self.in_flight(),
            queue_length: 0, // surplus calls are rejected, never queued
            is_healthy: true,
            capabilities: self.config.capabilities.clone(),
        }
    }

    /// Best-effort cancellation of an in-flight build.
    pub fn cancel(&self, request_id: &str) -> bool {
        let cancellations = self.cancellations.lock();
        match cancellations.get(request_id) {
            Some(notify) => {
                notify.notify_waiters();
                true
            }
            None => false,
        }
    }

    /// Run one build to completion and return its report.
    ///
    /// Errors are returned only for rejected requests (validation, capacity);
    /// faults during execution are folded into a failed `BuildResult` so the
    /// coordinator can apply its retry policy.
    pub async fn execute(&self, request: BuildRequest) -> Result<BuildResult, WorkerError> {
        self.validate(&request).await?;

        let _permit = self.permits.try_acquire().map_err(|_| {
            WorkerError::CapacityExceeded {
                in_flight: self.in_flight(),
                max_concurrent: self.config.max_concurrent_builds,
            }
        })?;

        let cancel = Arc::new(Notify::new());
        self.cancellations
            .lock()
            .insert(request.request_id.clone(), Arc::clone(&cancel));

        let started = Instant::now();
        let scratch = self.config.build_dir.join(&request.request_id);
        let outcome = tokio::select! {
            outcome = self.run_build(&request, &scratch) => outcome,
            _ = cancel.notified() => {
                info!(request_id = %request.request_id, "build cancelled");
                Ok(self.failed_result(&request, None, "build cancelled", None))
            }
        };

        // Scoped release: the scratch dir never outlives the build
        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(request_id = %request.request_id, error = %e, "scratch dir cleanup failed");
            }
        }
        self.cancellations.lock().remove(&request.request_id);

        let mut result = match outcome {
            Ok(result) => result,
            Err(e) => {
                warn!(request_id = %request.request_id, error = %e, "build failed inside worker");
                self.failed_result(&request, None, &e.to_string(), Some(e))
            }
        };
        result.duration_ms = started.elapsed().as_millis() as u64;
        debug!(
            request_id = %result.request_id,
            success = result.success,
            duration_ms = result.duration_ms,
            "build reported"
        );
        Ok(result)
    }

    async fn validate(&self, request: &BuildRequest) -> Result<(), WorkerError> {
        if request.task_name.is_empty() {
            return Err(WorkerError::InvalidRequest("task_name must not be empty".to_string()));
        }
        if request.project_path.is_empty() {
            return Err(WorkerError::InvalidRequest(
                "project_path must not be empty".to_string(),
            ));
        }
        match tokio::fs::metadata(&request.project_path).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(WorkerError::InvalidRequest(format!(
                "project_path {} is not a directory",
                request.project_path
            ))),
            Err(_) => Err(WorkerError::InvalidRequest(format!(
                "project_path {} does not exist on this worker",
                request.project_path
            ))),
        }
    }

    async fn run_build(
        &self,
        request: &BuildRequest,
        scratch: &std::path::Path,
    ) -> Result<BuildResult, WorkerError> {
        // Prepared: fresh scratch dir for this build only
        if tokio::fs::try_exists(scratch).await? {
            tokio::fs::remove_dir_all(scratch).await?;
        }
        tokio::fs::create_dir_all(scratch).await?;
        self.trace_phase(request, BuildPhase::Prepared);

        // CacheProbed
        let use_cache = request.cache_enabled && self.cache.is_enabled();
        let fingerprint = use_cache.then(|| {
            compute_fingerprint(
                &request.project_path,
                &request.task_name,
                &request.build_options,
                &self.tool_version,
            )
        });
        if let Some(fingerprint) = &fingerprint {
            self.trace_phase(request, BuildPhase::CacheProbed);
            if let Some(bundle) = self.cache.probe(fingerprint).await {
                info!(request_id = %request.request_id, %fingerprint, "cache hit, skipping execution");
                return self.report_cache_hit(request, bundle).await;
            }
        }

        // Executing
        self.trace_phase(request, BuildPhase::Executing);
        let mut command = Command::new(&self.config.build_tool_path);
        command
            .arg(&request.task_name)
            .current_dir(&request.project_path)
            .env("GRADLE_USER_HOME", scratch)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &request.build_options {
            command.arg(format!("-P{key}={value}"));
        }
        // Worker-controlled auth variables pass through under their own names
        for (key, value) in std::env::vars() {
            if let Some(name) = key.strip_prefix("WORKER_ENV_") {
                command.env(name, value);
            }
        }

        let timeout = self.config.build_timeout();
        let output = match tokio::time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(WorkerError::ToolSpawn {
                    tool: self.config.build_tool_path.clone(),
                    reason: e.to_string(),
                })
            }
            // Dropping the future reaps the child via kill_on_drop
            Err(_) => return Err(WorkerError::BuildTimeout(timeout)),
        };

        let stdout = truncate_log(&output.stdout);
        let stderr = truncate_log(&output.stderr);
        let exit_code = output.status.code();

        if !output.status.success() {
            // A failing build is a successful delivery of a failed result
            let message = stderr
                .lines()
                .last()
                .unwrap_or("build tool exited with failure")
                .to_string();
            let mut result = self.failed_result(request, exit_code, &message, None);
            result.stdout = stdout;
            result.stderr = stderr;
            return Ok(result);
        }

        // ArtifactsCollected
        self.trace_phase(request, BuildPhase::ArtifactsCollected);
        let project_dir = PathBuf::from(&request.project_path);
        let (artifact_paths, bundle) = tokio::task::spawn_blocking(move || {
            let artifact_paths = artifacts::collect_artifacts(&project_dir)?;
            let bundle = artifacts::bundle_artifacts(&project_dir)?;
            Ok::<_, WorkerError>((artifact_paths, bundle))
        })
        .await
        .map_err(|e| WorkerError::Internal(format!("artifact collection panicked: {e}")))??;

        if let (Some(fingerprint), Some(bundle)) = (&fingerprint, bundle) {
            let mut metadata = BTreeMap::new();
            metadata.insert("request_id".to_string(), request.request_id.clone());
            metadata.insert("task_name".to_string(), request.task_name.clone());
            metadata.insert("tool_version".to_string(), self.tool_version.clone());
            self.cache.populate(fingerprint, &bundle, metadata).await;
        }

        self.trace_phase(request, BuildPhase::Reported);
        Ok(BuildResult {
            request_id: request.request_id.clone(),
            worker_id: self.config.worker_id.clone(),
            success: true,
            duration_ms: 0, // stamped by execute()
            exit_code,
            stdout,
            stderr,
            artifacts: artifact_paths
                .into_iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            cache_hit_rate: 0.0,
            error_message: None,
            error_kind: None,
        })
    }

    async fn report_cache_hit(
        &self,
        request: &BuildRequest,
        bundle: Vec<u8>,
    ) -> Result<BuildResult, WorkerError> {
        let project_dir = PathBuf::from(&request.project_path);
        let artifact_paths = tokio::task::spawn_blocking(move || {
            artifacts::unpack_bundle(&project_dir, &bundle)?;
            artifacts::collect_artifacts(&project_dir)
        })
        .await
        .map_err(|e| WorkerError::Internal(format!("bundle unpack panicked: {e}")))??;

        self.trace_phase(request, BuildPhase::Reported);
        Ok(BuildResult {
            request_id: request.request_id.clone(),
            worker_id: self.config.worker_id.clone(),
            success: true,
            duration_ms: 0,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            artifacts: artifact_paths
                .into_iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            cache_hit_rate: 1.0,
            error_message: None,
            error_kind: None,
        })
    }

    fn failed_result(
        &self,
        request: &BuildRequest,
        exit_code: Option<i32>,
        message: &str,
        error: Option<WorkerError>,
    ) -> BuildResult {
        BuildResult {
            request_id: request.request_id.clone(),
            worker_id: self.config.worker_id.clone(),
            success: false,
            duration_ms: 0,
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
            artifacts: Vec::new(),
            cache_hit_rate: 0.0,
            error_message: Some(message.to_string()),
            error_kind: error.map(|e| e.kind()),
        }
    }

    fn trace_phase(&self, request: &BuildRequest, phase: BuildPhase) {
        debug!(request_id = %request.request_id, phase = ?phase, "build phase");
    }
}

/// First line of `<tool> --version`, or "unknown".
pub async fn probe_tool_version(tool: &str) -> String {
    let probe = Command::new(tool)
        .arg("--version")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(Duration::from_secs(2), probe).await {
        Ok(Ok(output)) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout)
                .lines()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("unknown")
                .trim()
                .to_string()
        }
        _ => "unknown".to_string(),
    }
}

/// Lossy-decode a captured stream, keeping the tail within budget (the end
/// of a build log is where the failure is).
fn truncate_log(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= MAX_LOG_BYTES {
        return text.into_owned();
    }
    let tail_start = text.len() - MAX_LOG_BYTES;
    let boundary = (tail_start..text.len())
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(tail_start);
    format!("...[truncated]...\n{}", &text[boundary..])
}
