//! Coordinator state: build records, worker registry, admission queue
//!
//! One lock guards all three tables. Lock sections are compute-only; every
//! RPC happens outside the lock in the dispatch tasks. The queue carries
//! request ids only; `records` is the authority.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use protocol::{
    BuildRecord, BuildRequest, BuildResult, BuildState, ErrorKind, RegisterPayload, ResultSummary,
    ServiceError, WorkerInfo, WorkerStatus,
};

use crate::config::CoordinatorConfig;

struct CoordinatorState {
    workers: HashMap<String, WorkerInfo>,
    records: HashMap<String, BuildRecord>,
    pending: VecDeque<String>,
}

/// A build handed to a worker by the dispatch loop.
#[derive(Debug, Clone)]
pub struct DispatchAssignment {
    pub request: BuildRequest,
    pub worker_id: String,
    pub address: String,
}

/// What the dispatch loop should do next.
#[derive(Debug)]
pub enum DispatchDecision {
    /// Call `ExecuteBuild` on the assigned worker
    Dispatch(DispatchAssignment),
    /// Queue is empty; wait for a submit
    Idle,
    /// Builds are queued but no worker qualifies; back off
    NoCandidate,
}

/// Registry/queue/record snapshot for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub queue_depth: usize,
    pub workers: usize,
    pub builds: u64,
    pub builds_by_state: BTreeMap<String, u64>,
}

/// The coordinator: admission, registry, dispatch bookkeeping.
pub struct Coordinator {
    config: CoordinatorConfig,
    state: Mutex<CoordinatorState>,
    dispatch_wakeup: Notify,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(CoordinatorState {
                workers: HashMap::new(),
                records: HashMap::new(),
                pending: VecDeque::new(),
            }),
            dispatch_wakeup: Notify::new(),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Wake the dispatch loop.
    pub fn notify_dispatch(&self) {
        self.dispatch_wakeup.notify_one();
    }

    /// Suspend until someone calls [`notify_dispatch`].
    pub async fn dispatch_wakeup(&self) {
        self.dispatch_wakeup.notified().await;
    }

    // ---- public operations -------------------------------------------------

    /// Admit a build: mint the id when absent, stamp submission, enqueue.
    pub fn submit_build(&self, mut request: BuildRequest) -> Result<String, ServiceError> {
        request.validate()?;
        if request.request_id.is_empty() {
            request.request_id = uuid::Uuid::new_v4().to_string();
        }
        request.submitted_at = Utc::now();
        let request_id = request.request_id.clone();

        {
            let mut state = self.state.lock();
            if state.records.contains_key(&request_id) {
                return Err(ServiceError::new(
                    ErrorKind::BadRequest,
                    format!("request id {request_id} already exists"),
                ));
            }
            if state.pending.len() >= self.config.queue_capacity {
                return Err(ServiceError::new(
                    ErrorKind::QueueFull,
                    format!("build queue is at capacity ({})", self.config.queue_capacity),
                )
                .with_correlation_id(request_id.clone()));
            }
            state.records.insert(request_id.clone(), BuildRecord::new(request));
            state.pending.push_back(request_id.clone());
        }

        info!(%request_id, "build accepted");
        self.notify_dispatch();
        Ok(request_id)
    }

    pub fn get_build(&self, request_id: &str) -> Result<BuildRecord, ServiceError> {
        self.state
            .lock()
            .records
            .get(request_id)
            .cloned()
            .ok_or_else(|| {
                ServiceError::new(ErrorKind::BuildNotFound, format!("no build {request_id}"))
            })
    }

    pub fn list_builds(&self) -> Vec<BuildRecord> {
        let mut builds: Vec<BuildRecord> = self.state.lock().records.values().cloned().collect();
        builds.sort_by(|a, b| b.request.submitted_at.cmp(&a.request.submitted_at));
        builds
    }

    pub fn list_workers(&self) -> Vec<WorkerInfo> {
        let mut workers: Vec<WorkerInfo> = self.state.lock().workers.values().cloned().collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        workers
    }

    /// Cancel a queued or running build. Best-effort towards the worker: the
    /// record goes `Cancelled` whether or not the worker acknowledges.
    pub fn cancel_build(&self, request_id: &str) -> Result<(), ServiceError> {
        let cancel_target = {
            let mut state = self.state.lock();
            let record = state.records.get_mut(request_id).ok_or_else(|| {
                ServiceError::new(ErrorKind::BuildNotFound, format!("no build {request_id}"))
            })?;
            if record.state.is_terminal() {
                return Err(ServiceError::new(
                    ErrorKind::BadRequest,
                    format!("build {request_id} is already {:?}", record.state),
                ));
            }
            let target = record.assigned_worker.clone();
            apply_transition(record, BuildState::Cancelled);
            let address = target.and_then(|id| state.workers.get(&id).map(|w| w.address.clone()));
            state.pending.retain(|id| id != request_id);
            address
        };

        info!(%request_id, "build cancelled");
        if let Some(address) = cancel_target {
            let request_id = request_id.to_string();
            tokio::spawn(async move {
                let cancel = protocol::RpcRequest::CancelBuild {
                    request_id: request_id.clone(),
                };
                match protocol::call(&address, &cancel, std::time::Duration::from_secs(5)).await {
                    Ok(_) => debug!(%request_id, "worker acknowledged cancel"),
                    Err(e) => debug!(%request_id, error = %e, "cancel delivery failed (best effort)"),
                }
            });
        }
        Ok(())
    }

    /// Admit or update a worker. Re-registering an existing id updates the
    /// entry in place; the registry never holds duplicates.
    pub fn register_worker(&self, payload: RegisterPayload) -> Result<(), ServiceError> {
        if payload.worker_id.is_empty() || payload.address.is_empty() {
            return Err(ServiceError::new(
                ErrorKind::BadRequest,
                "worker_id and address must not be empty",
            ));
        }
        if payload.max_concurrent == 0 {
            return Err(ServiceError::new(
                ErrorKind::BadRequest,
                "max_concurrent must be at least 1",
            ));
        }

        {
            let mut state = self.state.lock();
            if let Some(existing) = state.workers.get_mut(&payload.worker_id) {
                existing.address = payload.address;
                existing.capabilities = payload.capabilities;
                existing.max_concurrent = payload.max_concurrent;
                existing.last_heartbeat_at = Utc::now();
                existing.status = load_status(existing.in_flight);
                info!(worker_id = %payload.worker_id, "worker re-registered");
            } else {
                if state.workers.len() >= self.config.max_workers as usize {
                    return Err(ServiceError::new(
                        ErrorKind::WorkerCapacityExceeded,
                        format!("registry is at capacity ({})", self.config.max_workers),
                    ));
                }
                state.workers.insert(
                    payload.worker_id.clone(),
                    WorkerInfo {
                        worker_id: payload.worker_id.clone(),
                        address: payload.address,
                        capabilities: payload.capabilities,
                        max_concurrent: payload.max_concurrent,
                        status: WorkerStatus::Idle,
                        in_flight: 0,
                        last_heartbeat_at: Utc::now(),
                    },
                );
                info!(worker_id = %payload.worker_id, "worker registered");
            }
        }
        self.notify_dispatch();
        Ok(())
    }

    /// Remove a worker; its in-flight builds re-enter the retry policy.
    pub fn unregister_worker(&self, worker_id: &str) -> Result<(), ServiceError> {
        let requeued = {
            let mut state = self.state.lock();
            if state.workers.remove(worker_id).is_none() {
                return Err(ServiceError::new(
                    ErrorKind::WorkerNotFound,
                    format!("no worker {worker_id}"),
                ));
            }
            let orphaned: Vec<String> = state
                .records
                .values()
                .filter(|r| {
                    r.assigned_worker.as_deref() == Some(worker_id) && !r.state.is_terminal()
                })
                .map(|r| r.request.request_id.clone())
                .collect();
            for request_id in &orphaned {
                self.fail_attempt_locked(
                    &mut state,
                    request_id,
                    &format!("worker {worker_id} unregistered"),
                );
            }
            orphaned.len()
        };
        info!(worker_id, requeued, "worker unregistered");
        self.notify_dispatch();
        Ok(())
    }

    /// Record a heartbeat. Unknown ids error so the worker re-registers.
    pub fn heartbeat(&self, worker_id: &str, _reported_in_flight: u32) -> Result<(), ServiceError> {
        {
            let mut state = self.state.lock();
            let worker = state.workers.get_mut(worker_id).ok_or_else(|| {
                ServiceError::new(ErrorKind::WorkerNotFound, format!("no worker {worker_id}"))
            })?;
            worker.last_heartbeat_at = Utc::now();
            if worker.status != WorkerStatus::Draining {
                worker.status = load_status(worker.in_flight);
            }
        }
        self.notify_dispatch();
        Ok(())
    }

    pub fn stats(&self) -> CoordinatorStats {
        let state = self.state.lock();
        let mut builds_by_state: BTreeMap<String, u64> = BTreeMap::new();
        for record in state.records.values() {
            let key = format!("{:?}", record.state).to_lowercase();
            *builds_by_state.entry(key).or_default() += 1;
        }
        CoordinatorStats {
            queue_depth: state.pending.len(),
            workers: state.workers.len(),
            builds: state.records.len() as u64,
            builds_by_state,
        }
    }

    // ---- dispatch-loop interface -------------------------------------------

    /// Pick the next queued build and a worker for it, updating bookkeeping
    /// under the lock. The RPC itself is the caller's job, outside the lock.
    pub fn next_dispatch(&self) -> DispatchDecision {
        let now = Utc::now();
        let staleness = self.config.heartbeat_staleness();
        let mut state = self.state.lock();

        // Skip ids whose record went terminal while queued (e.g. cancelled)
        let (request_id, requirements) = loop {
            let Some(id) = state.pending.pop_front() else {
                return DispatchDecision::Idle;
            };
            match state.records.get(&id) {
                Some(record) if record.state == BuildState::Queued => {
                    break (id, record.request.requirements.clone());
                }
                _ => debug!(request_id = %id, "dropping stale queue entry"),
            }
        };

        let candidate = select_candidate(state.workers.values(), &requirements, now, staleness)
            .map(|w| w.worker_id.clone());
        let Some(worker_id) = candidate else {
            state.pending.push_front(request_id);
            return DispatchDecision::NoCandidate;
        };

        let Some(worker) = state.workers.get_mut(&worker_id) else {
            state.pending.push_front(request_id);
            return DispatchDecision::NoCandidate;
        };
        worker.in_flight += 1;
        worker.status = load_status(worker.in_flight);
        let address = worker.address.clone();

        let Some(record) = state.records.get_mut(&request_id) else {
            return DispatchDecision::NoCandidate;
        };
        record.attempts += 1;
        record.assigned_worker = Some(worker_id.clone());
        apply_transition(record, BuildState::Dispatched);
        let request = record.request.clone();
        debug!(%request_id, %worker_id, attempts = record.attempts, "build dispatched");

        DispatchDecision::Dispatch(DispatchAssignment {
            request,
            worker_id,
            address,
        })
    }

    /// Mark a dispatched build as running on its worker.
    pub fn mark_running(&self, request_id: &str) {
        let mut state = self.state.lock();
        if let Some(record) = state.records.get_mut(request_id) {
            if record.state == BuildState::Dispatched {
                apply_transition(record, BuildState::Running);
            }
        }
    }

    /// Release the in-flight slot taken by one dispatch attempt. Paired 1:1
    /// with `next_dispatch`; saturates if the reaper already zeroed the slot.
    pub fn release_worker(&self, worker_id: &str) {
        let mut state = self.state.lock();
        if let Some(worker) = state.workers.get_mut(worker_id) {
            worker.in_flight = worker.in_flight.saturating_sub(1);
            if worker.status != WorkerStatus::Draining && worker.status != WorkerStatus::Unreachable
            {
                worker.status = load_status(worker.in_flight);
            }
        }
        self.notify_dispatch();
    }

    /// Fold a worker's report into the record. Terminal records and reports
    /// from a worker that is no longer the assignee are ignored, which is
    /// what makes at-least-once delivery safe.
    pub fn record_result(&self, result: BuildResult) {
        let mut state = self.state.lock();
        let Some(record) = state.records.get_mut(&result.request_id) else {
            warn!(request_id = %result.request_id, "result for unknown build ignored");
            return;
        };
        if record.state.is_terminal() {
            debug!(request_id = %result.request_id, "result for terminal build ignored");
            return;
        }
        if record.assigned_worker.as_deref() != Some(result.worker_id.as_str()) {
            debug!(
                request_id = %result.request_id,
                worker_id = %result.worker_id,
                "result from a stale dispatch attempt ignored"
            );
            return;
        }

        if result.success {
            apply_transition(record, BuildState::Succeeded);
            record.result = Some(summary_from(&result));
            info!(
                request_id = %result.request_id,
                worker_id = %result.worker_id,
                cache_hit_rate = result.cache_hit_rate,
                "build succeeded"
            );
        } else if result.is_worker_fault() {
            let message = result
                .error_message
                .clone()
                .unwrap_or_else(|| "worker internal failure".to_string());
            let request_id = result.request_id.clone();
            self.fail_attempt_locked(&mut state, &request_id, &message);
        } else if result.error_kind == Some(ErrorKind::BuildTimeout) {
            apply_transition(record, BuildState::TimedOut);
            record.result = Some(summary_from(&result));
            info!(request_id = %result.request_id, "build timed out");
        } else {
            // User-space failure: terminal, never retried
            apply_transition(record, BuildState::Failed);
            record.result = Some(summary_from(&result));
            info!(
                request_id = %result.request_id,
                exit_code = ?result.exit_code,
                "build failed"
            );
        }
    }

    /// A dispatch attempt failed on the worker side (RPC error, capacity
    /// rejection, unreachable worker): retry elsewhere or go terminal.
    pub fn fail_build_attempt(&self, request_id: &str, message: &str) {
        let mut state = self.state.lock();
        self.fail_attempt_locked(&mut state, request_id, message);
        drop(state);
        self.notify_dispatch();
    }

    /// Fail a build for good, bypassing the retry policy (e.g. the worker
    /// rejected the request as invalid).
    pub fn fail_build_terminal(&self, request_id: &str, message: &str) {
        let mut state = self.state.lock();
        let Some(record) = state.records.get_mut(request_id) else {
            return;
        };
        if record.state.is_terminal() {
            return;
        }
        warn!(%request_id, message, "build failed terminally");
        apply_transition(record, BuildState::Failed);
        record.result = Some(ResultSummary {
            exit_code: None,
            artifacts: Vec::new(),
            error_message: Some(message.to_string()),
            duration_ms: 0,
            cache_hit_rate: 0.0,
        });
    }

    fn fail_attempt_locked(
        &self,
        state: &mut CoordinatorState,
        request_id: &str,
        message: &str,
    ) {
        let max_attempts = self.config.max_attempts;
        let Some(record) = state.records.get_mut(request_id) else {
            return;
        };
        if record.state.is_terminal() {
            return;
        }
        if record.attempts < max_attempts {
            info!(
                %request_id,
                attempts = record.attempts,
                max_attempts,
                message,
                "retrying build on another worker"
            );
            apply_transition(record, BuildState::Queued);
            // Retries jump the queue so an unlucky build is not starved
            state.pending.push_front(request_id.to_string());
        } else {
            warn!(%request_id, attempts = record.attempts, message, "retries exhausted");
            apply_transition(record, BuildState::Failed);
            record.result = Some(ResultSummary {
                exit_code: None,
                artifacts: Vec::new(),
                error_message: Some(format!("{message} (after {} attempts)", record.attempts)),
                duration_ms: 0,
                cache_hit_rate: 0.0,
            });
        }
    }

    // ---- reaper interface --------------------------------------------------

    /// One failure-detection and retention sweep. Returns how many builds
    /// were failed over to the retry policy.
    pub fn reap(&self) -> usize {
        let now = Utc::now();
        let staleness = self.config.heartbeat_staleness();
        let removal_age = self.config.worker_removal_age();
        let retention = chrono::Duration::seconds(self.config.build_retention_seconds as i64);

        let mut failed_over = 0;
        {
            let mut state = self.state.lock();

            // Workers missing three heartbeats go unreachable
            let mut newly_unreachable = Vec::new();
            for worker in state.workers.values_mut() {
                let stale = now - worker.last_heartbeat_at > staleness;
                if stale && worker.status != WorkerStatus::Unreachable {
                    warn!(worker_id = %worker.worker_id, "worker missed heartbeats, marking unreachable");
                    worker.status = WorkerStatus::Unreachable;
                    worker.in_flight = 0;
                    newly_unreachable.push(worker.worker_id.clone());
                }
            }

            // Their in-flight builds re-enter the retry policy
            if !newly_unreachable.is_empty() {
                let orphaned: Vec<String> = state
                    .records
                    .values()
                    .filter(|r| {
                        !r.state.is_terminal()
                            && r.assigned_worker
                                .as_deref()
                                .map(|w| newly_unreachable.iter().any(|u| u == w))
                                .unwrap_or(false)
                    })
                    .map(|r| r.request.request_id.clone())
                    .collect();
                for request_id in &orphaned {
                    self.fail_attempt_locked(&mut state, request_id, "assigned worker unreachable");
                }
                failed_over = orphaned.len();
            }

            // Long-unreachable workers leave the registry entirely
            state.workers.retain(|worker_id, worker| {
                let keep = now - worker.last_heartbeat_at <= removal_age;
                if !keep {
                    info!(%worker_id, "removing worker after unreachable grace period");
                }
                keep
            });

            // Terminal records age out after the retention window
            state.records.retain(|request_id, record| {
                let expired = record.state.is_terminal()
                    && record
                        .finished_at
                        .map(|finished| now - finished > retention)
                        .unwrap_or(false);
                if expired {
                    debug!(%request_id, "evicting retained build record");
                }
                !expired
            });
        }

        if failed_over > 0 {
            self.notify_dispatch();
        }
        failed_over
    }
}

/// Registry status implied by a worker's load.
fn load_status(in_flight: u32) -> WorkerStatus {
    if in_flight == 0 {
        WorkerStatus::Idle
    } else {
        WorkerStatus::Busy
    }
}

/// Apply a transition if the DAG allows it; terminal states never change.
fn apply_transition(record: &mut BuildRecord, next: BuildState) -> bool {
    if !record.state.can_transition_to(next) {
        warn!(
            request_id = %record.request.request_id,
            from = ?record.state,
            to = ?next,
            "refusing invalid state transition"
        );
        return false;
    }
    record.state = next;
    match next {
        BuildState::Running => record.started_at = Some(Utc::now()),
        BuildState::Queued => {
            record.assigned_worker = None;
            record.started_at = None;
        }
        _ if next.is_terminal() => record.finished_at = Some(Utc::now()),
        _ => {}
    }
    true
}

fn summary_from(result: &BuildResult) -> ResultSummary {
    ResultSummary {
        exit_code: result.exit_code,
        artifacts: result.artifacts.clone(),
        error_message: result.error_message.clone(),
        duration_ms: result.duration_ms,
        cache_hit_rate: result.cache_hit_rate,
    }
}

/// Dispatch candidate selection: fresh heartbeat, spare capacity, and a
/// capability superset of the request's requirements. Lowest in-flight wins;
/// ties go to the earliest heartbeat, then lexicographic id.
pub fn select_candidate<'a>(
    workers: impl Iterator<Item = &'a WorkerInfo>,
    requirements: &[String],
    now: DateTime<Utc>,
    staleness: chrono::Duration,
) -> Option<&'a WorkerInfo> {
    workers
        .filter(|w| matches!(w.status, WorkerStatus::Idle | WorkerStatus::Busy))
        .filter(|w| w.in_flight < w.max_concurrent)
        .filter(|w| now - w.last_heartbeat_at <= staleness)
        .filter(|w| {
            requirements
                .iter()
                .all(|req| w.capabilities.iter().any(|cap| cap == req))
        })
        .min_by(|a, b| {
            a.in_flight
                .cmp(&b.in_flight)
                .then(a.last_heartbeat_at.cmp(&b.last_heartbeat_at))
                .then(a.worker_id.cmp(&b.worker_id))
        })
}
