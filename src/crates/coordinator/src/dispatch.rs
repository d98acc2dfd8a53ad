//! Background dispatch loop
//!
//! Pulls queued builds, picks workers, and drives the `ExecuteBuild` RPC.
//! Selection happens under the coordinator lock; the RPC runs in its own
//! task so the control plane never blocks on a worker. When no worker
//! qualifies the loop re-queues at the head and backs off (bounded, 5s cap).

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use protocol::{call, RpcRequest, RpcResponse, Shutdown};

use crate::state::{Coordinator, DispatchAssignment, DispatchDecision};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Run the dispatch loop until shutdown.
pub fn spawn_dispatch_loop(
    coordinator: Arc<Coordinator>,
    shutdown: Shutdown,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if shutdown.is_triggered() {
                debug!("dispatch loop stopping");
                return;
            }
            match coordinator.next_dispatch() {
                DispatchDecision::Dispatch(assignment) => {
                    backoff = INITIAL_BACKOFF;
                    tokio::spawn(perform_dispatch(Arc::clone(&coordinator), assignment));
                }
                DispatchDecision::Idle => {
                    tokio::select! {
                        _ = coordinator.dispatch_wakeup() => {}
                        _ = shutdown.wait() => return,
                    }
                }
                DispatchDecision::NoCandidate => {
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.wait() => return,
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    })
}

/// One dispatch attempt: RPC to the worker, then fold the outcome back into
/// the record and release the in-flight slot.
async fn perform_dispatch(coordinator: Arc<Coordinator>, assignment: DispatchAssignment) {
    let DispatchAssignment {
        request,
        worker_id,
        address,
    } = assignment;
    let request_id = request.request_id.clone();
    let deadline = coordinator.config().dispatch_deadline();

    coordinator.mark_running(&request_id);
    let outcome = call(&address, &RpcRequest::ExecuteBuild(request), deadline).await;

    match outcome {
        Ok(RpcResponse::BuildResult(result)) => coordinator.record_result(result),
        Ok(RpcResponse::Error(e)) if e.kind.is_retryable_build_failure() => {
            debug!(%request_id, %worker_id, error = %e, "worker rejected dispatch, retrying");
            coordinator.fail_build_attempt(&request_id, &e.message);
        }
        Ok(RpcResponse::Error(e)) => {
            // The worker refused the request itself; retrying elsewhere
            // cannot help
            coordinator.fail_build_terminal(&request_id, &e.message);
        }
        Ok(other) => {
            warn!(%request_id, %worker_id, response = ?other, "unexpected dispatch reply");
            coordinator.fail_build_attempt(&request_id, "unexpected reply from worker");
        }
        Err(e) => {
            warn!(%request_id, %worker_id, error = %e, "dispatch rpc failed");
            coordinator.fail_build_attempt(&request_id, &format!("worker rpc failed: {e}"));
        }
    }
    coordinator.release_worker(&worker_id);
}
