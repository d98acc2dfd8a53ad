//! Registration and heartbeating against the coordinator
//!
//! On start the worker registers, retrying with backoff until the
//! coordinator admits it. Afterwards it heartbeats at a fixed period; a
//! coordinator that no longer knows the worker (restart, grace-period
//! removal) answers with `WorkerNotFound`, which triggers re-registration.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use protocol::{
    call, ErrorKind, HeartbeatPayload, RegisterPayload, RpcRequest, RpcResponse, Shutdown,
    DEFAULT_RPC_DEADLINE,
};

use crate::config::WorkerConfig;
use crate::executor::BuildExecutor;

/// Run register-then-heartbeat until shutdown.
pub fn spawn_heartbeat_loop(
    config: Arc<WorkerConfig>,
    executor: Arc<BuildExecutor>,
    shutdown: Shutdown,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !register_until_admitted(&config, &shutdown).await {
            return;
        }
        let period = Duration::from_secs(config.heartbeat_period_seconds);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = shutdown.wait() => {
                    debug!("heartbeat loop stopping");
                    unregister_best_effort(&config).await;
                    return;
                }
            }
            let payload = HeartbeatPayload {
                worker_id: config.worker_id.clone(),
                in_flight: executor.in_flight(),
                is_healthy: true,
            };
            match call(
                &config.coordinator_address,
                &RpcRequest::Heartbeat(payload),
                DEFAULT_RPC_DEADLINE,
            )
            .await
            {
                Ok(RpcResponse::HeartbeatAck) => {}
                Ok(RpcResponse::Error(e)) if e.kind == ErrorKind::WorkerNotFound => {
                    // Coordinator lost us (restart or reaping); re-register
                    warn!("coordinator does not know this worker, re-registering");
                    if !register_until_admitted(&config, &shutdown).await {
                        return;
                    }
                }
                Ok(other) => warn!(response = ?other, "unexpected heartbeat reply"),
                Err(e) => {
                    // Missed heartbeats are the coordinator's signal; just log
                    warn!(error = %e, "heartbeat delivery failed");
                }
            }
        }
    })
}

/// Tell the coordinator we are leaving so queued work is not routed here
/// while the process drains.
async fn unregister_best_effort(config: &WorkerConfig) {
    let request = RpcRequest::Unregister {
        worker_id: config.worker_id.clone(),
    };
    match call(&config.coordinator_address, &request, Duration::from_secs(2)).await {
        Ok(RpcResponse::Unregistered) => info!("unregistered from coordinator"),
        Ok(_) | Err(_) => debug!("unregister on shutdown not acknowledged"),
    }
}

/// Register with backoff until admitted or shut down. Returns false when
/// shutdown interrupted the attempts.
async fn register_until_admitted(config: &WorkerConfig, shutdown: &Shutdown) -> bool {
    let payload = RegisterPayload {
        worker_id: config.worker_id.clone(),
        address: config.advertised_address(),
        capabilities: config.capabilities.clone(),
        max_concurrent: config.max_concurrent_builds,
    };
    let mut backoff = Duration::from_secs(1);
    loop {
        match call(
            &config.coordinator_address,
            &RpcRequest::Register(payload.clone()),
            DEFAULT_RPC_DEADLINE,
        )
        .await
        {
            Ok(RpcResponse::Registered { worker_id }) => {
                info!(%worker_id, coordinator = %config.coordinator_address, "registered with coordinator");
                return true;
            }
            Ok(RpcResponse::Error(e)) => {
                warn!(error = %e, "coordinator rejected registration, will retry");
            }
            Ok(other) => warn!(response = ?other, "unexpected registration reply"),
            Err(e) => {
                warn!(error = %e, "coordinator unreachable, will retry registration");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.wait() => return false,
        }
        backoff = (backoff * 2).min(Duration::from_secs(30));
    }
}
