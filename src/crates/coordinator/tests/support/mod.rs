//! In-process fake worker for coordinator tests

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use protocol::{
    read_frame, write_frame, BuildResult, RpcRequest, RpcResponse, WireError,
};

/// How the fake worker answers `ExecuteBuild`.
#[derive(Clone)]
pub enum Behavior {
    /// Respond with a successful result after `delay`
    Succeed { delay: Duration },
    /// Respond with a failed build (user-space failure)
    FailUser { exit_code: i32, message: String },
    /// Accept the call and never answer
    Hang,
}

/// A worker-shaped RPC endpoint with scripted behavior.
pub struct FakeWorker {
    pub worker_id: String,
    pub addr: String,
    /// Completed + in-progress ExecuteBuild calls
    pub executions: Arc<AtomicU32>,
    /// Highest number of concurrent ExecuteBuild calls observed
    pub max_concurrent_seen: Arc<AtomicU32>,
}

pub async fn spawn_fake_worker(worker_id: &str, behavior: Behavior) -> FakeWorker {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let executions = Arc::new(AtomicU32::new(0));
    let max_concurrent_seen = Arc::new(AtomicU32::new(0));
    let current = Arc::new(AtomicU32::new(0));

    let worker = FakeWorker {
        worker_id: worker_id.to_string(),
        addr,
        executions: Arc::clone(&executions),
        max_concurrent_seen: Arc::clone(&max_concurrent_seen),
    };

    let worker_id = worker_id.to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let behavior = behavior.clone();
            let worker_id = worker_id.clone();
            let executions = Arc::clone(&executions);
            let max_concurrent_seen = Arc::clone(&max_concurrent_seen);
            let current = Arc::clone(&current);
            tokio::spawn(async move {
                loop {
                    let request = match read_frame::<_, RpcRequest>(&mut stream).await {
                        Ok(request) => request,
                        Err(WireError::ConnectionClosed) => return,
                        Err(_) => return,
                    };
                    let response = match request {
                        RpcRequest::ExecuteBuild(build) => {
                            executions.fetch_add(1, Ordering::SeqCst);
                            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                            max_concurrent_seen.fetch_max(now, Ordering::SeqCst);
                            let response = match &behavior {
                                Behavior::Succeed { delay } => {
                                    tokio::time::sleep(*delay).await;
                                    RpcResponse::BuildResult(BuildResult {
                                        request_id: build.request_id.clone(),
                                        worker_id: worker_id.clone(),
                                        success: true,
                                        duration_ms: 5,
                                        exit_code: Some(0),
                                        stdout: String::new(),
                                        stderr: String::new(),
                                        artifacts: vec!["/out/app.jar".to_string()],
                                        cache_hit_rate: 0.0,
                                        error_message: None,
                                        error_kind: None,
                                    })
                                }
                                Behavior::FailUser { exit_code, message } => {
                                    RpcResponse::BuildResult(BuildResult {
                                        request_id: build.request_id.clone(),
                                        worker_id: worker_id.clone(),
                                        success: false,
                                        duration_ms: 5,
                                        exit_code: Some(*exit_code),
                                        stdout: String::new(),
                                        stderr: message.clone(),
                                        artifacts: vec![],
                                        cache_hit_rate: 0.0,
                                        error_message: Some(message.clone()),
                                        error_kind: None,
                                    })
                                }
                                Behavior::Hang => {
                                    std::future::pending::<()>().await;
                                    unreachable!()
                                }
                            };
                            current.fetch_sub(1, Ordering::SeqCst);
                            response
                        }
                        RpcRequest::CancelBuild { .. } => RpcResponse::CancelAck { cancelled: true },
                        RpcRequest::Ping => RpcResponse::Pong { timestamp_ms: 0 },
                        _ => return,
                    };
                    if write_frame(&mut stream, &response).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    worker
}
