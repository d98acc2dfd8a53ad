//! Worker RPC server
//!
//! Serves ExecuteBuild/CancelBuild/Ping/GetStatus over the framed TCP
//! transport. One task per connection; a connection may carry any number of
//! request/response exchanges.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use protocol::{
    read_frame, write_frame, ErrorKind, RpcRequest, RpcResponse, ServiceError, Shutdown, WireError,
};

use crate::executor::BuildExecutor;

/// Accept-loop until shutdown.
pub async fn serve(executor: Arc<BuildExecutor>, listener: TcpListener, shutdown: Shutdown) {
    info!(addr = ?listener.local_addr().ok(), "worker RPC listening");
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(Arc::clone(&executor), stream, peer));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            _ = shutdown.wait() => {
                info!("worker RPC listener stopping");
                return;
            }
        }
    }
}

async fn handle_connection(executor: Arc<BuildExecutor>, mut stream: TcpStream, peer: SocketAddr) {
    loop {
        let request = match read_frame::<_, RpcRequest>(&mut stream).await {
            Ok(request) => request,
            Err(WireError::ConnectionClosed) => return,
            Err(e) => {
                warn!(%peer, error = %e, "dropping connection on malformed frame");
                return;
            }
        };
        debug!(%peer, request = ?request_name(&request), "rpc request");
        let response = dispatch(&executor, request).await;
        if let Err(e) = write_frame(&mut stream, &response).await {
            warn!(%peer, error = %e, "failed to write rpc response");
            return;
        }
    }
}

async fn dispatch(executor: &BuildExecutor, request: RpcRequest) -> RpcResponse {
    match request {
        RpcRequest::Ping => {
            executor.record_ping();
            RpcResponse::Pong {
                timestamp_ms: chrono::Utc::now().timestamp_millis(),
            }
        }
        RpcRequest::GetStatus => RpcResponse::Status(executor.status()),
        RpcRequest::ExecuteBuild(build) => match executor.execute(build).await {
            Ok(result) => RpcResponse::BuildResult(result),
            Err(e) => RpcResponse::Error(e.into()),
        },
        RpcRequest::CancelBuild { request_id } => RpcResponse::CancelAck {
            cancelled: executor.cancel(&request_id),
        },
        RpcRequest::Register(_) | RpcRequest::Heartbeat(_) | RpcRequest::Unregister { .. } => {
            RpcResponse::Error(ServiceError::new(
                ErrorKind::BadRequest,
                "workers do not accept registry calls",
            ))
        }
    }
}

fn request_name(request: &RpcRequest) -> &'static str {
    match request {
        RpcRequest::Register(_) => "register",
        RpcRequest::Heartbeat(_) => "heartbeat",
        RpcRequest::Unregister { .. } => "unregister",
        RpcRequest::ExecuteBuild(_) => "execute_build",
        RpcRequest::CancelBuild { .. } => "cancel_build",
        RpcRequest::Ping => "ping",
        RpcRequest::GetStatus => "get_status",
    }
}
