//! Coordinator control RPC listener
//!
//! Serves Register and Heartbeat from workers over the framed TCP
//! transport (plus Ping so operators can probe the listener). Build
//! execution flows the other way: the dispatch loop dials workers.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use protocol::{
    read_frame, write_frame, ErrorKind, RpcRequest, RpcResponse, ServiceError, Shutdown, WireError,
};

use crate::state::Coordinator;

/// Accept-loop until shutdown.
pub async fn serve(coordinator: Arc<Coordinator>, listener: TcpListener, shutdown: Shutdown) {
    info!(addr = ?listener.local_addr().ok(), "coordinator RPC listening");
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(handle_connection(Arc::clone(&coordinator), stream, peer));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            _ = shutdown.wait() => {
                info!("coordinator RPC listener stopping");
                return;
            }
        }
    }
}

async fn handle_connection(coordinator: Arc<Coordinator>, mut stream: TcpStream, peer: SocketAddr) {
    loop {
        let request = match read_frame::<_, RpcRequest>(&mut stream).await {
            Ok(request) => request,
            Err(WireError::ConnectionClosed) => return,
            Err(e) => {
                warn!(%peer, error = %e, "dropping connection on malformed frame");
                return;
            }
        };
        let response = dispatch(&coordinator, request);
        if let Err(e) = write_frame(&mut stream, &response).await {
            warn!(%peer, error = %e, "failed to write rpc response");
            return;
        }
    }
}

fn dispatch(coordinator: &Coordinator, request: RpcRequest) -> RpcResponse {
    match request {
        RpcRequest::Register(payload) => {
            let worker_id = payload.worker_id.clone();
            match coordinator.register_worker(payload) {
                Ok(()) => RpcResponse::Registered { worker_id },
                Err(e) => RpcResponse::Error(e),
            }
        }
        RpcRequest::Heartbeat(payload) => {
            debug!(worker_id = %payload.worker_id, in_flight = payload.in_flight, "heartbeat");
            match coordinator.heartbeat(&payload.worker_id, payload.in_flight) {
                Ok(()) => RpcResponse::HeartbeatAck,
                Err(e) => RpcResponse::Error(e),
            }
        }
        RpcRequest::Unregister { worker_id } => {
            match coordinator.unregister_worker(&worker_id) {
                Ok(()) => RpcResponse::Unregistered,
                Err(e) => RpcResponse::Error(e),
            }
        }
        RpcRequest::Ping => RpcResponse::Pong {
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        },
        RpcRequest::ExecuteBuild(_) | RpcRequest::CancelBuild { .. } | RpcRequest::GetStatus => {
            RpcResponse::Error(ServiceError::new(
                ErrorKind::BadRequest,
                "the coordinator does not accept worker-side calls",
            ))
        }
    }
}
