//! Framed RPC wire format
//!
//! Control RPC between the coordinator and workers runs over plain TCP:
//! each message is a u32 big-endian length prefix followed by a JSON
//! payload. Payloads are internally tagged enums, so unknown fields inside
//! a message are ignored on read and new variants can be added without
//! breaking older peers.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::build::{BuildRequest, BuildResult, WorkerRuntimeStatus};
use crate::error::ServiceError;

/// Upper bound on a single frame; larger frames are rejected before decode.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Default deadline for short control calls (register, heartbeat, ping).
pub const DEFAULT_RPC_DEADLINE: Duration = Duration::from_secs(10);

/// Wire-level failures.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES} byte limit")]
    FrameTooLarge(usize),
    #[error("failed to encode message: {0}")]
    Encode(serde_json::Error),
    #[error("failed to decode message: {0}")]
    Decode(serde_json::Error),
    #[error("call to {addr} timed out after {after:?}")]
    Deadline { addr: String, after: Duration },
    #[error("peer closed the connection")]
    ConnectionClosed,
}

/// Registration payload sent by a worker on startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub worker_id: String,
    /// host:port the coordinator should dial for ExecuteBuild calls
    pub address: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub max_concurrent: u32,
}

/// Periodic liveness payload; also carries the worker's load so the
/// coordinator can keep its registry fresh between dispatches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub worker_id: String,
    pub in_flight: u32,
    #[serde(default = "default_healthy")]
    pub is_healthy: bool,
}

fn default_healthy() -> bool {
    true
}

/// Requests carried over the control RPC transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcRequest {
    Register(RegisterPayload),
    Heartbeat(HeartbeatPayload),
    Unregister { worker_id: String },
    ExecuteBuild(BuildRequest),
    CancelBuild { request_id: String },
    Ping,
    GetStatus,
}

/// Replies carried over the control RPC transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcResponse {
    Registered { worker_id: String },
    HeartbeatAck,
    Unregistered,
    BuildResult(BuildResult),
    CancelAck { cancelled: bool },
    Pong { timestamp_ms: i64 },
    Status(WorkerRuntimeStatus),
    Error(ServiceError),
}

/// Write one length-prefixed frame.
pub async fn write_frame<W, T>(io: &mut W, msg: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(msg).map_err(WireError::Encode)?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(WireError::FrameTooLarge(payload.len()));
    }
    io.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    io.write_all(&payload).await?;
    io.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
pub async fn read_frame<R, T>(io: &mut R) -> Result<T, WireError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match io.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    io.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload).map_err(WireError::Decode)
}

/// One request/response exchange against `addr` with a deadline.
///
/// Every outbound RPC in the system goes through here so no call can hang
/// past its deadline; on expiry the caller treats the result as unknown.
pub async fn call(
    addr: &str,
    request: &RpcRequest,
    deadline: Duration,
) -> Result<RpcResponse, WireError> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await?;
        write_frame(&mut stream, request).await?;
        read_frame::<_, RpcResponse>(&mut stream).await
    };
    match tokio::time::timeout(deadline, exchange).await {
        Ok(result) => result,
        Err(_) => Err(WireError::Deadline {
            addr: addr.to_string(),
            after: deadline,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let req = RpcRequest::Register(RegisterPayload {
            worker_id: "w1".to_string(),
            address: "127.0.0.1:7070".to_string(),
            capabilities: vec!["gradle".to_string(), "java".to_string()],
            max_concurrent: 4,
        });

        let mut buf = std::io::Cursor::new(Vec::new());
        write_frame(&mut buf, &req).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf.into_inner());
        let decoded: RpcRequest = read_frame(&mut cursor).await.unwrap();
        match decoded {
            RpcRequest::Register(payload) => {
                assert_eq!(payload.worker_id, "w1");
                assert_eq!(payload.max_concurrent, 4);
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_read() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_FRAME_BYTES as u32) + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let result: Result<RpcResponse, _> = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(WireError::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn test_truncated_stream_is_connection_closed() {
        let mut cursor = std::io::Cursor::new(Vec::new());
        let result: Result<RpcResponse, _> = read_frame(&mut cursor).await;
        assert!(matches!(result, Err(WireError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_execute_build_round_trip() {
        let mut options = BTreeMap::new();
        options.insert("profile".to_string(), "release".to_string());
        let req = RpcRequest::ExecuteBuild(BuildRequest {
            request_id: "r1".to_string(),
            project_path: "/projects/app".to_string(),
            task_name: "assemble".to_string(),
            build_options: options,
            cache_enabled: true,
            requirements: vec![],
            submitted_at: chrono::Utc::now(),
        });

        let mut buf = std::io::Cursor::new(Vec::new());
        write_frame(&mut buf, &req).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf.into_inner());
        let decoded: RpcRequest = read_frame(&mut cursor).await.unwrap();
        match decoded {
            RpcRequest::ExecuteBuild(build) => assert_eq!(build.task_name, "assemble"),
            other => panic!("unexpected request: {:?}", other),
        }
    }
}
