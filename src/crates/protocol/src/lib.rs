//! Shared types for the gantry build orchestration service
//!
//! This crate holds everything that crosses a process boundary: the build
//! domain types, the error taxonomy, and the framed TCP wire format used by
//! the coordinator and workers. Components exchange these by value only;
//! no live state is ever shared across a component boundary.

pub mod build;
pub mod error;
pub mod shutdown;
pub mod wire;

pub use build::{
    BuildRecord, BuildRequest, BuildResult, BuildState, ResultSummary, WorkerInfo,
    WorkerRuntimeStatus, WorkerStatus,
};
pub use error::{ErrorKind, ServiceError, ServiceResult};
pub use shutdown::Shutdown;
pub use wire::{
    call, read_frame, write_frame, HeartbeatPayload, RegisterPayload, RpcRequest, RpcResponse,
    WireError, DEFAULT_RPC_DEADLINE, MAX_FRAME_BYTES,
};
