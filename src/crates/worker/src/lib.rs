//! Build worker for gantry
//!
//! Executes builds under the coordinator's direction: sandboxed per-build
//! scratch directories, bounded concurrency, cache probe/populate, artifact
//! collection, and result reporting over the control RPC transport.

pub mod artifacts;
pub mod cache_client;
pub mod config;
pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod heartbeat;
pub mod rpc;

pub use cache_client::CacheHandle;
pub use config::{ConfigError, WorkerConfig};
pub use error::WorkerError;
pub use executor::{probe_tool_version, BuildExecutor, BuildPhase};
pub use fingerprint::compute_fingerprint;
