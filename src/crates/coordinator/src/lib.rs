//! Build coordinator for gantry
//!
//! Accepts build requests over HTTP, maintains the worker registry,
//! dispatches work over the control RPC transport, and tracks every
//! build's lifecycle from admission to a sticky terminal state.

pub mod api;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod reaper;
pub mod rpc;
pub mod state;

pub use auth::{AuthContext, Authenticator, StaticTokenAuthenticator};
pub use config::{ConfigError, CoordinatorConfig};
pub use dispatch::spawn_dispatch_loop;
pub use reaper::spawn_reaper;
pub use state::{Coordinator, CoordinatorStats, DispatchAssignment, DispatchDecision};
