//! HTTP/JSON API for clients

pub mod error;
pub mod handlers;
pub mod routes;

pub use error::{ApiError, ApiResult};
pub use routes::{create_router, AppState};
