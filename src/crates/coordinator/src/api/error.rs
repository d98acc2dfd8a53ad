//! API error conversion
//!
//! Wraps the shared error taxonomy for Axum so handlers can `?` any
//! `ServiceError` and get the right HTTP status and JSON body.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use protocol::ServiceError;

/// API result type.
pub type ApiResult<T> = Result<T, ApiError>;

/// A `ServiceError` on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub ServiceError);

/// JSON error body.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.kind.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(kind = self.0.kind.code(), message = %self.0.message, "api error");
        }
        let body = ApiErrorBody {
            error: self.0.kind.code(),
            message: self.0.message,
            correlation_id: self.0.correlation_id,
            timestamp: self.0.timestamp,
        };
        (status, Json(body)).into_response()
    }
}
