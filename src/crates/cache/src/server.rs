//! HTTP surface for distributed deployments
//!
//! `GET/PUT/DELETE /cache/:key` move raw payload bytes; caller metadata
//! rides in the `x-meta` header as JSON and TTL in `x-ttl-seconds`.
//! Non-health routes require a bearer token when authentication is on.

use axum::{
    body::Bytes,
    extract::{Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::CacheError;
use crate::store::ArtifactCache;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<ArtifactCache>,
    /// Expected bearer token; `None` disables authentication
    pub auth_token: Option<Arc<String>>,
}

/// Build the cache server router.
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/cache/:key",
            get(get_entry).put(put_entry).delete(delete_entry),
        )
        .route("/stats", get(get_stats))
        .route("/cleanup", post(run_cleanup))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bearer-token check for non-health routes.
async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.auth_token.as_deref() else {
        return next.run(request).await;
    };
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    match presented {
        Some(token) if token == expected.as_str() => next.run(request).await,
        _ => {
            warn!("rejected request with missing or invalid bearer token");
            error_response(StatusCode::UNAUTHORIZED, "missing or invalid bearer token")
        }
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.cache.stats().await)
}

async fn run_cleanup(State(state): State<AppState>) -> Response {
    match state.cache.cleanup().await {
        Ok(removed) => Json(json!({ "removed": removed })).into_response(),
        Err(e) => cache_error_response(e),
    }
}

async fn get_entry(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    match state.cache.get(&key).await {
        Ok(Some(hit)) => {
            let meta_json = serde_json::to_string(&hit.metadata).unwrap_or_else(|_| "{}".to_string());
            (
                StatusCode::OK,
                [("x-meta", meta_json), ("x-hash", hit.hash)],
                hit.payload,
            )
                .into_response()
        }
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({ "found": false }))).into_response(),
        Err(e) => cache_error_response(e),
    }
}

async fn put_entry(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let metadata: BTreeMap<String, String> = match headers.get("x-meta") {
        Some(value) => {
            let Ok(text) = value.to_str() else {
                return error_response(StatusCode::BAD_REQUEST, "x-meta header is not valid UTF-8");
            };
            match serde_json::from_str(text) {
                Ok(map) => map,
                Err(e) => {
                    return error_response(
                        StatusCode::BAD_REQUEST,
                        &format!("x-meta header is not a JSON object: {e}"),
                    )
                }
            }
        }
        None => BTreeMap::new(),
    };

    let ttl_seconds = match headers.get("x-ttl-seconds") {
        Some(value) => match value.to_str().ok().and_then(|v| v.parse::<u64>().ok()) {
            Some(ttl) => Some(ttl),
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "x-ttl-seconds header must be a non-negative integer",
                )
            }
        },
        None => None,
    };

    match state.cache.put(&key, &body, metadata, ttl_seconds).await {
        Ok(meta) => (
            StatusCode::OK,
            Json(json!({ "stored": true, "hash": meta.hash, "size": meta.size })),
        )
            .into_response(),
        Err(e) => cache_error_response(e),
    }
}

async fn delete_entry(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    match state.cache.delete(&key).await {
        Ok(()) => Json(json!({ "deleted": true })).into_response(),
        Err(e) => cache_error_response(e),
    }
}

fn cache_error_response(error: CacheError) -> Response {
    let status = match &error {
        CacheError::EntryTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        CacheError::InvalidKey(_) => StatusCode::BAD_REQUEST,
        CacheError::Storage(_) | CacheError::Io(_) | CacheError::Metadata(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        warn!(error = %error, "cache operation failed");
    }
    error_response(status, &error.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::store::CacheLimits;

    async fn test_state(auth_token: Option<&str>) -> AppState {
        let cache = ArtifactCache::open(Arc::new(MemoryStorage::new()), CacheLimits::default())
            .await
            .unwrap();
        AppState {
            cache: Arc::new(cache),
            auth_token: auth_token.map(|t| Arc::new(t.to_string())),
        }
    }

    #[tokio::test]
    async fn test_router_builds_with_and_without_auth() {
        let _open = create_router(test_state(None).await);
        let _locked = create_router(test_state(Some("secret")).await);
    }
}
