//! API route definitions
//!
//! Non-health routes sit behind the bearer-auth middleware when an
//! authenticator is configured; read calls need `builds:read`, mutating
//! calls `builds:write`.

use axum::{
    extract::{Request, State},
    http::{header, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::api::handlers;
use crate::auth::Authenticator;
use crate::state::Coordinator;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub auth: Option<Arc<dyn Authenticator>>,
}

/// Build the coordinator API router.
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/api/builds",
            post(handlers::submit_build).get(handlers::query_builds),
        )
        .route(
            "/api/builds/:id",
            get(handlers::get_build).delete(handlers::cancel_build),
        )
        .route("/api/workers", get(handlers::list_workers))
        .route("/api/stats", get(handlers::stats))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/api/health", get(handlers::health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bearer-token middleware delegating to the configured authenticator.
async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(auth) = &state.auth else {
        return next.run(request).await;
    };

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let Some(context) = token.and_then(|t| auth.validate(t)) else {
        warn!("rejected request with missing or invalid credential");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "UNAUTHORIZED", "message": "missing or invalid credential" })),
        )
            .into_response();
    };

    let permission = if request.method() == Method::GET {
        "builds:read"
    } else {
        "builds:write"
    };
    if !auth.has_permission(&context.subject, permission) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "FORBIDDEN", "message": format!("{permission} required") })),
        )
            .into_response();
    }
    next.run(request).await
}
