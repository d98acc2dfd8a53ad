//! API endpoint handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;

use protocol::BuildRequest;

use crate::api::error::ApiResult;
use crate::api::routes::AppState;

/// Body of `POST /api/builds`.
#[derive(Debug, Deserialize)]
pub struct SubmitBuildBody {
    pub project_path: String,
    pub task_name: String,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub build_options: BTreeMap<String, String>,
    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,
    #[serde(default)]
    pub requirements: Vec<String>,
}

fn default_cache_enabled() -> bool {
    true
}

/// Query parameters for `GET /api/builds`.
#[derive(Debug, Deserialize)]
pub struct BuildQuery {
    pub id: Option<String>,
}

/// Submit a build.
///
/// POST /api/builds
pub async fn submit_build(
    State(state): State<AppState>,
    Json(body): Json<SubmitBuildBody>,
) -> ApiResult<impl IntoResponse> {
    let request = BuildRequest {
        request_id: body.request_id.unwrap_or_default(),
        project_path: body.project_path,
        task_name: body.task_name,
        build_options: body.build_options,
        cache_enabled: body.cache_enabled,
        requirements: body.requirements,
        submitted_at: Utc::now(),
    };
    let build_id = state.coordinator.submit_build(request)?;
    Ok((StatusCode::CREATED, Json(json!({ "build_id": build_id }))))
}

/// Fetch one record by `?id=` or list all builds.
///
/// GET /api/builds
pub async fn query_builds(
    State(state): State<AppState>,
    Query(query): Query<BuildQuery>,
) -> ApiResult<impl IntoResponse> {
    match query.id {
        Some(id) => {
            let record = state.coordinator.get_build(&id)?;
            Ok(Json(serde_json::to_value(record).unwrap_or_default()))
        }
        None => {
            let builds = state.coordinator.list_builds();
            Ok(Json(serde_json::to_value(builds).unwrap_or_default()))
        }
    }
}

/// Fetch one record by path.
///
/// GET /api/builds/:id
pub async fn get_build(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let record = state.coordinator.get_build(&id)?;
    Ok(Json(record))
}

/// Cancel a queued or running build.
///
/// DELETE /api/builds/:id
pub async fn cancel_build(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.coordinator.cancel_build(&id)?;
    Ok(Json(json!({ "cancelled": true, "build_id": id })))
}

/// Registry snapshot.
///
/// GET /api/workers
pub async fn list_workers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.coordinator.list_workers())
}

/// Queue/registry/record counters.
///
/// GET /api/stats
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.coordinator.stats())
}

/// Liveness probe.
///
/// GET /api/health
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}
