//! Runner registration/heartbeat surface, hosted only by coordinator-mode
//! nodes. Guarded by [`crate::auth::internal_auth`], same as the session
//! routes a runner node exposes to be proxied.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json, Response};
use axum::http::StatusCode;

use ash_core::error::ApiResult;
use ash_core::ids::RunnerId;

use crate::dto::{HeartbeatRequest, RegisterRunnerRequest};
use crate::state::AppState;

pub async fn register_runner(
    State(state): State<AppState>,
    Json(req): Json<RegisterRunnerRequest>,
) -> ApiResult<Response> {
    let runner = state
        .coordinator()?
        .register_runner(&req.host, req.port, req.max_sandboxes)
        .await?;
    Ok((StatusCode::CREATED, Json(runner)).into_response())
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<RunnerId>,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<Response> {
    state
        .coordinator()?
        .heartbeat(id, req.active_count, req.warming_count)
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn deregister_runner(
    State(state): State<AppState>,
    Path(id): Path<RunnerId>,
) -> ApiResult<Response> {
    state.coordinator()?.deregister(id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn list_runners(State(state): State<AppState>) -> ApiResult<Response> {
    let runners = state.coordinator()?.list_runners().await?;
    Ok(Json(runners).into_response())
}
