//! Agent directory CRUD. Agents live in the shared repository regardless of
//! node mode — a coordinator never needs to ask a runner about them, since
//! deploying an agent is a metadata write, not a sandbox operation.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};

use ash_core::error::ApiResult;

use crate::dto::CreateAgentRequest;
use crate::routes::tenant_from_headers;
use crate::state::AppState;

pub async fn create_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateAgentRequest>,
) -> ApiResult<Response> {
    let tenant = tenant_from_headers(&headers);
    let agent = state.repo.upsert_agent(&tenant, &req.name, &req.path).await?;
    Ok((StatusCode::CREATED, Json(agent)).into_response())
}

pub async fn list_agents(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Response> {
    let tenant = tenant_from_headers(&headers);
    let agents = state.repo.list_agents(&tenant).await?;
    Ok(Json(agents).into_response())
}

pub async fn get_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let tenant = tenant_from_headers(&headers);
    let agent = state
        .repo
        .get_agent(&tenant, &name)
        .await?
        .ok_or_else(|| ash_core::error::ApiError::NotFound(format!("agent {name}")))?;
    Ok(Json(agent).into_response())
}

pub async fn delete_agent(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let tenant = tenant_from_headers(&headers);
    state.repo.delete_agent(&tenant, &name).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
