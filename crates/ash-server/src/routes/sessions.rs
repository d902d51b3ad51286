//! Session lifecycle, messaging, and workspace introspection. Metadata-only
//! operations (list, get, fork, config, message/event history) always go
//! straight to the shared repository. Operations that touch a live sandbox
//! (create, send-message, pause, resume, end, files, exec) are served locally
//! on solo/runner nodes and proxied to the owning runner on a coordinator.

use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use futures::StreamExt;
use reqwest::Method;
use serde_json::json;
use tracing::warn;

use ash_core::error::{ApiError, ApiResult};
use ash_core::ids::SessionId;
use ash_core::model::{Runner, Session};
use ash_orchestrator::OrchestratorEvent;

use crate::dto::{CreateSessionRequest, ExecRequest, ListQuery, SendMessageRequest, UpdateConfigRequest};
use crate::routes::tenant_from_headers;
use crate::state::AppState;

async fn require_session(state: &AppState, id: SessionId) -> ApiResult<Session> {
    state
        .repo
        .get_session(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("session {id}")))
}

/// Runner currently responsible for `session_id`'s sandbox, re-validated for
/// health. Picks a fresh runner when the recorded one is dead or unset —
/// correct for resume (cold-resumes from the shared snapshot store on the
/// new host) and an error for everything else, caught by the caller.
async fn resolve_runner(state: &AppState, session: &Session, allow_reassign: bool) -> ApiResult<Runner> {
    let coordinator = state.coordinator()?;
    if let Some(runner_id) = session.runner_id {
        if let Some(runner) = coordinator.healthy_runner(runner_id).await? {
            return Ok(runner);
        }
    }
    if !allow_reassign {
        return Err(ApiError::Conflict(format!(
            "session {} has no healthy runner",
            session.id
        )));
    }
    let runner = coordinator.select_best_runner().await?;
    state.repo.update_session_runner(&session.id, Some(runner.id)).await?;
    Ok(runner)
}

async fn proxy_json(
    state: &AppState,
    runner: &Runner,
    method: Method,
    path: &str,
    body: Option<serde_json::Value>,
) -> ApiResult<Response> {
    let secret = state.internal_secret()?;
    let value = ash_coordinator::proxy::forward_json(&state.http_client, secret, runner, method, path, body)
        .await?;
    Ok(Json(value).into_response())
}

pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<Response> {
    let tenant = tenant_from_headers(&headers);
    let agent_name = req.agent.clone();

    if let Some(orchestrator) = &state.orchestrator {
        let (model, config) = req.into_config();
        let session = orchestrator.create_session(&tenant, &agent_name, model, config).await?;
        return Ok((StatusCode::CREATED, Json(session)).into_response());
    }

    let coordinator = state.coordinator()?;
    let runner = coordinator.select_best_runner().await?;
    let (model, config) = req.into_config();
    let body = json!({ "agent": agent_name, "model": model, "config": config });
    let secret = state.internal_secret()?;
    let value = ash_coordinator::proxy::forward_json(
        &state.http_client,
        secret,
        &runner,
        Method::POST,
        "/api/sessions",
        Some(body),
    )
    .await?;
    let session_id: SessionId = value
        .get("id")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("runner returned a session with no id")))?;
    state.repo.update_session_runner(&session_id, Some(runner.id)).await?;
    Ok((StatusCode::CREATED, Json(value)).into_response())
}

pub async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResult<Response> {
    let tenant = tenant_from_headers(&headers);
    let sessions = state.repo.list_sessions(&tenant, query.agent.as_deref()).await?;
    Ok(Json(sessions).into_response())
}

pub async fn get_session(State(state): State<AppState>, Path(id): Path<SessionId>) -> ApiResult<Response> {
    Ok(Json(require_session(&state, id).await?).into_response())
}

pub async fn fork_session(State(state): State<AppState>, Path(id): Path<SessionId>) -> ApiResult<Response> {
    require_session(&state, id).await?;
    let forked = if let Some(orchestrator) = &state.orchestrator {
        orchestrator.fork_session(id).await?
    } else {
        // Forking is a pure message-history copy against the shared
        // repository; no runner involvement either way.
        let parent = require_session(&state, id).await?;
        let new_id = SessionId::new();
        state.repo.insert_forked_session(&parent, new_id).await?
    };
    Ok((StatusCode::CREATED, Json(forked)).into_response())
}

pub async fn update_config(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Json(req): Json<UpdateConfigRequest>,
) -> ApiResult<Response> {
    require_session(&state, id).await?;
    let (model, config) = req.into_config();
    if let Some(orchestrator) = &state.orchestrator {
        let session = orchestrator.update_config(id, model, config).await?;
        return Ok(Json(session).into_response());
    }
    state.repo.update_session_config(&id, model, config).await?;
    Ok(Json(require_session(&state, id).await?).into_response())
}

pub async fn list_messages(State(state): State<AppState>, Path(id): Path<SessionId>) -> ApiResult<Response> {
    require_session(&state, id).await?;
    let messages = state.repo.list_messages(&id).await?;
    Ok(Json(messages).into_response())
}

pub async fn list_events(State(state): State<AppState>, Path(id): Path<SessionId>) -> ApiResult<Response> {
    require_session(&state, id).await?;
    let events = state.repo.list_events(&id).await?;
    Ok(Json(events).into_response())
}

pub async fn pause_session(State(state): State<AppState>, Path(id): Path<SessionId>) -> ApiResult<Response> {
    if let Some(orchestrator) = &state.orchestrator {
        return Ok(Json(orchestrator.pause_session(id).await?).into_response());
    }
    let session = require_session(&state, id).await?;
    let runner = resolve_runner(&state, &session, false).await?;
    proxy_json(&state, &runner, Method::POST, &format!("/api/sessions/{id}/pause"), None).await
}

pub async fn resume_session(State(state): State<AppState>, Path(id): Path<SessionId>) -> ApiResult<Response> {
    if let Some(orchestrator) = &state.orchestrator {
        return Ok(Json(orchestrator.resume_session(id).await?).into_response());
    }
    let session = require_session(&state, id).await?;
    let runner = resolve_runner(&state, &session, true).await?;
    proxy_json(&state, &runner, Method::POST, &format!("/api/sessions/{id}/resume"), None).await
}

pub async fn end_session(State(state): State<AppState>, Path(id): Path<SessionId>) -> ApiResult<Response> {
    if let Some(orchestrator) = &state.orchestrator {
        return Ok(Json(orchestrator.end_session(id).await?).into_response());
    }
    let session = require_session(&state, id).await?;
    let runner = resolve_runner(&state, &session, false).await?;
    proxy_json(&state, &runner, Method::DELETE, &format!("/api/sessions/{id}"), None).await
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<Response> {
    if let Some(orchestrator) = &state.orchestrator {
        let content = req.content.clone();
        let overrides: ash_orchestrator::options::MessageOverrides = req.into();
        let stream = orchestrator.send_message(id, content, overrides).await?;
        let sse_stream = stream.map(|event| {
            let event = match event {
                OrchestratorEvent::Message(payload) => Event::default().event("message").json_data(payload),
                OrchestratorEvent::Error { kind, message } => Event::default()
                    .event("error")
                    .json_data(json!({ "kind": kind, "message": message })),
                OrchestratorEvent::Done { session_id } => Event::default()
                    .event("done")
                    .json_data(json!({ "sessionId": session_id.to_string() })),
            };
            Ok::<_, Infallible>(event.unwrap_or_else(|_| Event::default().event("error")))
        });
        let sse = Sse::new(sse_stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)));
        return Ok(sse.into_response());
    }

    let session = require_session(&state, id).await?;
    let runner = resolve_runner(&state, &session, false).await?;
    let secret = state.internal_secret()?;
    let body = serde_json::to_value(&req).map_err(|err| ApiError::Internal(err.into()))?;
    let response = ash_coordinator::proxy::forward(
        &state.http_client,
        secret,
        &runner,
        Method::POST,
        &format!("/api/sessions/{id}/messages"),
        Some(body),
    )
    .await?;

    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::OK);
    let byte_stream = response.bytes_stream();
    let body = Body::from_stream(byte_stream);
    Ok((status, [("content-type", "text/event-stream")], body).into_response())
}

pub async fn list_files(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Query(_query): Query<ListQuery>,
) -> ApiResult<Response> {
    if let Some(orchestrator) = &state.orchestrator {
        return Ok(Json(orchestrator.list_files(id).await?).into_response());
    }
    let session = require_session(&state, id).await?;
    let runner = resolve_runner(&state, &session, false).await?;
    proxy_json(&state, &runner, Method::GET, &format!("/api/sessions/{id}/files"), None).await
}

pub async fn read_file(
    State(state): State<AppState>,
    Path((id, path)): Path<(SessionId, String)>,
) -> ApiResult<Response> {
    if let Some(orchestrator) = &state.orchestrator {
        let bytes = orchestrator.read_file(id, &path).await?;
        return Ok(([("content-type", "application/octet-stream")], bytes).into_response());
    }
    let session = require_session(&state, id).await?;
    let runner = resolve_runner(&state, &session, false).await?;
    let secret = state.internal_secret()?;
    let response = ash_coordinator::proxy::forward(
        &state.http_client,
        secret,
        &runner,
        Method::GET,
        &format!("/api/sessions/{id}/files/{path}"),
        None,
    )
    .await?;
    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::OK);
    let bytes = response
        .bytes()
        .await
        .map_err(|err| ApiError::Transient(err.to_string()))?;
    Ok((status, [("content-type", "application/octet-stream")], bytes).into_response())
}

pub async fn exec(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Json(req): Json<ExecRequest>,
) -> ApiResult<Response> {
    if let Some(orchestrator) = &state.orchestrator {
        let result = orchestrator
            .exec(id, &req.command, Duration::from_secs(req.timeout))
            .await?;
        return Ok(Json(result).into_response());
    }
    let session = require_session(&state, id).await?;
    let runner = resolve_runner(&state, &session, false).await?;
    let body = json!({ "command": req.command, "timeout": req.timeout });
    let response = proxy_json(&state, &runner, Method::POST, &format!("/api/sessions/{id}/exec"), Some(body)).await;
    if let Err(err) = &response {
        warn!(session_id = %id, %err, "proxied exec failed");
    }
    response
}
