//! `/health` and `/metrics` — unauthenticated on every node mode.

use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Response {
    let body = if let Some(pool) = &state.pool {
        json!({
            "status": "ok",
            "mode": "local",
            "liveSandboxes": pool.live_count(),
        })
    } else if let Some(coordinator) = &state.coordinator {
        let runners = coordinator.list_runners().await.unwrap_or_default();
        json!({
            "status": "ok",
            "mode": "coordinator",
            "runnerCount": runners.len(),
        })
    } else {
        json!({ "status": "ok" })
    };
    Json(body).into_response()
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    let mut out = String::new();
    if let Some(pool) = &state.pool {
        out.push_str("# HELP ash_live_sandboxes Live sandboxes on this node\n");
        out.push_str("# TYPE ash_live_sandboxes gauge\n");
        out.push_str(&format!("ash_live_sandboxes {}\n", pool.live_count()));
    }
    if let Some(orchestrator) = &state.orchestrator {
        out.push_str("# HELP ash_resume_warm_hits_total Resumes served by a still-warm sandbox\n");
        out.push_str("# TYPE ash_resume_warm_hits_total counter\n");
        out.push_str(&format!(
            "ash_resume_warm_hits_total {}\n",
            orchestrator.resume_warm_hits()
        ));
        out.push_str("# HELP ash_resume_cold_hits_total Resumes served by a cold snapshot restore\n");
        out.push_str("# TYPE ash_resume_cold_hits_total counter\n");
        out.push_str(&format!(
            "ash_resume_cold_hits_total {}\n",
            orchestrator.resume_cold_hits()
        ));
    }
    if let Some(coordinator) = &state.coordinator {
        let runners = coordinator.list_runners().await.unwrap_or_default();
        out.push_str("# HELP ash_registered_runners Runners currently registered\n");
        out.push_str("# TYPE ash_registered_runners gauge\n");
        out.push_str(&format!("ash_registered_runners {}\n", runners.len()));
    }
    ([("content-type", "text/plain; version=0.0.4")], out).into_response()
}
