//! Shared application state, one instance cloned into every axum handler.
//! Exactly one of `orchestrator`/`coordinator` is populated depending on the
//! node's [`ash_core::config::NodeMode`] — solo and runner nodes own a local
//! `Orchestrator`, a coordinator node owns a `Coordinator` and proxies
//! everything else through it.

use std::sync::Arc;

use ash_core::error::{ApiError, ApiResult};
use ash_core::repository::Repository;
use ash_coordinator::Coordinator;
use ash_orchestrator::Orchestrator;

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repository>,
    pub orchestrator: Option<Arc<Orchestrator>>,
    pub coordinator: Option<Arc<Coordinator>>,
    pub pool: Option<Arc<ash_pool::Pool>>,
    pub http_client: reqwest::Client,
    pub api_key: Option<String>,
    pub internal_secret: Option<String>,
}

impl AppState {
    pub fn orchestrator(&self) -> ApiResult<&Arc<Orchestrator>> {
        self.orchestrator
            .as_ref()
            .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("this node has no local orchestrator")))
    }

    pub fn coordinator(&self) -> ApiResult<&Arc<Coordinator>> {
        self.coordinator
            .as_ref()
            .ok_or_else(|| ApiError::Internal(anyhow::anyhow!("this node is not a coordinator")))
    }

    pub fn internal_secret(&self) -> ApiResult<&str> {
        self.internal_secret.as_deref().ok_or(ApiError::AuthFailure)
    }
}
