use ash_core::error::ApiError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("agent {0} not found")]
    AgentNotFound(String),

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("session {0} has ended")]
    SessionEnded(String),

    #[error("snapshot restore failed: {0}")]
    RestoreFailed(String),
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::AgentNotFound(id) => ApiError::NotFound(format!("agent {id}")),
            OrchestratorError::SessionNotFound(id) => ApiError::NotFound(format!("session {id}")),
            OrchestratorError::SessionEnded(id) => ApiError::SessionEnded(id),
            OrchestratorError::RestoreFailed(msg) => ApiError::SnapshotUnavailable(msg),
        }
    }
}
