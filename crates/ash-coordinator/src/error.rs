//! `CoordinatorError` folds into [`ash_core::error::ApiError`] at the call
//! site, the same way every other crate's error type does.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("runner {0} not found")]
    RunnerNotFound(String),

    #[error("no healthy runner available")]
    NoRunnerAvailable,

    #[error("runner {0} unreachable: {1}")]
    RunnerUnreachable(String, String),

    #[error("runner {0} returned status {1}")]
    RunnerError(String, u16),
}

impl From<CoordinatorError> for ash_core::error::ApiError {
    fn from(err: CoordinatorError) -> Self {
        use ash_core::error::ApiError;
        match err {
            CoordinatorError::RunnerNotFound(id) => ApiError::NotFound(format!("runner {id}")),
            CoordinatorError::NoRunnerAvailable => ApiError::NoRunnerAvailable,
            CoordinatorError::RunnerUnreachable(id, msg) => {
                ApiError::Transient(format!("runner {id} unreachable: {msg}"))
            }
            CoordinatorError::RunnerError(id, status) => {
                ApiError::Internal(anyhow::anyhow!("runner {id} returned status {status}"))
            }
        }
    }
}
