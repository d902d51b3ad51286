use ash_core::error::ApiError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("postgres error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("migration {0} failed: {1}")]
    Migration(&'static str, String),

    #[error("sequence collision for session {0} retried past the limit")]
    SequenceRetryExhausted(String),
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        ApiError::Internal(anyhow::anyhow!(err))
    }
}
