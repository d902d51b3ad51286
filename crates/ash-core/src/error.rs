//! The single error enum the HTTP layer converts every internal failure into.
//! Each crate's own `thiserror` error type converts into this one with
//! `#[from]`, so a new failure mode needs a call-site `.map_err`/`?`, never a
//! new match arm in a route handler.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("session {0} has ended")]
    SessionEnded(String),

    #[error("pool capacity exhausted")]
    CapacityExhausted,

    #[error("no runner available")]
    NoRunnerAvailable,

    #[error("authentication failed")]
    AuthFailure,

    #[error("sandbox create failed: {0}")]
    SandboxCreateFailure(String),

    #[error("bridge protocol error: {0}")]
    BridgeProtocolError(String),

    #[error("snapshot unavailable: {0}")]
    SnapshotUnavailable(String),

    #[error("transient I/O error: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    status_code: u16,
}

impl ApiError {
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::Validation(_) => 400,
            ApiError::NotFound(_) => 404,
            ApiError::Conflict(_) => 400,
            ApiError::SessionEnded(_) => 410,
            ApiError::CapacityExhausted | ApiError::NoRunnerAvailable => 503,
            ApiError::AuthFailure => 401,
            ApiError::SandboxCreateFailure(_) => 500,
            ApiError::BridgeProtocolError(_) => 500,
            ApiError::SnapshotUnavailable(_) => 503,
            ApiError::Transient(_) => 503,
            ApiError::Internal(_) => 500,
        }
    }
}

#[cfg(feature = "http")]
mod http_impl {
    use super::*;
    use axum::Json;
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};

    impl IntoResponse for ApiError {
        fn into_response(self) -> Response {
            let status_code = self.status_code();
            tracing::warn!(error = %self, status_code, "request failed");
            let status =
                StatusCode::from_u16(status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let body = ErrorBody {
                error: self.to_string(),
                status_code,
            };
            (status, Json(body)).into_response()
        }
    }
}
