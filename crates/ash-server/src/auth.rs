//! The two auth layers installed ahead of the public and internal route
//! groups. Both defer the actual comparison to `ash_core::auth`; this module
//! only wires them up as axum middleware.

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;

use ash_core::auth::{check_bearer, check_shared_secret};
use ash_core::error::ApiError;

use crate::state::AppState;

/// Public surface: `Authorization: Bearer <key>`. A no-op when the node was
/// started without an API key configured (single-user local deployments).
pub async fn bearer_auth(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(key) = &state.api_key {
        let header = request
            .headers()
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        check_bearer(header, key)?;
    }
    Ok(next.run(request).await)
}

/// Runner/coordinator surface: `X-Internal-Secret: <secret>`. Always
/// required — there is no "auth disabled" mode for this layer.
pub async fn internal_auth(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let secret = state.internal_secret()?;
    let header = request
        .headers()
        .get("X-Internal-Secret")
        .and_then(|v| v.to_str().ok());
    check_shared_secret(header, secret)?;
    Ok(next.run(request).await)
}
