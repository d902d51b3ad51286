//! Forwards one HTTP request to a runner's internal API and hands the
//! `reqwest::Response` back untouched — `ash-server`'s coordinator-mode
//! routes turn that into an axum `Response`, streaming the body through for
//! the SSE send-message proxy and buffering it to JSON everywhere else.

use ash_core::error::ApiResult;
use ash_core::model::Runner;
use reqwest::{Client, Method, Response};
use serde_json::Value;

use crate::error::CoordinatorError;

fn runner_base_url(runner: &Runner) -> String {
    format!("http://{}:{}", runner.host, runner.port)
}

/// One proxied call to a runner's internal API, authenticated with the
/// shared internal secret. Callers decide whether to buffer the response to
/// JSON or stream it straight through.
pub async fn forward(
    client: &Client,
    internal_secret: &str,
    runner: &Runner,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> ApiResult<Response> {
    let url = format!("{}{}", runner_base_url(runner), path);
    let mut request = client
        .request(method, &url)
        .header("X-Internal-Secret", internal_secret);
    if let Some(body) = body {
        request = request.json(&body);
    }

    let response = request.send().await.map_err(|err| {
        CoordinatorError::RunnerUnreachable(runner.id.to_string(), err.to_string())
    })?;

    if response.status().is_client_error() || response.status().is_server_error() {
        return Err(CoordinatorError::RunnerError(runner.id.to_string(), response.status().as_u16()).into());
    }
    Ok(response)
}

/// Same as [`forward`] but decodes the body as JSON — used for every
/// lifecycle op that isn't the streaming send-message call.
pub async fn forward_json(
    client: &Client,
    internal_secret: &str,
    runner: &Runner,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> ApiResult<Value> {
    let response = forward(client, internal_secret, runner, method, path, body).await?;
    response
        .json()
        .await
        .map_err(|err| CoordinatorError::RunnerUnreachable(runner.id.to_string(), err.to_string()).into())
}
