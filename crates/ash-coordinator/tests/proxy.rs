use ash_core::ids::RunnerId;
use ash_core::model::Runner;
use ash_coordinator::proxy::forward_json;
use chrono::Utc;
use reqwest::Method;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fake_runner(host: String, port: u16) -> Runner {
    Runner {
        id: RunnerId::new(),
        host,
        port,
        max_sandboxes: 8,
        active_count: 0,
        warming_count: 0,
        last_heartbeat_at: Utc::now(),
        registered_at: Utc::now(),
    }
}

#[tokio::test]
async fn forwards_request_with_internal_secret_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/internal/sessions"))
        .and(header("x-internal-secret", "shared-secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .mount(&server)
        .await;

    let url = url::Url::parse(&server.uri()).unwrap();
    let runner = fake_runner(
        url.host_str().unwrap().to_string(),
        url.port().unwrap(),
    );

    let client = reqwest::Client::new();
    let result = forward_json(
        &client,
        "shared-secret",
        &runner,
        Method::POST,
        "/api/internal/sessions",
        Some(serde_json::json!({"agent": "demo"})),
    )
    .await
    .unwrap();

    assert_eq!(result["ok"], true);
}

#[tokio::test]
async fn non_2xx_status_becomes_runner_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/internal/runners/self"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let url = url::Url::parse(&server.uri()).unwrap();
    let runner = fake_runner(url.host_str().unwrap().to_string(), url.port().unwrap());

    let client = reqwest::Client::new();
    let err = forward_json(
        &client,
        "shared-secret",
        &runner,
        Method::GET,
        "/api/internal/runners/self",
        None,
    )
    .await
    .unwrap_err();

    assert_eq!(err.status_code(), 500);
}
