use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ash_bridge::{Command, Event, QueryEngine, QueryOptions};
use ash_bridge::client::BridgeClient;
use ash_bridge::engine::EngineEvent;
use futures::stream::{self, BoxStream};
use futures::StreamExt;

struct EchoEngine;

#[async_trait]
impl QueryEngine for EchoEngine {
    async fn query(&self, prompt: String, _options: QueryOptions) -> BoxStream<'static, EngineEvent> {
        let events = vec![
            EngineEvent {
                payload: serde_json::json!({"type": "assistant", "text": prompt}),
                input_tokens: Some(3),
                output_tokens: Some(5),
                cost_usd: Some(0.001),
            },
        ];
        stream::iter(events).boxed()
    }

    async fn abort(&self, _query_id: &str) {}
}

#[tokio::test]
async fn query_round_trips_through_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("bridge.sock");

    let server_socket = socket_path.clone();
    tokio::spawn(async move {
        ash_bridge::runtime::serve(&server_socket, Arc::new(EchoEngine))
            .await
            .unwrap();
    });

    let mut client = BridgeClient::connect(&socket_path, Duration::from_secs(2))
        .await
        .unwrap();
    client.wait_ready(Duration::from_secs(2)).await.unwrap();

    client
        .send(Command::Query {
            query_id: "q1".into(),
            prompt: "ping".into(),
            options: QueryOptions::default(),
        })
        .await
        .unwrap();

    let mut saw_assistant = false;
    let mut saw_done = false;
    for _ in 0..2 {
        match client.next_event().await.unwrap().unwrap() {
            Event::Event { query_id, payload } => {
                assert_eq!(query_id, "q1");
                assert_eq!(payload["text"], "ping");
                saw_assistant = true;
            }
            Event::Done { query_id } => {
                assert_eq!(query_id, "q1");
                saw_done = true;
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert!(saw_assistant && saw_done);
}

#[tokio::test]
async fn concurrent_query_on_same_bridge_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("bridge.sock");

    struct SlowEngine;
    #[async_trait]
    impl QueryEngine for SlowEngine {
        async fn query(
            &self,
            _prompt: String,
            _options: QueryOptions,
        ) -> BoxStream<'static, EngineEvent> {
            stream::once(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                EngineEvent {
                    payload: serde_json::json!({"type": "assistant", "text": "done"}),
                    input_tokens: None,
                    output_tokens: None,
                    cost_usd: None,
                }
            })
            .boxed()
        }

        async fn abort(&self, _query_id: &str) {}
    }

    let server_socket = socket_path.clone();
    tokio::spawn(async move {
        ash_bridge::runtime::serve(&server_socket, Arc::new(SlowEngine))
            .await
            .unwrap();
    });

    let mut client = BridgeClient::connect(&socket_path, Duration::from_secs(2))
        .await
        .unwrap();
    client.wait_ready(Duration::from_secs(2)).await.unwrap();

    client
        .send(Command::Query {
            query_id: "q1".into(),
            prompt: "first".into(),
            options: QueryOptions::default(),
        })
        .await
        .unwrap();
    client
        .send(Command::Query {
            query_id: "q2".into(),
            prompt: "second".into(),
            options: QueryOptions::default(),
        })
        .await
        .unwrap();

    let mut saw_conflict_error = false;
    for _ in 0..3 {
        match client.next_event().await.unwrap().unwrap() {
            Event::Error { query_id, .. } => {
                assert_eq!(query_id, "q2");
                saw_conflict_error = true;
                break;
            }
            _ => continue,
        }
    }
    assert!(saw_conflict_error);
}
