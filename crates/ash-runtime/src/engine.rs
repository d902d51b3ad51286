//! The shipped `QueryEngine` implementation. Real deployments swap this for
//! whatever inner agent loop they run; this one is a deterministic stand-in
//! used by `ash-runtime` until an operator wires in something else, and by
//! tests across the workspace.

use async_trait::async_trait;
use ash_bridge::engine::EngineEvent;
use ash_bridge::{QueryEngine, QueryOptions};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tokio::sync::Mutex;

/// Echoes the prompt back as a single assistant message. Tracks the last
/// `resume`-eligible session turn only to exercise the bridge's `resume`
/// wiring; it holds no actual model state.
pub struct FakeQueryEngine {
    turns: Mutex<u32>,
}

impl Default for FakeQueryEngine {
    fn default() -> Self {
        Self { turns: Mutex::new(0) }
    }
}

#[async_trait]
impl QueryEngine for FakeQueryEngine {
    async fn query(&self, prompt: String, options: QueryOptions) -> BoxStream<'static, EngineEvent> {
        let mut turns = self.turns.lock().await;
        *turns += 1;
        let turn = *turns;
        drop(turns);

        let reply = format!("(turn {turn}, resume={}) {prompt}", options.resume);
        let event = EngineEvent {
            payload: serde_json::json!({"type": "assistant", "text": reply}),
            input_tokens: Some(prompt.split_whitespace().count() as i64),
            output_tokens: Some(reply.split_whitespace().count() as i64),
            cost_usd: Some(0.0),
        };
        stream::once(async move { event }).boxed()
    }

    async fn abort(&self, query_id: &str) {
        tracing::info!(query_id, "abort requested; fake engine has no in-flight work to cancel");
    }
}
