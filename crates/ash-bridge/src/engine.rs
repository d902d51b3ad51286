//! The opaque "inner query engine" boundary. Anything implementing
//! [`QueryEngine`] can sit behind `ash-runtime`; this crate only needs a
//! stream of [`EngineEvent`]s in, an abort in.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::message::QueryOptions;

/// One streaming message produced by the inner engine: assistant text, tool
/// use, tool result, stream delta, or result summary. Opaque to the bridge
/// except for the accounting fields used for `UsageEvent` rows.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EngineEvent {
    pub payload: Value,
    #[serde(default)]
    pub input_tokens: Option<i64>,
    #[serde(default)]
    pub output_tokens: Option<i64>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
}

/// A bridge handles at most one active query at a time; the harness in
/// [`crate::runtime`] enforces that, not this trait.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn query(&self, prompt: String, options: QueryOptions) -> BoxStream<'static, EngineEvent>;

    /// Cooperative cancellation. Must return promptly even if `query_id`
    /// is unknown or already finished.
    async fn abort(&self, query_id: &str);
}
