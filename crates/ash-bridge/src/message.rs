//! Wire types for the bridge protocol. Envelopes are tagged sum types —
//! `{kind: "command"|"event",...}` at the outer level, a fixed shape per
//! variant inside. Unknown fields inside `options` and inside
//! `event.payload` are kept as opaque JSON and passed through verbatim.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type QueryId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    Low,
    Medium,
    High,
    Max,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Thinking {
    Adaptive,
    Enabled { budget: u32 },
    Disabled,
}

/// Per-query options. Unknown fields are preserved verbatim in `extra` and
/// re-serialized alongside the known ones, so the inner engine sees
/// everything the caller sent even if this crate doesn't know the field yet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default)]
    pub resume: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effort: Option<Effort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<Thinking>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_budget_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disallowed_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub betas: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agents: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_servers: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_partial_messages: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Server → bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    Query {
        query_id: QueryId,
        prompt: String,
        #[serde(default)]
        options: QueryOptions,
    },
    /// Cooperative cancellation of an in-flight query.
    Abort { query_id: QueryId },
}

impl Command {
    pub fn query_id(&self) -> &str {
        match self {
            Command::Query { query_id, .. } => query_id,
            Command::Abort { query_id } => query_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    QueryInFlight,
    FrameDecode,
    EngineFailure,
    Aborted,
}

/// Bridge → server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    /// Sent once after the in-sandbox process is listening.
    Ready,
    /// Passthrough of one streaming message produced by the inner engine.
    Event { query_id: QueryId, payload: Value },
    Done { query_id: QueryId },
    Error {
        query_id: QueryId,
        kind: ErrorKind,
        message: String,
    },
}
