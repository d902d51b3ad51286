//! `ASH_DEBUG_TIMING` logger: one JSON line per message to stderr,
//! independent of the `tracing` subscriber, so timing data can be grepped out
//! of a noisy log without a structured-logging pipeline in front of it.

use std::time::Instant;

use ash_core::ids::SessionId;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Serialize)]
struct TimingLine<'a> {
    session_id: String,
    query_id: &'a str,
    phase: &'a str,
    elapsed_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<Value>,
}

/// Call sites note the instant a phase started and pass it here when the
/// phase ends; no-op unless `ASH_DEBUG_TIMING` is set.
pub struct TimingLog {
    enabled: bool,
}

impl TimingLog {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn record(&self, session_id: SessionId, query_id: &str, phase: &str, since: Instant) {
        self.record_detail(session_id, query_id, phase, since, None);
    }

    pub fn record_detail(
        &self,
        session_id: SessionId,
        query_id: &str,
        phase: &str,
        since: Instant,
        detail: Option<Value>,
    ) {
        if !self.enabled {
            return;
        }
        let line = TimingLine {
            session_id: session_id.to_string(),
            query_id,
            phase,
            elapsed_ms: since.elapsed().as_millis(),
            detail,
        };
        if let Ok(json) = serde_json::to_string(&line) {
            eprintln!("{json}");
        }
    }
}
