//! Query-option precedence merge: per-message > session > agent record >
//! agent settings file > engine default. Each layer is an optional partial
//! override; the first `Some` encountered wins.

use ash_bridge::{Effort, QueryOptions, Thinking};
use ash_core::model::SessionConfig;
use serde_json::Value;

/// Per-message overrides, taken from a `POST.../messages` body.
#[derive(Debug, Clone, Default)]
pub struct MessageOverrides {
    pub model: Option<String>,
    pub effort: Option<Effort>,
    pub thinking: Option<Thinking>,
    pub max_turns: Option<u32>,
    pub max_budget_usd: Option<f64>,
    pub output_format: Option<Value>,
    pub include_partial_messages: Option<bool>,
}

/// An agent directory's optional `ash.json` settings file — the lowest
/// layer above the engine's own defaults.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSettings {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub disallowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub betas: Option<Vec<String>>,
    #[serde(default)]
    pub mcp_servers: Option<Value>,
}

fn first_some<T>(a: Option<T>, b: Option<T>) -> Option<T> {
    a.or(b)
}

/// Build the `QueryOptions` sent to the bridge for one turn. `resume` is
/// computed by the caller from the live sandbox's `LiveEntry::has_handled_query`,
/// not by this merge.
pub fn merge_query_options(
    resume: bool,
    message: MessageOverrides,
    session: Option<&SessionConfig>,
    agent_model: Option<&str>,
    settings: Option<&AgentSettings>,
) -> QueryOptions {
    let model = message
        .model
        .or_else(|| session.and_then(|s| s.model.clone()))
        .or_else(|| agent_model.map(str::to_string))
        .or_else(|| settings.and_then(|s| s.model.clone()));

    let system_prompt = first_some(
        session.and_then(|s| s.system_prompt.clone()),
        settings.and_then(|s| s.system_prompt.clone()),
    );

    let allowed_tools = first_some(
        session.and_then(|s| s.allowed_tools.clone()),
        settings.and_then(|s| s.allowed_tools.clone()),
    );
    let disallowed_tools = first_some(
        session.and_then(|s| s.disallowed_tools.clone()),
        settings.and_then(|s| s.disallowed_tools.clone()),
    );
    let betas = first_some(
        session.and_then(|s| s.betas.clone()),
        settings.and_then(|s| s.betas.clone()),
    );
    let mcp_servers = first_some(
        session.and_then(|s| s.mcp_servers.clone()),
        settings.and_then(|s| s.mcp_servers.clone()),
    );

    QueryOptions {
        resume,
        model,
        effort: message.effort,
        thinking: message.thinking,
        max_turns: message.max_turns,
        max_budget_usd: message.max_budget_usd,
        allowed_tools,
        disallowed_tools,
        betas,
        agents: None,
        agent: None,
        output_format: message.output_format,
        system_prompt,
        mcp_servers,
        include_partial_messages: message.include_partial_messages,
        extra: webhook_extra(session),
    }
}

/// `permissionWebhookUrl`/`hookWebhookUrl` have no dedicated `QueryOptions`
/// field — they ride along as opaque passthrough fields the bridge forwards
/// verbatim.
fn webhook_extra(session: Option<&SessionConfig>) -> serde_json::Map<String, Value> {
    let mut extra = serde_json::Map::new();
    if let Some(session) = session {
        if let Some(url) = &session.permission_webhook_url {
            extra.insert("permission_webhook_url".into(), Value::String(url.clone()));
        }
        if let Some(url) = &session.hook_webhook_url {
            extra.insert("hook_webhook_url".into(), Value::String(url.clone()));
        }
    }
    extra
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_message_model_wins_over_every_other_layer() {
        let session = SessionConfig {
            model: Some("session-model".into()),
            ..Default::default()
        };
        let settings = AgentSettings {
            model: Some("settings-model".into()),
            ..Default::default()
        };
        let opts = merge_query_options(
            true,
            MessageOverrides {
                model: Some("message-model".into()),
                ..Default::default()
            },
            Some(&session),
            Some("agent-model"),
            Some(&settings),
        );
        assert_eq!(opts.model.as_deref(), Some("message-model"));
        assert!(opts.resume);
    }

    #[test]
    fn falls_through_to_settings_file_when_nothing_else_set() {
        let settings = AgentSettings {
            model: Some("settings-model".into()),
            system_prompt: Some("be terse".into()),
            ..Default::default()
        };
        let opts = merge_query_options(false, MessageOverrides::default(), None, None, Some(&settings));
        assert_eq!(opts.model.as_deref(), Some("settings-model"));
        assert_eq!(opts.system_prompt.as_deref(), Some("be terse"));
    }

    #[test]
    fn agent_record_model_beats_settings_file() {
        let settings = AgentSettings {
            model: Some("settings-model".into()),
            ..Default::default()
        };
        let opts = merge_query_options(
            false,
            MessageOverrides::default(),
            None,
            Some("agent-model"),
            Some(&settings),
        );
        assert_eq!(opts.model.as_deref(), Some("agent-model"));
    }
}
