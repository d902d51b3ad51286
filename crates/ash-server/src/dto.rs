//! Request bodies for the public and internal HTTP surface. Response bodies
//! are the domain types from `ash_core::model` directly — they already
//! serialize as camelCase.

use ash_core::model::SessionConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub struct CreateAgentRequest {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub agent: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub mcp_servers: Option<Value>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub disallowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub betas: Option<Vec<String>>,
    #[serde(default)]
    pub permission_webhook_url: Option<String>,
    #[serde(default)]
    pub hook_webhook_url: Option<String>,
}

impl CreateSessionRequest {
    pub fn into_config(self) -> (Option<String>, Option<SessionConfig>) {
        let config = SessionConfig {
            model: None,
            system_prompt: self.system_prompt,
            allowed_tools: self.allowed_tools,
            disallowed_tools: self.disallowed_tools,
            betas: self.betas,
            mcp_servers: self.mcp_servers,
            permission_webhook_url: self.permission_webhook_url,
            hook_webhook_url: self.hook_webhook_url,
        };
        (self.model, Some(config))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConfigRequest {
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
    #[serde(default)]
    pub permission_webhook_url: Option<String>,
    #[serde(default)]
    pub hook_webhook_url: Option<String>,
}

impl UpdateConfigRequest {
    pub fn into_config(self) -> (Option<String>, Option<SessionConfig>) {
        let config = SessionConfig {
            model: None,
            system_prompt: self.system_prompt,
            allowed_tools: self.allowed_tools,
            disallowed_tools: self.disallowed_tools,
            betas: self.betas,
            mcp_servers: self.mcp_servers,
            permission_webhook_url: self.permission_webhook_url,
            hook_webhook_url: self.hook_webhook_url,
        };
        (self.model, Some(config))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub content: Value,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub effort: Option<ash_bridge::Effort>,
    #[serde(default)]
    pub thinking: Option<ash_bridge::Thinking>,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub max_budget_usd: Option<f64>,
    #[serde(default)]
    pub output_format: Option<Value>,
    #[serde(default)]
    pub include_partial_messages: Option<bool>,
}

impl From<SendMessageRequest> for ash_orchestrator::options::MessageOverrides {
    fn from(req: SendMessageRequest) -> Self {
        Self {
            model: req.model,
            effort: req.effort,
            thinking: req.thinking,
            max_turns: req.max_turns,
            max_budget_usd: req.max_budget_usd,
            output_format: req.output_format,
            include_partial_messages: req.include_partial_messages,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub command: String,
    #[serde(default = "default_exec_timeout_secs")]
    pub timeout: u64,
}

fn default_exec_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRunnerRequest {
    pub host: String,
    pub port: u16,
    pub max_sandboxes: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub active_count: u32,
    pub warming_count: u32,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListQuery {
    pub agent: Option<String>,
    pub format: Option<String>,
}
