//! A thin HTTP client for `ash-server`. Every subcommand is one request
//! against the public API; no local state, no SDK layer — just `clap` +
//! `reqwest` the way `crates/cli` drives its providers, minus everything
//! that's specific to talking to an LLM directly.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde_json::{json, Value};

#[derive(Parser, Debug)]
#[command(name = "ash", about = "Client for an ash-server deployment")]
struct Cli {
    /// Base URL of the ash-server instance.
    #[arg(long, env = "ASH_SERVER_URL", default_value = "http://127.0.0.1:8080")]
    server: String,

    /// Bearer token for the public API.
    #[arg(long, env = "ASH_API_KEY")]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stage or redeploy an agent directory.
    Deploy { name: String, path: String },
    /// List deployed agents.
    Agents,
    /// Create a new session against an agent.
    Create {
        agent: String,
        #[arg(long)]
        model: Option<String>,
    },
    /// List sessions, optionally filtered by agent name.
    Sessions {
        #[arg(long)]
        agent: Option<String>,
    },
    /// Send a message and stream the response to stdout.
    Send { session_id: String, content: String },
    /// Pause a session.
    Pause { session_id: String },
    /// Resume a session.
    Resume { session_id: String },
    /// End a session.
    End { session_id: String },
    /// Fork a session's history into a new one.
    Fork { session_id: String },
    /// Print a session's event log.
    Events { session_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Deploy { name, path } => {
            let body = json!({ "name": name, "path": path });
            let value = request(&client, &cli, reqwest::Method::POST, "/api/agents", Some(body)).await?;
            print_json(&value);
        }
        Commands::Agents => {
            let value = request(&client, &cli, reqwest::Method::GET, "/api/agents", None).await?;
            print_json(&value);
        }
        Commands::Create { agent, model } => {
            let body = json!({ "agent": agent, "model": model });
            let value = request(&client, &cli, reqwest::Method::POST, "/api/sessions", Some(body)).await?;
            print_json(&value);
        }
        Commands::Sessions { agent } => {
            let path = match agent {
                Some(agent) => format!("/api/sessions?agent={agent}"),
                None => "/api/sessions".to_string(),
            };
            let value = request(&client, &cli, reqwest::Method::GET, &path, None).await?;
            print_json(&value);
        }
        Commands::Send { session_id, content } => {
            send_message(&client, &cli, &session_id, content).await?;
        }
        Commands::Pause { session_id } => {
            let path = format!("/api/sessions/{session_id}/pause");
            let value = request(&client, &cli, reqwest::Method::POST, &path, None).await?;
            print_json(&value);
        }
        Commands::Resume { session_id } => {
            let path = format!("/api/sessions/{session_id}/resume");
            let value = request(&client, &cli, reqwest::Method::POST, &path, None).await?;
            print_json(&value);
        }
        Commands::End { session_id } => {
            let path = format!("/api/sessions/{session_id}");
            let value = request(&client, &cli, reqwest::Method::DELETE, &path, None).await?;
            print_json(&value);
        }
        Commands::Fork { session_id } => {
            let path = format!("/api/sessions/{session_id}/fork");
            let value = request(&client, &cli, reqwest::Method::POST, &path, None).await?;
            print_json(&value);
        }
        Commands::Events { session_id } => {
            let path = format!("/api/sessions/{session_id}/events");
            let value = request(&client, &cli, reqwest::Method::GET, &path, None).await?;
            print_json(&value);
        }
    }

    Ok(())
}

async fn request(
    client: &reqwest::Client,
    cli: &Cli,
    method: reqwest::Method,
    path: &str,
    body: Option<Value>,
) -> Result<Value> {
    let url = format!("{}{}", cli.server, path);
    let mut request = client.request(method, &url);
    if let Some(key) = &cli.api_key {
        request = request.bearer_auth(key);
    }
    if let Some(body) = body {
        request = request.json(&body);
    }
    let response = request.send().await.context("request to ash-server failed")?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        bail!("ash-server returned {status}: {text}");
    }
    response.json().await.context("ash-server returned a malformed response")
}

/// Streams the SSE response body straight to stdout — no framing parsed, so
/// the user sees exactly what the wire carries.
async fn send_message(client: &reqwest::Client, cli: &Cli, session_id: &str, content: String) -> Result<()> {
    let url = format!("{}/api/sessions/{session_id}/messages", cli.server);
    let mut request = client.post(&url).json(&json!({ "content": content }));
    if let Some(key) = &cli.api_key {
        request = request.bearer_auth(key);
    }
    let response = request.send().await.context("send-message request failed")?;
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        bail!("ash-server returned {status}: {text}");
    }

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("stream read failed")?;
        print!("{}", String::from_utf8_lossy(&chunk));
    }
    Ok(())
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(_) => println!("{value}"),
    }
}
