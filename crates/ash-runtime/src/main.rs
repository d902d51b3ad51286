//! Binary that runs inside a sandbox's isolation backend and speaks the
//! bridge protocol over a Unix socket to the server.

mod engine;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use engine::FakeQueryEngine;

#[derive(Debug, Parser)]
#[command(name = "ash-runtime")]
struct Args {
    /// Unix socket path the manager expects this process to bind and serve.
    #[arg(long)]
    socket: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let session_id = std::env::var("ASH_SESSION_ID").unwrap_or_default();
    tracing::info!(socket = %args.socket.display(), session_id, "ash-runtime starting");

    let engine = Arc::new(FakeQueryEngine::default());
    ash_bridge::runtime::serve(&args.socket, engine).await?;

    tracing::info!("bridge connection closed, exiting");
    Ok(())
}
