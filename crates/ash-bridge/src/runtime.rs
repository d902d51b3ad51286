//! In-sandbox half of the bridge: binds the Unix socket, sends `ready`, then
//! serves at most one query at a time against a [`QueryEngine`]. Used by the
//! `ash-runtime` binary.

use std::path::Path;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio_util::codec::Framed;

use crate::codec::{CodecError, JsonLengthCodec};
use crate::engine::QueryEngine;
use crate::message::{Command, ErrorKind, Event, QueryId};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Bind `socket_path`, accept exactly one connection (one server per
/// sandbox), send `ready`, then serve queries until the connection closes.
pub async fn serve(
    socket_path: &Path,
    engine: Arc<dyn QueryEngine>,
) -> Result<(), RuntimeError> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    let listener = UnixListener::bind(socket_path)?;
    tracing::info!(socket = %socket_path.display(), "bridge runtime listening");

    let (stream, _) = listener.accept().await?;
    serve_connection(stream, engine).await
}

async fn serve_connection(
    stream: UnixStream,
    engine: Arc<dyn QueryEngine>,
) -> Result<(), RuntimeError> {
    let mut framed: Framed<UnixStream, JsonLengthCodec<Event, Command>> =
        Framed::new(stream, JsonLengthCodec::new());
    framed.send(Event::Ready).await?;

    // One active query id at a time; guarded so `abort` for a stale id is
    // a cheap no-op instead of racing the next `query`.
    let active: Arc<Mutex<Option<QueryId>>> = Arc::new(Mutex::new(None));
    let (mut sink, mut stream) = framed.split();
    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<Event>();

    let writer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if sink.send(event).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        let command = match frame {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!(%err, "bridge frame decode error");
                continue;
            }
        };
        match command {
            Command::Query {
                query_id,
                prompt,
                options,
            } => {
                let mut guard = active.lock().await;
                if guard.is_some() {
                    let _ = event_tx.send(Event::Error {
                        query_id: query_id.clone(),
                        kind: ErrorKind::QueryInFlight,
                        message: "a query is already in flight on this bridge".into(),
                    });
                    continue;
                }
                *guard = Some(query_id.clone());
                drop(guard);

                let engine = engine.clone();
                let active = active.clone();
                let event_tx = event_tx.clone();
                tokio::spawn(async move {
                    let mut events = engine.query(prompt, options).await;
                    while let Some(ev) = events.next().await {
                        if event_tx
                            .send(Event::Event {
                                query_id: query_id.clone(),
                                payload: ev.payload,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    let _ = event_tx.send(Event::Done {
                        query_id: query_id.clone(),
                    });
                    *active.lock().await = None;
                });
            }
            Command::Abort { query_id } => {
                let in_flight = active.lock().await.as_deref() == Some(query_id.as_str());
                if in_flight {
                    engine.abort(&query_id).await;
                }
            }
        }
    }

    writer.abort();
    Ok(())
}
