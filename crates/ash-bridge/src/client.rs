//! Server-side half of the bridge: connects to a sandbox's Unix socket,
//! sends [`Command`]s, and yields the [`Event`] stream back. Used by
//! `ash-sandbox`'s manager once a child process is spawned.

use std::path::Path;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::time::sleep;
use tokio_util::codec::Framed;

use crate::codec::{CodecError, JsonLengthCodec};
use crate::message::{Command, Event};

#[derive(Debug, Error)]
pub enum BridgeClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("bridge connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("bridge channel closed")]
    Closed,
}

type Framing = Framed<UnixStream, JsonLengthCodec<Command, Event>>;

/// One connection to a sandbox's bridge socket. Frames written go to the
/// in-sandbox process; `events` is the stream of everything it sends back
/// (interleaved `ready`/`event`/`done`/`error` for whichever query is
/// active).
pub struct BridgeClient {
    framed: Framing,
}

impl BridgeClient {
    /// Connect with bounded retry + exponential backoff up to a wall-clock
    /// cap — the socket may not exist yet if the child hasn't finished
    /// binding it.
    pub async fn connect(
        socket_path: &Path,
        wall_clock_cap: Duration,
    ) -> Result<Self, BridgeClientError> {
        let start = tokio::time::Instant::now();
        let mut backoff = Duration::from_millis(10);
        loop {
            match UnixStream::connect(socket_path).await {
                Ok(stream) => {
                    return Ok(Self {
                        framed: Framed::new(stream, JsonLengthCodec::new()),
                    });
                }
                Err(err) => {
                    if start.elapsed() >= wall_clock_cap {
                        return Err(BridgeClientError::Io(err));
                    }
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(1));
                }
            }
        }
    }

    /// Wait for the initial `ready` event. The manager must not declare the
    /// sandbox ready before this arrives.
    pub async fn wait_ready(&mut self, timeout: Duration) -> Result<(), BridgeClientError> {
        let event = tokio::time::timeout(timeout, self.framed.next())
            .await
            .map_err(|_| BridgeClientError::ConnectTimeout(timeout))?
            .ok_or(BridgeClientError::Closed)??;
        match event {
            Event::Ready => Ok(()),
            other => {
                tracing::warn!(?other, "expected ready event, got something else first");
                Ok(())
            }
        }
    }

    pub async fn send(&mut self, command: Command) -> Result<(), BridgeClientError> {
        self.framed.send(command).await?;
        Ok(())
    }

    pub async fn next_event(&mut self) -> Option<Result<Event, BridgeClientError>> {
        self.framed.next().await.map(|r| r.map_err(Into::into))
    }

    /// Split into an independent command sender and event stream so a caller
    /// can pump events into an SSE response on one task while a disconnect
    /// watcher sends `abort` from another — the send-message handler's only
    /// lock across suspension points.
    pub fn split(self) -> (BridgeSender, BridgeReceiver) {
        let (sink, stream) = self.framed.split();
        (BridgeSender { sink }, BridgeReceiver { stream })
    }
}

pub struct BridgeSender {
    sink: SplitSink<Framing, Command>,
}

impl BridgeSender {
    pub async fn send(&mut self, command: Command) -> Result<(), BridgeClientError> {
        self.sink.send(command).await?;
        Ok(())
    }
}

pub struct BridgeReceiver {
    stream: SplitStream<Framing>,
}

impl BridgeReceiver {
    pub async fn next_event(&mut self) -> Option<Result<Event, BridgeClientError>> {
        self.stream.next().await.map(|r| r.map_err(Into::into))
    }
}
