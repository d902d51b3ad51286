//! Length-prefixed JSON protocol between the server and the process running
//! inside a sandbox. One Unix domain socket per sandbox. Both sides read and
//! write frames independently; correlation is by an opaque `queryId` the
//! server assigns per query. This crate owns the wire types, the frame codec,
//! and both halves of the harness: [`client::BridgeClient`] (used by
//! `ash-sandbox`'s manager) and [`runtime::serve`] (used by the `ash-runtime`
//! binary that runs inside the sandbox).

pub mod client;
pub mod codec;
pub mod engine;
pub mod message;
pub mod runtime;

pub use engine::{EngineEvent, QueryEngine};
pub use message::{Command, Effort, ErrorKind, Event, QueryId, QueryOptions, Thinking};
