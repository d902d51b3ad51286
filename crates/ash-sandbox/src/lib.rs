//! Sandbox Manager: create exactly one isolated process per sandbox id, wire
//! up its bridge channel, supervise its output, and destroy it cleanly.
//! Generalizes `querymt-sandbox`'s `nono`-based capability policy
//! (strongest-backend-first probing, static+dynamic capability grants) to
//! four isolation backends.

pub mod backend;
pub mod error;
pub mod limits;
pub mod logs;
pub mod manager;

pub use backend::{BackendPreference, ExecOutput, IsolationBackend, SpawnSpec, select_backend};
pub use error::SandboxError;
pub use limits::ResourceLimits;
pub use logs::{LogEntry, LogStream};
pub use manager::{CreateOpts, ManagedSandbox, OomCallback, SandboxManager, StartupTimings};
