//! Session Orchestrator: the session state machine, message dispatch, and the
//! fork/pause/resume/end operations, sitting above `ash-pool`'s sandbox
//! lifecycle and `ash-bridge`'s wire protocol.

pub mod error;
pub mod eviction;
pub mod files;
pub mod options;
pub mod restore;
pub mod orchestrator;
pub mod timing;

pub use error::OrchestratorError;
pub use eviction::SnapshotEvictionHooks;
pub use files::{ExecResult, FileEntry};
pub use options::{merge_query_options, AgentSettings, MessageOverrides};
pub use orchestrator::{MessageStream, Orchestrator, OrchestratorEvent};
pub use restore::SnapshotRestoreHook;
pub use timing::TimingLog;
