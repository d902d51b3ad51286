//! A live sandbox tracked by the [`crate::pool::Pool`] — the in-memory half
//! of a `SandboxRecord`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use ash_bridge::client::{BridgeReceiver, BridgeSender};
use ash_core::ids::{SandboxId, SessionId, TenantId};
use ash_core::model::SandboxState;
use parking_lot::RwLock;
use tokio::sync::Mutex;

/// One sandbox with a live process. Removed from the pool's live map the
/// moment its state becomes `cold`; the DB row persists beyond that.
pub struct LiveEntry {
    pub sandbox_id: SandboxId,
    pub tenant: TenantId,
    pub agent_name: String,
    pub workspace_dir: PathBuf,
    pub socket_path: PathBuf,
    pub created_at: Instant,

    session_id: RwLock<Option<SessionId>>,
    state: RwLock<SandboxState>,
    last_used_at: RwLock<Instant>,

    /// Whether this in-sandbox process has handled a query yet. Reset per
    /// process (fresh on every `create`/`create_resuming`), never per
    /// session: the engine running inside a brand-new process has no
    /// last-session-id in memory, so its first query must carry
    /// `resume:false` even if the session itself has a nonzero
    /// `turn_count` from a prior process (spec.md §4.2).
    has_queried: AtomicBool,

    /// At most one query in flight per sandbox; callers hold these locks only
    /// across the bridge RPC itself, never across a whole turn's suspension
    /// points.
    pub sender: Mutex<BridgeSender>,
    pub receiver: Mutex<BridgeReceiver>,
}

impl LiveEntry {
    pub fn new(
        sandbox_id: SandboxId,
        tenant: TenantId,
        agent_name: String,
        workspace_dir: PathBuf,
        socket_path: PathBuf,
        session_id: Option<SessionId>,
        sender: BridgeSender,
        receiver: BridgeReceiver,
    ) -> Self {
        let now = Instant::now();
        let state = if session_id.is_some() {
            SandboxState::Waiting
        } else {
            SandboxState::Warm
        };
        Self {
            sandbox_id,
            tenant,
            agent_name,
            workspace_dir,
            socket_path,
            created_at: now,
            session_id: RwLock::new(session_id),
            state: RwLock::new(state),
            last_used_at: RwLock::new(now),
            has_queried: AtomicBool::new(false),
            sender: Mutex::new(sender),
            receiver: Mutex::new(receiver),
        }
    }

    /// Whether this process has already handled a query — the condition for
    /// sending `resume:true` on the next one.
    pub fn has_handled_query(&self) -> bool {
        self.has_queried.load(Ordering::SeqCst)
    }

    /// Marks that a query has been dispatched to this process, so subsequent
    /// queries on the same live process resume its conversation.
    pub fn mark_queried(&self) {
        self.has_queried.store(true, Ordering::SeqCst);
    }

    pub fn session_id(&self) -> Option<SessionId> {
        *self.session_id.read()
    }

    pub fn set_session_id(&self, id: Option<SessionId>) {
        *self.session_id.write() = id;
    }

    pub fn state(&self) -> SandboxState {
        *self.state.read()
    }

    pub fn set_state(&self, state: SandboxState) {
        *self.state.write() = state;
    }

    pub fn last_used_at(&self) -> Instant {
        *self.last_used_at.read()
    }

    pub fn touch(&self) {
        *self.last_used_at.write() = Instant::now();
    }
}
