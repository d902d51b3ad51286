//! Sandbox Pool: the authoritative lifecycle state machine over sandboxes,
//! sitting above `ash-sandbox`'s process management and `ash-core`'s
//! repository.

pub mod entry;
pub mod hooks;
pub mod pool;

pub use entry::LiveEntry;
pub use hooks::{EvictionHooks, NoopEvictionHooks, NoopRestoreHook, RestoreHook};
pub use pool::{Pool, PoolConfig, SpawnArgs};
