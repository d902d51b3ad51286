//! Coordinator/Runner registration, health tracking, and request routing —
//! the multi-node half of Ash. A coordinator-mode `ash-server` process holds
//! one [`Coordinator`], proxying every session operation to whichever runner
//! owns that session's sandbox.

pub mod coordinator;
pub mod error;
pub mod proxy;

pub use coordinator::{Coordinator, CoordinatorConfig};
pub use error::CoordinatorError;
