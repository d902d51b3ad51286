//! Shared data model, repository contracts, and error types for Ash.
//!
//! This crate has no opinion on transport or storage backend — it is the
//! vocabulary every other `ash-*` crate speaks. Nothing in here spawns a
//! process, opens a socket, or touches a database.

pub mod auth;
pub mod config;
pub mod error;
pub mod ids;
pub mod model;
pub mod repository;

pub use error::{ApiError, ApiResult};
pub use ids::{AgentId, RunnerId, SandboxId, SessionId, TenantId};
