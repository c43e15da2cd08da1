//! Postgres-backed advisory lock for cross-service setup steps (migrations
//! and similar one-at-a-time work). The broker's message delivery path
//! does not depend on this crate; it exists for callers that need a
//! best-effort "only one instance does this" guarantee.

pub mod error;
pub mod repository;

pub use repository::{LockRepository, PgLockRepository};
