//! State management for statecraft.
//!
//! Durable, versioned key/value storage scoped by deployment and by
//! resource, with nested transactional semantics, plus the deployment lock
//! that serializes whole-deployment workflows.

mod attrs;
mod backend;
mod db;
mod lock;
mod schema;

pub use attrs::{Attrs, Field};
pub use backend::{LocalStateBackend, MemoryStateBackend, STATE_DIR, StateBackend};
pub use db::{StateDb, Transaction};
pub use lock::{DeploymentLock, LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use schema::{DeploymentRow, ResourceRow, SCHEMA_VERSION, Scope, Tables, migrate};
