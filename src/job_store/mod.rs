//! Durable job queue store.
//!
//! Persists job records, priority ordering, claim leases, and the lifecycle
//! audit trail in SQLite. Survives process restart; all writes are
//! per-record atomic.

mod models;
mod schema;
mod store;

pub use models::*;
pub use schema::JOB_QUEUE_VERSIONED_SCHEMAS;
pub use store::{JobStore, SqliteJobStore};
