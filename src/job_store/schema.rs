//! Database schema for jobs.db.
//!
//! Defines versioned schema migrations for the job queue database.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

/// Main job queue table.
///
/// The claim lease lives in the job row (`claimed_by` + `claim_expires_at`)
/// so that claim acquisition and renewal are single conditional UPDATEs.
const JOBS_TABLE_V1: Table = Table {
    name: "jobs",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("resource", &SqlType::Text, non_null = true),
        sqlite_column!("priority", &SqlType::Integer, non_null = true),
        sqlite_column!("state", &SqlType::Text, non_null = true),
        sqlite_column!("attempt_count", &SqlType::Integer, default_value = Some("0")),
        sqlite_column!("max_attempts", &SqlType::Integer, default_value = Some("8")),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
        sqlite_column!("started_at", &SqlType::Integer),
        sqlite_column!("completed_at", &SqlType::Integer),
        sqlite_column!("claimed_by", &SqlType::Text),
        sqlite_column!("claim_expires_at", &SqlType::Integer),
        sqlite_column!("checkpoint_cursor", &SqlType::Integer),
        sqlite_column!("checkpoint_digest", &SqlType::Text),
        sqlite_column!("bytes_done", &SqlType::Integer, default_value = Some("0")),
        sqlite_column!("next_retry_at", &SqlType::Integer),
        sqlite_column!("error_kind", &SqlType::Text),
        sqlite_column!("error_message", &SqlType::Text),
        sqlite_column!("artifact_ref", &SqlType::Text),
        sqlite_column!("options", &SqlType::Text),
        sqlite_column!("requested_by", &SqlType::Text),
    ],
    indices: &[
        ("idx_jobs_state_priority", "state, priority, created_at"),
        ("idx_jobs_next_retry", "next_retry_at"),
        ("idx_jobs_claim_expiry", "claim_expires_at"),
        ("idx_jobs_requested_by", "requested_by"),
    ],
};

/// Lifecycle audit trail, pruned by retention setting.
const JOB_AUDIT_LOG_TABLE_V1: Table = Table {
    name: "job_audit_log",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("timestamp", &SqlType::Integer, non_null = true),
        sqlite_column!("event_type", &SqlType::Text, non_null = true),
        sqlite_column!("job_id", &SqlType::Text, non_null = true),
        sqlite_column!("worker_id", &SqlType::Text),
        sqlite_column!("details", &SqlType::Text),
    ],
    indices: &[
        ("idx_audit_timestamp", "timestamp"),
        ("idx_audit_job", "job_id"),
        ("idx_audit_event_type", "event_type"),
    ],
};

pub const JOB_QUEUE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[JOBS_TABLE_V1, JOB_AUDIT_LOG_TABLE_V1],
    migration: None,
}];
