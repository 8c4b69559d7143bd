//! Job queue storage and persistence.
//!
//! Provides SQLite-backed storage for job records, claim leases, and the
//! lifecycle audit log. All state transitions are conditional UPDATEs so
//! that the dequeue-and-claim path is atomic and a lapsed lease can never
//! be written through.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use super::models::*;
use super::schema::JOB_QUEUE_VERSIONED_SCHEMAS;
use crate::error::OrchestratorError;
use crate::sqlite_persistence::BASE_DB_VERSION;

type StoreResult<T> = Result<T, OrchestratorError>;

/// Trait for job queue storage operations.
///
/// The manager owns lifecycle transitions, workers own checkpoint and
/// progress writes under the claim they hold. Every mutating method is
/// atomic with respect to the job row.
pub trait JobStore: Send + Sync {
    // === Queue management ===

    /// Add a new job to the queue.
    fn enqueue(&self, job: Job) -> StoreResult<()>;

    /// Get a job by ID.
    fn get(&self, id: &str) -> StoreResult<Option<Job>>;

    /// Replace a job record wholesale. Fails with `NotFound` if absent.
    fn update(&self, job: &Job) -> StoreResult<()>;

    /// List jobs matching the filter, priority-descending then oldest-first.
    fn list(&self, filter: &JobFilter) -> StoreResult<Vec<Job>>;

    /// Get the 1-based queue position among pending jobs.
    fn queue_position(&self, id: &str) -> StoreResult<Option<usize>>;

    /// Counts of jobs by state.
    fn stats(&self) -> StoreResult<QueueStats>;

    // === Claim lease (atomic dequeue) ===

    /// Atomically pick the highest-priority pending job and claim it for
    /// `worker_id` with a lease of `lease_secs`. Two concurrent calls never
    /// return the same job.
    fn claim_next(&self, worker_id: &str, lease_secs: i64) -> StoreResult<Option<Job>>;

    /// Extend the lease on a running job. Fails with `ClaimExpired` if the
    /// worker no longer holds a live claim.
    fn renew_claim(&self, id: &str, worker_id: &str, lease_secs: i64) -> StoreResult<()>;

    /// Persist a resume checkpoint under a live claim.
    fn write_checkpoint(
        &self,
        id: &str,
        worker_id: &str,
        checkpoint: &Checkpoint,
        bytes_done: u64,
    ) -> StoreResult<()>;

    // === Lifecycle transitions ===

    /// Transition a running job to `Completed` under a live claim.
    fn mark_completed(
        &self,
        id: &str,
        worker_id: &str,
        artifact_ref: &str,
        bytes_done: u64,
    ) -> StoreResult<()>;

    /// Record a failed attempt and schedule a retry: increments the attempt
    /// count, releases the claim, keeps the checkpoint.
    fn mark_retry_waiting(
        &self,
        id: &str,
        worker_id: &str,
        next_retry_at: i64,
        failure: &FetchFailure,
    ) -> StoreResult<()>;

    /// Record a failed attempt as terminal: increments the attempt count,
    /// releases the claim.
    fn mark_failed_terminal(
        &self,
        id: &str,
        worker_id: &str,
        failure: &FetchFailure,
    ) -> StoreResult<()>;

    /// Cancel from any non-terminal state: releases the claim and discards
    /// the checkpoint. Returns false if the job was already terminal.
    fn cancel(&self, id: &str) -> StoreResult<bool>;

    /// Pause from `Pending`, `RetryWaiting`, or `Running`: releases the
    /// claim, preserves the checkpoint. Returns false if not in a pausable
    /// state.
    fn set_paused(&self, id: &str) -> StoreResult<bool>;

    /// Re-admit a paused job to the queue at its original priority.
    /// Returns false if the job is not paused.
    fn set_resumed(&self, id: &str) -> StoreResult<bool>;

    /// Return a claimed job to `Pending` without touching the attempt count
    /// (used when dispatch is deferred by an open circuit).
    fn release_to_pending(&self, id: &str, worker_id: &str) -> StoreResult<()>;

    // === Maintenance ===

    /// Promote retry-waiting jobs whose `next_retry_at` has passed back to
    /// `Pending`. Returns the promoted jobs.
    fn promote_due_retries(&self, now: i64) -> StoreResult<Vec<Job>>;

    /// Void lapsed claims: running jobs whose lease expired return to
    /// `Pending` with checkpoint preserved and no attempt-count penalty.
    /// Returns the reclaimed jobs as they were before the reclaim (so the
    /// previous holder is visible to callers).
    fn reclaim_expired(&self, now: i64) -> StoreResult<Vec<Job>>;

    // === Audit log ===

    /// Append an audit entry.
    fn log_audit_event(&self, entry: AuditEntry) -> StoreResult<()>;

    /// All audit entries for one job, oldest first.
    fn audit_for_job(&self, job_id: &str) -> StoreResult<Vec<AuditEntry>>;

    /// Delete audit entries older than the timestamp. Returns rows removed.
    fn prune_audit(&self, older_than: i64) -> StoreResult<usize>;
}

/// SQLite-backed job store.
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    /// Open an existing database or create a new one with the current schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> anyhow::Result<Self> {
        let conn = if db_path.as_ref().exists() {
            Connection::open_with_flags(
                &db_path,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        } else {
            let conn = Connection::open(&db_path)?;
            JOB_QUEUE_VERSIONED_SCHEMAS
                .last()
                .context("No schemas defined")?
                .create(&conn)?;
            info!("Created new job queue database at {:?}", db_path.as_ref());
            conn
        };

        let db_version = conn
            .query_row("PRAGMA user_version;", [], |row| row.get::<usize, i64>(0))
            .context("Failed to read database version")?
            - BASE_DB_VERSION as i64;

        if db_version < 0 {
            anyhow::bail!(
                "Job queue database version {} does not carry base version {}",
                db_version,
                BASE_DB_VERSION
            );
        }
        let version = db_version as usize;

        let schema_count = JOB_QUEUE_VERSIONED_SCHEMAS.len();
        if version >= schema_count {
            anyhow::bail!(
                "Job queue database version {} is too new (max supported: {})",
                version,
                schema_count - 1
            );
        }

        JOB_QUEUE_VERSIONED_SCHEMAS
            .get(version)
            .context("Failed to get schema")?
            .validate(&conn)?;

        Self::migrate_if_needed(&conn, version)?;

        Ok(SqliteJobStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store for testing.
    #[cfg(test)]
    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        JOB_QUEUE_VERSIONED_SCHEMAS
            .last()
            .context("No schemas defined")?
            .create(&conn)?;

        Ok(SqliteJobStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate_if_needed(conn: &Connection, current_version: usize) -> anyhow::Result<()> {
        let target_version = JOB_QUEUE_VERSIONED_SCHEMAS.len() - 1;

        if current_version >= target_version {
            return Ok(());
        }

        info!(
            "Migrating job queue database from version {} to {}",
            current_version, target_version
        );

        for schema in JOB_QUEUE_VERSIONED_SCHEMAS.iter().skip(current_version + 1) {
            if let Some(migration_fn) = schema.migration {
                info!("Running job queue migration to version {}", schema.version);
                migration_fn(conn)?;
            }
        }

        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + target_version),
            [],
        )?;

        Ok(())
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let checkpoint_cursor: Option<i64> = row.get("checkpoint_cursor")?;
        let checkpoint_digest: Option<String> = row.get("checkpoint_digest")?;
        let checkpoint = match (checkpoint_cursor, checkpoint_digest) {
            (Some(cursor), Some(digest)) => Some(Checkpoint {
                cursor: cursor as u64,
                digest,
            }),
            _ => None,
        };

        let error_kind: Option<String> = row.get("error_kind")?;
        let error_message: Option<String> = row.get("error_message")?;
        let last_error = match (error_kind.as_deref().and_then(FetchErrorKind::from_str), error_message) {
            (Some(kind), Some(message)) => Some(FetchFailure { kind, message }),
            _ => None,
        };

        let options: Option<String> = row.get("options")?;
        let options = options
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or(serde_json::Value::Null);

        Ok(Job {
            id: row.get("id")?,
            resource: row.get("resource")?,
            priority: row.get("priority")?,
            state: JobState::from_db_str(&row.get::<_, String>("state")?)
                .unwrap_or(JobState::Pending),
            attempt_count: row.get("attempt_count")?,
            max_attempts: row.get("max_attempts")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            claimed_by: row.get("claimed_by")?,
            claim_expires_at: row.get("claim_expires_at")?,
            checkpoint,
            bytes_done: row.get::<_, i64>("bytes_done")? as u64,
            next_retry_at: row.get("next_retry_at")?,
            last_error,
            artifact_ref: row.get("artifact_ref")?,
            options,
            requested_by: row.get("requested_by")?,
        })
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        // Lock poisoning only happens after a panic elsewhere; propagating
        // the panic is the right call for a store guard.
        self.conn.lock().unwrap()
    }
}

impl JobStore for SqliteJobStore {
    fn enqueue(&self, job: Job) -> StoreResult<()> {
        let options = match &job.options {
            serde_json::Value::Null => None,
            other => Some(serde_json::to_string(other)?),
        };
        let conn = self.lock_conn();
        conn.execute(
            r#"INSERT INTO jobs (
                id, resource, priority, state, attempt_count, max_attempts,
                created_at, updated_at, started_at, completed_at,
                claimed_by, claim_expires_at, checkpoint_cursor, checkpoint_digest,
                bytes_done, next_retry_at, error_kind, error_message,
                artifact_ref, options, requested_by
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21
            )"#,
            rusqlite::params![
                job.id,
                job.resource,
                job.priority,
                job.state.as_db_str(),
                job.attempt_count,
                job.max_attempts,
                job.created_at,
                job.updated_at,
                job.started_at,
                job.completed_at,
                job.claimed_by,
                job.claim_expires_at,
                job.checkpoint.as_ref().map(|c| c.cursor as i64),
                job.checkpoint.as_ref().map(|c| c.digest.clone()),
                job.bytes_done as i64,
                job.next_retry_at,
                job.last_error.as_ref().map(|e| e.kind.as_str()),
                job.last_error.as_ref().map(|e| e.message.clone()),
                job.artifact_ref,
                options,
                job.requested_by,
            ],
        )?;
        Ok(())
    }

    fn get(&self, id: &str) -> StoreResult<Option<Job>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare("SELECT * FROM jobs WHERE id = ?1")?;
        let job = stmt.query_row([id], Self::row_to_job).optional()?;
        Ok(job)
    }

    fn update(&self, job: &Job) -> StoreResult<()> {
        let options = match &job.options {
            serde_json::Value::Null => None,
            other => Some(serde_json::to_string(other)?),
        };
        let conn = self.lock_conn();
        let changed = conn.execute(
            r#"UPDATE jobs SET
                resource = ?2, priority = ?3, state = ?4, attempt_count = ?5,
                max_attempts = ?6, created_at = ?7, updated_at = ?8,
                started_at = ?9, completed_at = ?10, claimed_by = ?11,
                claim_expires_at = ?12, checkpoint_cursor = ?13,
                checkpoint_digest = ?14, bytes_done = ?15, next_retry_at = ?16,
                error_kind = ?17, error_message = ?18, artifact_ref = ?19,
                options = ?20, requested_by = ?21
               WHERE id = ?1"#,
            rusqlite::params![
                job.id,
                job.resource,
                job.priority,
                job.state.as_db_str(),
                job.attempt_count,
                job.max_attempts,
                job.created_at,
                Self::now(),
                job.started_at,
                job.completed_at,
                job.claimed_by,
                job.claim_expires_at,
                job.checkpoint.as_ref().map(|c| c.cursor as i64),
                job.checkpoint.as_ref().map(|c| c.digest.clone()),
                job.bytes_done as i64,
                job.next_retry_at,
                job.last_error.as_ref().map(|e| e.kind.as_str()),
                job.last_error.as_ref().map(|e| e.message.clone()),
                job.artifact_ref,
                options,
                job.requested_by,
            ],
        )?;
        if changed == 0 {
            return Err(OrchestratorError::NotFound(job.id.clone()));
        }
        Ok(())
    }

    fn list(&self, filter: &JobFilter) -> StoreResult<Vec<Job>> {
        let conn = self.lock_conn();

        let mut sql = String::from("SELECT * FROM jobs");
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(state) = filter.state {
            params.push(Box::new(state.as_db_str().to_string()));
            clauses.push(format!("state = ?{}", params.len()));
        }
        if let Some(requested_by) = &filter.requested_by {
            params.push(Box::new(requested_by.clone()));
            clauses.push(format!("requested_by = ?{}", params.len()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY priority DESC, created_at ASC");
        params.push(Box::new(filter.limit as i64));
        sql.push_str(&format!(" LIMIT ?{}", params.len()));
        params.push(Box::new(filter.offset as i64));
        sql.push_str(&format!(" OFFSET ?{}", params.len()));

        let mut stmt = conn.prepare(&sql)?;
        let params_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let jobs = stmt
            .query_map(params_refs.as_slice(), Self::row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(jobs)
    }

    fn queue_position(&self, id: &str) -> StoreResult<Option<usize>> {
        let conn = self.lock_conn();

        let row: Option<(String, i32, i64)> = conn
            .query_row(
                "SELECT state, priority, created_at FROM jobs WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((state, _, _)) if state != "PENDING" => Ok(None),
            Some((_, priority, created_at)) => {
                // Items ahead: strictly higher priority, or same priority but older
                let position: i64 = conn.query_row(
                    r#"SELECT COUNT(*) + 1 FROM jobs
                       WHERE state = 'PENDING'
                       AND (priority > ?1 OR (priority = ?1 AND created_at < ?2))"#,
                    rusqlite::params![priority, created_at],
                    |row| row.get(0),
                )?;
                Ok(Some(position as usize))
            }
        }
    }

    fn stats(&self) -> StoreResult<QueueStats> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")?;
        let mut stats = QueueStats::default();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
        })?;
        for row in rows {
            let (state, count) = row?;
            match JobState::from_db_str(&state) {
                Some(JobState::Pending) => stats.pending = count,
                Some(JobState::Running) => stats.running = count,
                Some(JobState::RetryWaiting) => stats.retry_waiting = count,
                Some(JobState::Paused) => stats.paused = count,
                Some(JobState::Completed) => stats.completed = count,
                Some(JobState::FailedTerminal) => stats.failed_terminal = count,
                Some(JobState::Cancelled) => stats.cancelled = count,
                None => {}
            }
        }
        Ok(stats)
    }

    fn claim_next(&self, worker_id: &str, lease_secs: i64) -> StoreResult<Option<Job>> {
        let conn = self.lock_conn();
        let now = Self::now();

        loop {
            let candidate: Option<String> = conn
                .query_row(
                    r#"SELECT id FROM jobs
                       WHERE state = 'PENDING' AND claimed_by IS NULL
                       ORDER BY priority DESC, created_at ASC
                       LIMIT 1"#,
                    [],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(id) = candidate else {
                return Ok(None);
            };

            // The WHERE repeats the preconditions so the claim is atomic
            // even across processes sharing the database file.
            let changed = conn.execute(
                r#"UPDATE jobs SET
                    state = 'RUNNING',
                    claimed_by = ?2,
                    claim_expires_at = ?3,
                    started_at = COALESCE(started_at, ?4),
                    updated_at = ?4
                   WHERE id = ?1 AND state = 'PENDING' AND claimed_by IS NULL"#,
                rusqlite::params![id, worker_id, now + lease_secs, now],
            )?;

            if changed == 1 {
                let mut stmt = conn.prepare("SELECT * FROM jobs WHERE id = ?1")?;
                let job = stmt.query_row([id.as_str()], Self::row_to_job)?;
                return Ok(Some(job));
            }
            // Lost the race to another process, pick again
        }
    }

    fn renew_claim(&self, id: &str, worker_id: &str, lease_secs: i64) -> StoreResult<()> {
        let conn = self.lock_conn();
        let now = Self::now();
        let changed = conn.execute(
            r#"UPDATE jobs SET claim_expires_at = ?3, updated_at = ?4
               WHERE id = ?1 AND claimed_by = ?2 AND state = 'RUNNING'
                 AND claim_expires_at >= ?4"#,
            rusqlite::params![id, worker_id, now + lease_secs, now],
        )?;
        if changed == 0 {
            return Err(OrchestratorError::ClaimExpired(id.to_string()));
        }
        Ok(())
    }

    fn write_checkpoint(
        &self,
        id: &str,
        worker_id: &str,
        checkpoint: &Checkpoint,
        bytes_done: u64,
    ) -> StoreResult<()> {
        let conn = self.lock_conn();
        let now = Self::now();
        let changed = conn.execute(
            r#"UPDATE jobs SET
                checkpoint_cursor = ?3, checkpoint_digest = ?4,
                bytes_done = ?5, updated_at = ?6
               WHERE id = ?1 AND claimed_by = ?2 AND state = 'RUNNING'
                 AND claim_expires_at >= ?6"#,
            rusqlite::params![
                id,
                worker_id,
                checkpoint.cursor as i64,
                checkpoint.digest,
                bytes_done as i64,
                now
            ],
        )?;
        if changed == 0 {
            return Err(OrchestratorError::ClaimExpired(id.to_string()));
        }
        Ok(())
    }

    fn mark_completed(
        &self,
        id: &str,
        worker_id: &str,
        artifact_ref: &str,
        bytes_done: u64,
    ) -> StoreResult<()> {
        let conn = self.lock_conn();
        let now = Self::now();
        let changed = conn.execute(
            r#"UPDATE jobs SET
                state = 'COMPLETED', artifact_ref = ?3, bytes_done = ?4,
                completed_at = ?5, updated_at = ?5,
                claimed_by = NULL, claim_expires_at = NULL,
                checkpoint_cursor = NULL, checkpoint_digest = NULL
               WHERE id = ?1 AND claimed_by = ?2 AND state = 'RUNNING'
                 AND claim_expires_at >= ?5"#,
            rusqlite::params![id, worker_id, artifact_ref, bytes_done as i64, now],
        )?;
        if changed == 0 {
            return Err(OrchestratorError::ClaimExpired(id.to_string()));
        }
        Ok(())
    }

    fn mark_retry_waiting(
        &self,
        id: &str,
        worker_id: &str,
        next_retry_at: i64,
        failure: &FetchFailure,
    ) -> StoreResult<()> {
        let conn = self.lock_conn();
        let now = Self::now();
        let changed = conn.execute(
            r#"UPDATE jobs SET
                state = 'RETRY_WAITING', attempt_count = attempt_count + 1,
                next_retry_at = ?3, error_kind = ?4, error_message = ?5,
                claimed_by = NULL, claim_expires_at = NULL, updated_at = ?6
               WHERE id = ?1 AND claimed_by = ?2 AND state = 'RUNNING'"#,
            rusqlite::params![
                id,
                worker_id,
                next_retry_at,
                failure.kind.as_str(),
                failure.message,
                now
            ],
        )?;
        if changed == 0 {
            return Err(OrchestratorError::ClaimExpired(id.to_string()));
        }
        Ok(())
    }

    fn mark_failed_terminal(
        &self,
        id: &str,
        worker_id: &str,
        failure: &FetchFailure,
    ) -> StoreResult<()> {
        let conn = self.lock_conn();
        let now = Self::now();
        let changed = conn.execute(
            r#"UPDATE jobs SET
                state = 'FAILED_TERMINAL', attempt_count = attempt_count + 1,
                error_kind = ?3, error_message = ?4, completed_at = ?5,
                claimed_by = NULL, claim_expires_at = NULL,
                next_retry_at = NULL, updated_at = ?5
               WHERE id = ?1 AND claimed_by = ?2 AND state = 'RUNNING'"#,
            rusqlite::params![id, worker_id, failure.kind.as_str(), failure.message, now],
        )?;
        if changed == 0 {
            return Err(OrchestratorError::ClaimExpired(id.to_string()));
        }
        Ok(())
    }

    fn cancel(&self, id: &str) -> StoreResult<bool> {
        let conn = self.lock_conn();
        let now = Self::now();
        let changed = conn.execute(
            r#"UPDATE jobs SET
                state = 'CANCELLED', completed_at = ?2, updated_at = ?2,
                claimed_by = NULL, claim_expires_at = NULL,
                next_retry_at = NULL,
                checkpoint_cursor = NULL, checkpoint_digest = NULL
               WHERE id = ?1
                 AND state IN ('PENDING', 'RUNNING', 'RETRY_WAITING', 'PAUSED')"#,
            rusqlite::params![id, now],
        )?;
        Ok(changed == 1)
    }

    fn set_paused(&self, id: &str) -> StoreResult<bool> {
        let conn = self.lock_conn();
        let now = Self::now();
        let changed = conn.execute(
            r#"UPDATE jobs SET
                state = 'PAUSED', updated_at = ?2,
                claimed_by = NULL, claim_expires_at = NULL,
                next_retry_at = NULL
               WHERE id = ?1 AND state IN ('PENDING', 'RUNNING', 'RETRY_WAITING')"#,
            rusqlite::params![id, now],
        )?;
        Ok(changed == 1)
    }

    fn set_resumed(&self, id: &str) -> StoreResult<bool> {
        let conn = self.lock_conn();
        let now = Self::now();
        let changed = conn.execute(
            r#"UPDATE jobs SET state = 'PENDING', updated_at = ?2
               WHERE id = ?1 AND state = 'PAUSED'"#,
            rusqlite::params![id, now],
        )?;
        Ok(changed == 1)
    }

    fn release_to_pending(&self, id: &str, worker_id: &str) -> StoreResult<()> {
        let conn = self.lock_conn();
        let now = Self::now();
        let changed = conn.execute(
            r#"UPDATE jobs SET
                state = 'PENDING', updated_at = ?3,
                claimed_by = NULL, claim_expires_at = NULL
               WHERE id = ?1 AND claimed_by = ?2 AND state = 'RUNNING'"#,
            rusqlite::params![id, worker_id, now],
        )?;
        if changed == 0 {
            return Err(OrchestratorError::ClaimExpired(id.to_string()));
        }
        Ok(())
    }

    fn promote_due_retries(&self, now: i64) -> StoreResult<Vec<Job>> {
        let conn = self.lock_conn();

        let due: Vec<String> = conn
            .prepare(
                r#"SELECT id FROM jobs
                   WHERE state = 'RETRY_WAITING' AND next_retry_at <= ?1
                   ORDER BY next_retry_at ASC"#,
            )?
            .query_map([now], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut promoted = Vec::with_capacity(due.len());
        for id in due {
            let changed = conn.execute(
                r#"UPDATE jobs SET
                    state = 'PENDING', next_retry_at = NULL, updated_at = ?2
                   WHERE id = ?1 AND state = 'RETRY_WAITING'"#,
                rusqlite::params![id, now],
            )?;
            if changed == 1 {
                let mut stmt = conn.prepare("SELECT * FROM jobs WHERE id = ?1")?;
                promoted.push(stmt.query_row([id.as_str()], Self::row_to_job)?);
            }
        }
        Ok(promoted)
    }

    fn reclaim_expired(&self, now: i64) -> StoreResult<Vec<Job>> {
        let conn = self.lock_conn();

        let mut stmt = conn.prepare(
            r#"SELECT * FROM jobs
               WHERE state = 'RUNNING' AND claim_expires_at < ?1"#,
        )?;
        let stale = stmt
            .query_map([now], Self::row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        let mut reclaimed = Vec::with_capacity(stale.len());
        for job in stale {
            // Conditional on the same expiry so a concurrent renewal wins
            let changed = conn.execute(
                r#"UPDATE jobs SET
                    state = 'PENDING', updated_at = ?2,
                    claimed_by = NULL, claim_expires_at = NULL
                   WHERE id = ?1 AND state = 'RUNNING' AND claim_expires_at < ?2"#,
                rusqlite::params![job.id, now],
            )?;
            if changed == 1 {
                reclaimed.push(job);
            }
        }
        Ok(reclaimed)
    }

    fn log_audit_event(&self, entry: AuditEntry) -> StoreResult<()> {
        let details = match &entry.details {
            serde_json::Value::Null => None,
            other => Some(serde_json::to_string(other)?),
        };
        let conn = self.lock_conn();
        conn.execute(
            r#"INSERT INTO job_audit_log (timestamp, event_type, job_id, worker_id, details)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
            rusqlite::params![
                entry.timestamp,
                entry.event_type.as_str(),
                entry.job_id,
                entry.worker_id,
                details,
            ],
        )?;
        Ok(())
    }

    fn audit_for_job(&self, job_id: &str) -> StoreResult<Vec<AuditEntry>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            r#"SELECT id, timestamp, event_type, job_id, worker_id, details
               FROM job_audit_log WHERE job_id = ?1 ORDER BY id ASC"#,
        )?;
        let entries = stmt
            .query_map([job_id], |row| {
                let details: Option<String> = row.get(5)?;
                Ok(AuditEntry {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    event_type: AuditEventType::from_str(&row.get::<_, String>(2)?)
                        .unwrap_or(AuditEventType::Submitted),
                    job_id: row.get(3)?,
                    worker_id: row.get(4)?,
                    details: details
                        .as_deref()
                        .and_then(|s| serde_json::from_str(s).ok())
                        .unwrap_or(serde_json::Value::Null),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn prune_audit(&self, older_than: i64) -> StoreResult<usize> {
        let conn = self.lock_conn();
        let removed = conn.execute(
            "DELETE FROM job_audit_log WHERE timestamp < ?1",
            [older_than],
        )?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_job(id: &str, priority: i32) -> Job {
        Job::new(
            id.to_string(),
            format!("content://{}", id),
            priority,
            3,
            serde_json::Value::Null,
        )
    }

    #[test]
    fn test_enqueue_and_get_roundtrip() {
        let store = SqliteJobStore::in_memory().unwrap();

        let mut job = test_job("job-1", 5).with_requester("user-1");
        job.options = serde_json::json!({"audio_only": true, "quality": "high"});
        job.checkpoint = Some(Checkpoint {
            cursor: 1024,
            digest: "abcd".to_string(),
        });
        job.bytes_done = 1024;
        job.last_error = Some(FetchFailure::new(FetchErrorKind::Timeout, "slow source"));

        store.enqueue(job.clone()).unwrap();

        let loaded = store.get("job-1").unwrap().expect("job should exist");
        // Full record round-trip, no field loss
        assert_eq!(loaded, job);
    }

    #[test]
    fn test_get_missing_returns_none() {
        let store = SqliteJobStore::in_memory().unwrap();
        assert!(store.get("nope").unwrap().is_none());
    }

    #[test]
    fn test_update_missing_is_not_found() {
        let store = SqliteJobStore::in_memory().unwrap();
        let job = test_job("ghost", 1);
        match store.update(&job) {
            Err(OrchestratorError::NotFound(id)) => assert_eq!(id, "ghost"),
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_claim_order_priority_then_age() {
        let store = SqliteJobStore::in_memory().unwrap();

        let mut a = test_job("a", 5);
        a.created_at = 1000;
        let mut b = test_job("b", 10);
        b.created_at = 2000;
        let mut c = test_job("c", 10);
        c.created_at = 1500; // same priority as b, created earlier

        store.enqueue(a).unwrap();
        store.enqueue(b).unwrap();
        store.enqueue(c).unwrap();

        // Equal priority ties break by earliest creation: c, b, a
        let first = store.claim_next("w1", 60).unwrap().unwrap();
        assert_eq!(first.id, "c");
        let second = store.claim_next("w1", 60).unwrap().unwrap();
        assert_eq!(second.id, "b");
        let third = store.claim_next("w1", 60).unwrap().unwrap();
        assert_eq!(third.id, "a");
        assert!(store.claim_next("w1", 60).unwrap().is_none());
    }

    #[test]
    fn test_claim_marks_running_with_lease() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.enqueue(test_job("job-1", 1)).unwrap();

        let claimed = store.claim_next("worker-1", 30).unwrap().unwrap();
        assert_eq!(claimed.state, JobState::Running);
        assert_eq!(claimed.claimed_by.as_deref(), Some("worker-1"));
        assert!(claimed.claim_expires_at.unwrap() > chrono::Utc::now().timestamp());
        assert!(claimed.started_at.is_some());
        assert!(claimed.claim_consistent());
    }

    #[test]
    fn test_concurrent_claims_never_share_a_job() {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        for i in 0..20 {
            store.enqueue(test_job(&format!("job-{}", i), 1)).unwrap();
        }

        let mut handles = Vec::new();
        for w in 0..4 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                let worker = format!("worker-{}", w);
                let mut claimed = Vec::new();
                while let Some(job) = store.claim_next(&worker, 60).unwrap() {
                    claimed.push(job.id);
                }
                claimed
            }));
        }

        let mut all: Vec<String> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        let total = all.len();
        all.dedup();
        assert_eq!(total, 20, "every job claimed exactly once");
        assert_eq!(all.len(), 20, "no job claimed twice");
    }

    #[test]
    fn test_renew_claim_extends_lease() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.enqueue(test_job("job-1", 1)).unwrap();
        let claimed = store.claim_next("worker-1", 30).unwrap().unwrap();
        let first_expiry = claimed.claim_expires_at.unwrap();

        store.renew_claim("job-1", "worker-1", 120).unwrap();
        let renewed = store.get("job-1").unwrap().unwrap();
        assert!(renewed.claim_expires_at.unwrap() >= first_expiry);
    }

    #[test]
    fn test_renew_claim_by_other_worker_fails() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.enqueue(test_job("job-1", 1)).unwrap();
        store.claim_next("worker-1", 30).unwrap().unwrap();

        match store.renew_claim("job-1", "worker-2", 30) {
            Err(OrchestratorError::ClaimExpired(_)) => {}
            other => panic!("expected ClaimExpired, got {:?}", other),
        }
    }

    #[test]
    fn test_checkpoint_write_requires_live_claim() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.enqueue(test_job("job-1", 1)).unwrap();
        store.claim_next("worker-1", 30).unwrap().unwrap();

        let cp = Checkpoint {
            cursor: 2048,
            digest: "beef".to_string(),
        };
        store
            .write_checkpoint("job-1", "worker-1", &cp, 2048)
            .unwrap();

        let job = store.get("job-1").unwrap().unwrap();
        assert_eq!(job.checkpoint, Some(cp.clone()));
        assert_eq!(job.bytes_done, 2048);

        // A worker that does not hold the claim cannot write
        match store.write_checkpoint("job-1", "worker-2", &cp, 4096) {
            Err(OrchestratorError::ClaimExpired(_)) => {}
            other => panic!("expected ClaimExpired, got {:?}", other),
        }
    }

    #[test]
    fn test_mark_completed_clears_claim_and_checkpoint() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.enqueue(test_job("job-1", 1)).unwrap();
        store.claim_next("worker-1", 30).unwrap().unwrap();
        let cp = Checkpoint {
            cursor: 10,
            digest: "aa".to_string(),
        };
        store.write_checkpoint("job-1", "worker-1", &cp, 10).unwrap();

        store
            .mark_completed("job-1", "worker-1", "artifacts/job-1", 4096)
            .unwrap();

        let job = store.get("job-1").unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.artifact_ref.as_deref(), Some("artifacts/job-1"));
        assert_eq!(job.bytes_done, 4096);
        assert!(job.claimed_by.is_none());
        assert!(job.checkpoint.is_none());
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn test_mark_retry_waiting_increments_attempts_keeps_checkpoint() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.enqueue(test_job("job-1", 1)).unwrap();
        store.claim_next("worker-1", 30).unwrap().unwrap();
        let cp = Checkpoint {
            cursor: 512,
            digest: "1234".to_string(),
        };
        store.write_checkpoint("job-1", "worker-1", &cp, 512).unwrap();

        let failure = FetchFailure::new(FetchErrorKind::Connection, "reset by peer");
        let retry_at = chrono::Utc::now().timestamp() + 60;
        store
            .mark_retry_waiting("job-1", "worker-1", retry_at, &failure)
            .unwrap();

        let job = store.get("job-1").unwrap().unwrap();
        assert_eq!(job.state, JobState::RetryWaiting);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.next_retry_at, Some(retry_at));
        assert_eq!(job.checkpoint, Some(cp), "checkpoint survives failure");
        assert!(job.claimed_by.is_none());
        assert_eq!(job.last_error, Some(failure));
    }

    #[test]
    fn test_mark_failed_terminal() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.enqueue(test_job("job-1", 1)).unwrap();
        store.claim_next("worker-1", 30).unwrap().unwrap();

        let failure = FetchFailure::new(FetchErrorKind::Gone, "410");
        store
            .mark_failed_terminal("job-1", "worker-1", &failure)
            .unwrap();

        let job = store.get("job-1").unwrap().unwrap();
        assert_eq!(job.state, JobState::FailedTerminal);
        assert_eq!(job.attempt_count, 1);
        assert!(job.completed_at.is_some());
        assert!(job.claimed_by.is_none());
    }

    #[test]
    fn test_cancel_discards_checkpoint() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.enqueue(test_job("job-1", 1)).unwrap();
        store.claim_next("worker-1", 30).unwrap().unwrap();
        let cp = Checkpoint {
            cursor: 99,
            digest: "ff".to_string(),
        };
        store.write_checkpoint("job-1", "worker-1", &cp, 99).unwrap();

        assert!(store.cancel("job-1").unwrap());

        let job = store.get("job-1").unwrap().unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert!(job.checkpoint.is_none());
        assert!(job.claimed_by.is_none());

        // Cancelling a terminal job is a no-op
        assert!(!store.cancel("job-1").unwrap());
    }

    #[test]
    fn test_pause_preserves_checkpoint_and_resume_requeues() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.enqueue(test_job("job-1", 7)).unwrap();
        store.claim_next("worker-1", 30).unwrap().unwrap();
        let cp = Checkpoint {
            cursor: 42,
            digest: "0x2a".to_string(),
        };
        store.write_checkpoint("job-1", "worker-1", &cp, 42).unwrap();

        assert!(store.set_paused("job-1").unwrap());
        let paused = store.get("job-1").unwrap().unwrap();
        assert_eq!(paused.state, JobState::Paused);
        assert_eq!(paused.checkpoint, Some(cp));
        assert!(paused.claimed_by.is_none());

        // A paused job is not claimable
        assert!(store.claim_next("worker-2", 30).unwrap().is_none());

        assert!(store.set_resumed("job-1").unwrap());
        let resumed = store.get("job-1").unwrap().unwrap();
        assert_eq!(resumed.state, JobState::Pending);
        assert_eq!(resumed.priority, 7, "original priority retained");

        // Resume on a non-paused job is a no-op
        assert!(!store.set_resumed("job-1").unwrap());
    }

    #[test]
    fn test_promote_due_retries() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.enqueue(test_job("due", 1)).unwrap();
        store.enqueue(test_job("later", 1)).unwrap();

        let now = chrono::Utc::now().timestamp();
        let failure = FetchFailure::new(FetchErrorKind::Timeout, "t");

        let due = store.claim_next("w", 30).unwrap().unwrap();
        store
            .mark_retry_waiting(&due.id, "w", now - 5, &failure)
            .unwrap();
        let later = store.claim_next("w", 30).unwrap().unwrap();
        store
            .mark_retry_waiting(&later.id, "w", now + 600, &failure)
            .unwrap();

        let promoted = store.promote_due_retries(now).unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].state, JobState::Pending);
        assert!(promoted[0].next_retry_at.is_none());

        let still_waiting = store.get(&later.id).unwrap().unwrap();
        assert_eq!(still_waiting.state, JobState::RetryWaiting);
    }

    #[test]
    fn test_reclaim_expired_returns_previous_holder() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.enqueue(test_job("job-1", 1)).unwrap();

        // Lease of -1 seconds is already lapsed
        store.claim_next("worker-1", -1).unwrap().unwrap();
        let cp = Checkpoint {
            cursor: 777,
            digest: "dd".to_string(),
        };
        // Checkpoint write must fail against a lapsed lease
        assert!(store.write_checkpoint("job-1", "worker-1", &cp, 777).is_err());

        let now = chrono::Utc::now().timestamp();
        let reclaimed = store.reclaim_expired(now).unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].claimed_by.as_deref(), Some("worker-1"));

        let job = store.get("job-1").unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert!(job.claimed_by.is_none());
        assert_eq!(job.attempt_count, 0, "no attempt penalty for a crash");

        // Reclaimed job is claimable again
        let again = store.claim_next("worker-2", 60).unwrap().unwrap();
        assert_eq!(again.id, "job-1");
    }

    #[test]
    fn test_reclaim_ignores_live_claims() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.enqueue(test_job("job-1", 1)).unwrap();
        store.claim_next("worker-1", 3600).unwrap().unwrap();

        let reclaimed = store
            .reclaim_expired(chrono::Utc::now().timestamp())
            .unwrap();
        assert!(reclaimed.is_empty());
    }

    #[test]
    fn test_release_to_pending_keeps_attempts() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.enqueue(test_job("job-1", 1)).unwrap();
        store.claim_next("worker-1", 60).unwrap().unwrap();

        store.release_to_pending("job-1", "worker-1").unwrap();

        let job = store.get("job-1").unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempt_count, 0);
        assert!(job.claimed_by.is_none());
    }

    #[test]
    fn test_list_with_filters() {
        let store = SqliteJobStore::in_memory().unwrap();
        store
            .enqueue(test_job("a", 1).with_requester("user-1"))
            .unwrap();
        store
            .enqueue(test_job("b", 2).with_requester("user-2"))
            .unwrap();
        store.enqueue(test_job("c", 3)).unwrap();

        let all = store.list(&JobFilter::all()).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, "c", "highest priority first");

        let pending = store
            .list(&JobFilter::all().with_state(JobState::Pending))
            .unwrap();
        assert_eq!(pending.len(), 3);

        let mine = store
            .list(&JobFilter {
                requested_by: Some("user-1".to_string()),
                ..JobFilter::all()
            })
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, "a");
    }

    #[test]
    fn test_queue_position() {
        let store = SqliteJobStore::in_memory().unwrap();
        let mut high = test_job("high", 10);
        high.created_at = 1000;
        let mut mid = test_job("mid", 5);
        mid.created_at = 2000;
        let mut low = test_job("low", 1);
        low.created_at = 3000;

        store.enqueue(low).unwrap();
        store.enqueue(mid).unwrap();
        store.enqueue(high).unwrap();

        assert_eq!(store.queue_position("high").unwrap(), Some(1));
        assert_eq!(store.queue_position("mid").unwrap(), Some(2));
        assert_eq!(store.queue_position("low").unwrap(), Some(3));
        assert_eq!(store.queue_position("nope").unwrap(), None);

        store.claim_next("w", 60).unwrap();
        assert_eq!(store.queue_position("high").unwrap(), None);
    }

    #[test]
    fn test_stats_counts_by_state() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.enqueue(test_job("a", 1)).unwrap();
        store.enqueue(test_job("b", 1)).unwrap();
        store.claim_next("w", 60).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.active(), 2);
    }

    #[test]
    fn test_audit_log_roundtrip_and_prune() {
        let store = SqliteJobStore::in_memory().unwrap();

        let mut old = AuditEntry::new(AuditEventType::Submitted, "job-1")
            .with_details(serde_json::json!({"priority": 5}));
        old.timestamp = 1000;
        store.log_audit_event(old).unwrap();
        store
            .log_audit_event(
                AuditEntry::new(AuditEventType::Started, "job-1").with_worker("worker-1"),
            )
            .unwrap();
        store
            .log_audit_event(AuditEntry::new(AuditEventType::Submitted, "job-2"))
            .unwrap();

        let entries = store.audit_for_job("job-1").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event_type, AuditEventType::Submitted);
        assert_eq!(entries[0].details["priority"], 5);
        assert_eq!(entries[1].worker_id.as_deref(), Some("worker-1"));

        let removed = store.prune_audit(2000).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.audit_for_job("job-1").unwrap().len(), 1);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("jobs.db");

        {
            let store = SqliteJobStore::new(&db_path).unwrap();
            let mut job = test_job("job-1", 5);
            job.checkpoint = Some(Checkpoint {
                cursor: 123,
                digest: "ee".to_string(),
            });
            store.enqueue(job).unwrap();
        }

        let store = SqliteJobStore::new(&db_path).unwrap();
        let job = store.get("job-1").unwrap().expect("job survives restart");
        assert_eq!(job.checkpoint.unwrap().cursor, 123);
    }
}
