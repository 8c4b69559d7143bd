//! Data models for the job store.
//!
//! Defines job records, lifecycle states, fetch error kinds, audit entries,
//! and queue statistics.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a fetch job.
///
/// `RetryWaiting` is the persisted form of a retryable failure: the job
/// holds a `next_retry_at` timestamp and is promoted back to `Pending` by
/// the maintenance loop once the backoff delay elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    RetryWaiting,
    Paused,
    Completed,      // terminal
    FailedTerminal, // terminal
    Cancelled,      // terminal
}

impl JobState {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::FailedTerminal | JobState::Cancelled
        )
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::RetryWaiting => "RETRY_WAITING",
            JobState::Paused => "PAUSED",
            JobState::Completed => "COMPLETED",
            JobState::FailedTerminal => "FAILED_TERMINAL",
            JobState::Cancelled => "CANCELLED",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobState::Pending),
            "RUNNING" => Some(JobState::Running),
            "RETRY_WAITING" => Some(JobState::RetryWaiting),
            "PAUSED" => Some(JobState::Paused),
            "COMPLETED" => Some(JobState::Completed),
            "FAILED_TERMINAL" => Some(JobState::FailedTerminal),
            "CANCELLED" => Some(JobState::Cancelled),
            _ => None,
        }
    }
}

/// Kind of error encountered while fetching content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    Connection,      // network error - retry
    Timeout,         // request or renewal timeout - retry
    Io,              // local I/O error - retry
    InvalidResource, // resource identifier rejected by the source - NO retry
    Gone,            // source says the content does not exist - NO retry
    Unknown,         // anything unclassified - retry
}

impl FetchErrorKind {
    /// Returns true if the error is transient and should consume a retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchErrorKind::InvalidResource | FetchErrorKind::Gone)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FetchErrorKind::Connection => "connection",
            FetchErrorKind::Timeout => "timeout",
            FetchErrorKind::Io => "io",
            FetchErrorKind::InvalidResource => "invalid_resource",
            FetchErrorKind::Gone => "gone",
            FetchErrorKind::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "connection" => Some(FetchErrorKind::Connection),
            "timeout" => Some(FetchErrorKind::Timeout),
            "io" => Some(FetchErrorKind::Io),
            "invalid_resource" => Some(FetchErrorKind::InvalidResource),
            "gone" => Some(FetchErrorKind::Gone),
            "unknown" => Some(FetchErrorKind::Unknown),
            _ => None,
        }
    }
}

/// A classified fetch failure: kind plus human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFailure {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchFailure {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Permanent failures skip the retry budget entirely.
    pub fn is_permanent(&self) -> bool {
        !self.kind.is_retryable()
    }
}

impl std::fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// Resume cursor plus integrity marker for a partially transferred artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Byte offset into the content stream.
    pub cursor: u64,
    /// Hex digest of the bytes persisted so far. Verified on resume; a
    /// mismatch restarts the transfer from zero rather than corrupting
    /// the artifact.
    pub digest: String,
}

/// A fetch job record.
///
/// Mutated only through the store's conditional-update paths: lifecycle
/// fields by the manager, checkpoint/progress fields by the worker holding
/// the claim.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Unique identifier (UUID), immutable.
    pub id: String,
    /// Resource identifier handed to the fetch capability, opaque here.
    pub resource: String,
    /// Processing priority, higher value first.
    pub priority: i32,
    /// Current lifecycle state.
    pub state: JobState,
    /// Number of completed execution attempts that ended in failure.
    pub attempt_count: i32,
    /// Attempts allowed before the job fails terminally.
    pub max_attempts: i32,
    /// When the job was submitted (Unix seconds).
    pub created_at: i64,
    /// Last mutation time (Unix seconds).
    pub updated_at: i64,
    /// When the first execution attempt began.
    pub started_at: Option<i64>,
    /// When the job reached a terminal state.
    pub completed_at: Option<i64>,
    /// Worker currently holding the claim, if any.
    pub claimed_by: Option<String>,
    /// Lease expiry (Unix seconds); a past value voids the claim.
    pub claim_expires_at: Option<i64>,
    /// Resume checkpoint, preserved across retries and pauses.
    pub checkpoint: Option<Checkpoint>,
    /// Bytes transferred so far.
    pub bytes_done: u64,
    /// When a retry-waiting job becomes eligible again.
    pub next_retry_at: Option<i64>,
    /// Last failure, populated on retryable and terminal failures alike.
    pub last_error: Option<FetchFailure>,
    /// Reference to the persisted artifact once completed.
    pub artifact_ref: Option<String>,
    /// Submitter-supplied options, opaque to the orchestrator.
    pub options: serde_json::Value,
    /// Identity of the submitter, if provided.
    pub requested_by: Option<String>,
}

impl Job {
    pub fn new(
        id: String,
        resource: String,
        priority: i32,
        max_attempts: i32,
        options: serde_json::Value,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id,
            resource,
            priority,
            state: JobState::Pending,
            attempt_count: 0,
            max_attempts,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            claimed_by: None,
            claim_expires_at: None,
            checkpoint: None,
            bytes_done: 0,
            next_retry_at: None,
            last_error: None,
            artifact_ref: None,
            options,
            requested_by: None,
        }
    }

    /// Set the submitter identity.
    pub fn with_requester(mut self, requested_by: impl Into<String>) -> Self {
        self.requested_by = Some(requested_by.into());
        self
    }

    /// Returns true if the claim lease has lapsed relative to `now`.
    pub fn claim_expired(&self, now: i64) -> bool {
        matches!(self.claim_expires_at, Some(expires) if expires < now)
    }

    /// Invariant check: a job is either unclaimed or claimed by exactly one
    /// worker, never half-claimed.
    pub fn claim_consistent(&self) -> bool {
        self.claimed_by.is_some() == self.claim_expires_at.is_some()
    }
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub requested_by: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl JobFilter {
    pub fn all() -> Self {
        Self {
            state: None,
            requested_by: None,
            limit: 100,
            offset: 0,
        }
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }
}

/// Counts of jobs by state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub retry_waiting: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed_terminal: usize,
    pub cancelled: usize,
}

impl QueueStats {
    /// Jobs that may still produce work.
    pub fn active(&self) -> usize {
        self.pending + self.running + self.retry_waiting + self.paused
    }
}

/// Type of audit event recorded for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    Submitted,
    Started,
    RetryScheduled,
    Completed,
    Failed,
    Cancelled,
    Paused,
    Resumed,
    Reclaimed,
    DeadLettered,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::Submitted => "SUBMITTED",
            AuditEventType::Started => "STARTED",
            AuditEventType::RetryScheduled => "RETRY_SCHEDULED",
            AuditEventType::Completed => "COMPLETED",
            AuditEventType::Failed => "FAILED",
            AuditEventType::Cancelled => "CANCELLED",
            AuditEventType::Paused => "PAUSED",
            AuditEventType::Resumed => "RESUMED",
            AuditEventType::Reclaimed => "RECLAIMED",
            AuditEventType::DeadLettered => "DEAD_LETTERED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "SUBMITTED" => Some(AuditEventType::Submitted),
            "STARTED" => Some(AuditEventType::Started),
            "RETRY_SCHEDULED" => Some(AuditEventType::RetryScheduled),
            "COMPLETED" => Some(AuditEventType::Completed),
            "FAILED" => Some(AuditEventType::Failed),
            "CANCELLED" => Some(AuditEventType::Cancelled),
            "PAUSED" => Some(AuditEventType::Paused),
            "RESUMED" => Some(AuditEventType::Resumed),
            "RECLAIMED" => Some(AuditEventType::Reclaimed),
            "DEAD_LETTERED" => Some(AuditEventType::DeadLettered),
            _ => None,
        }
    }
}

/// One audit log row: what happened to which job, when, and any context.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Assigned by the store on insert; 0 for new entries.
    pub id: i64,
    pub timestamp: i64,
    pub event_type: AuditEventType,
    pub job_id: String,
    pub worker_id: Option<String>,
    pub details: serde_json::Value,
}

impl AuditEntry {
    pub fn new(event_type: AuditEventType, job_id: impl Into<String>) -> Self {
        Self {
            id: 0,
            timestamp: chrono::Utc::now().timestamp(),
            event_type,
            job_id: job_id.into(),
            worker_id: None,
            details: serde_json::Value::Null,
        }
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Serializable job snapshot for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: String,
    pub resource: String,
    pub priority: i32,
    pub state: JobState,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub bytes_done: u64,
    pub checkpoint_cursor: Option<u64>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub next_retry_at: Option<i64>,
    pub last_error: Option<FetchFailure>,
    pub artifact_ref: Option<String>,
    /// 1-based position among pending jobs, present while pending.
    pub queue_position: Option<usize>,
}

impl JobSnapshot {
    pub fn from_job(job: &Job, queue_position: Option<usize>) -> Self {
        Self {
            id: job.id.clone(),
            resource: job.resource.clone(),
            priority: job.priority,
            state: job.state,
            attempt_count: job.attempt_count,
            max_attempts: job.max_attempts,
            bytes_done: job.bytes_done,
            checkpoint_cursor: job.checkpoint.as_ref().map(|c| c.cursor),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            next_retry_at: job.next_retry_at,
            last_error: job.last_error.clone(),
            artifact_ref: job.artifact_ref.clone(),
            queue_position,
        }
    }
}
