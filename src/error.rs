//! Error taxonomy shared across the orchestrator.
//!
//! Recoverable conditions (transient fetch errors, claim expiry, open
//! circuits) are handled internally via re-queue and backoff; only terminal
//! conditions and caller mistakes surface through these variants.

use crate::job_store::JobState;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Bad submission input, rejected synchronously; no job is created.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The referenced job does not exist in the store.
    #[error("job not found: {0}")]
    NotFound(String),

    /// The requested operation is not legal from the job's current state.
    #[error("job {job_id} is {state:?}, cannot {operation}")]
    InvalidTransition {
        job_id: String,
        state: JobState,
        operation: &'static str,
    },

    /// The worker no longer holds a valid claim on the job.
    #[error("claim on job {0} expired or is held elsewhere")]
    ClaimExpired(String),

    /// Dispatch deferred because the dependency's circuit is open.
    #[error("circuit open for dependency {0}")]
    CircuitOpen(String),

    /// Queue store I/O failure; job state is unchanged until the store recovers.
    #[error("queue store unavailable: {0}")]
    StorageUnavailable(String),
}

impl From<rusqlite::Error> for OrchestratorError {
    fn from(e: rusqlite::Error) -> Self {
        OrchestratorError::StorageUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        OrchestratorError::StorageUnavailable(format!("record serialization: {}", e))
    }
}
