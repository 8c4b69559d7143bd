//! Job lifecycle management.
//!
//! Owns the per-job state machine: submission, pause/resume/cancel,
//! dispatch to workers, failure accounting, and crash recovery. All store
//! mutations go through the job store's conditional-update paths; claims
//! are the only mutual-exclusion mechanism and they are time-bounded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::audit_logger::AuditLogger;
use super::retry_policy::RetryPolicy;
use crate::breaker::HealthRegistry;
use crate::config::OrchestratorSettings;
use crate::error::OrchestratorError;
use crate::events::{EventPublisher, JobEvent};
use crate::job_store::{
    Checkpoint, FetchFailure, Job, JobFilter, JobSnapshot, JobState, JobStore, QueueStats,
};

/// A job handed to a worker: the record, its dependency key for health
/// reporting, and the cooperative cancellation token the manager fires on
/// cancel or pause.
pub struct ClaimedJob {
    pub job: Job,
    pub dependency: String,
    pub cancel: CancellationToken,
}

/// Derive the circuit-breaker dependency key from a resource identifier:
/// scheme plus authority, falling back to a catch-all bucket.
pub fn dependency_key(resource: &str) -> String {
    match resource.split_once("://") {
        Some((scheme, rest)) => {
            let host = rest.split('/').next().unwrap_or("");
            if host.is_empty() {
                "source".to_string()
            } else {
                format!("{}://{}", scheme, host)
            }
        }
        None => "source".to_string(),
    }
}

/// The lifecycle manager, shared by the submission facade, the worker
/// pool, and the maintenance loops.
pub struct LifecycleManager {
    store: Arc<dyn JobStore>,
    registry: Arc<HealthRegistry>,
    events: EventPublisher,
    audit: AuditLogger,
    retry_policy: RetryPolicy,
    settings: OrchestratorSettings,
    /// Cancellation tokens for running jobs, keyed by job id.
    cancel_tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<HealthRegistry>,
        events: EventPublisher,
        settings: OrchestratorSettings,
    ) -> Self {
        let retry_policy = RetryPolicy::new(&settings);
        let audit = AuditLogger::new(store.clone());
        Self {
            store,
            registry,
            events,
            audit,
            retry_policy,
            settings,
            cancel_tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Direct store access for maintenance tooling and tests.
    pub(crate) fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    // =========================================================================
    // Submission interface
    // =========================================================================

    /// Create a new job in `Pending`. Rejects malformed resource
    /// identifiers and out-of-bounds priorities synchronously; no job
    /// record is created on rejection.
    pub async fn submit(
        &self,
        resource: &str,
        priority: i32,
        options: serde_json::Value,
        requested_by: Option<String>,
    ) -> Result<String, OrchestratorError> {
        let resource = resource.trim();
        if resource.is_empty() {
            return Err(OrchestratorError::Validation(
                "resource identifier is empty".to_string(),
            ));
        }
        if resource.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(OrchestratorError::Validation(format!(
                "resource identifier contains whitespace or control characters: {:?}",
                resource
            )));
        }
        if priority < self.settings.min_priority || priority > self.settings.max_priority {
            return Err(OrchestratorError::Validation(format!(
                "priority {} outside configured bounds [{}, {}]",
                priority, self.settings.min_priority, self.settings.max_priority
            )));
        }

        let mut job = Job::new(
            uuid::Uuid::new_v4().to_string(),
            resource.to_string(),
            priority,
            self.settings.max_attempts,
            options,
        );
        if let Some(requested_by) = requested_by {
            job = job.with_requester(requested_by);
        }
        let job_id = job.id.clone();

        self.store.enqueue(job.clone())?;

        let queue_position = self.store.queue_position(&job_id).unwrap_or(None);
        if let Err(e) = self.audit.log_submitted(&job, queue_position) {
            warn!("Failed to audit submission of {}: {}", job_id, e);
        }
        self.events
            .publish(JobEvent::Submitted {
                job_id: job_id.clone(),
                priority,
            })
            .await;

        info!(
            "Submitted job {} for {} at priority {} (position {:?})",
            job_id, resource, priority, queue_position
        );
        Ok(job_id)
    }

    /// Pause a pending, retry-waiting, or running job. Idempotent: pausing
    /// a paused job is a no-op. Releases any held claim and preserves the
    /// checkpoint; voluntary pauses never touch the attempt count.
    pub async fn pause(&self, job_id: &str) -> Result<(), OrchestratorError> {
        let job = self.require(job_id)?;

        match job.state {
            JobState::Paused => return Ok(()),
            JobState::Pending | JobState::RetryWaiting | JobState::Running => {}
            state => {
                return Err(OrchestratorError::InvalidTransition {
                    job_id: job_id.to_string(),
                    state,
                    operation: "pause",
                })
            }
        }

        if !self.store.set_paused(job_id)? {
            // State moved under us; only a concurrent pause is benign
            let job = self.require(job_id)?;
            if job.state == JobState::Paused {
                return Ok(());
            }
            return Err(OrchestratorError::InvalidTransition {
                job_id: job_id.to_string(),
                state: job.state,
                operation: "pause",
            });
        }

        // Stop a running transfer; the claim row is already released, so a
        // straggling worker loses its conditional writes either way.
        self.signal_abort(job_id);

        if let Err(e) = self.audit.log_paused(job_id) {
            warn!("Failed to audit pause of {}: {}", job_id, e);
        }
        self.events
            .publish(JobEvent::Paused {
                job_id: job_id.to_string(),
            })
            .await;
        info!("Paused job {}", job_id);
        Ok(())
    }

    /// Re-admit a paused job into the queue at its original priority.
    pub async fn resume(&self, job_id: &str) -> Result<(), OrchestratorError> {
        let job = self.require(job_id)?;

        match job.state {
            // Already queued: nothing to do
            JobState::Pending => return Ok(()),
            JobState::Paused => {}
            state => {
                return Err(OrchestratorError::InvalidTransition {
                    job_id: job_id.to_string(),
                    state,
                    operation: "resume",
                })
            }
        }

        if !self.store.set_resumed(job_id)? {
            let job = self.require(job_id)?;
            if job.state == JobState::Pending {
                return Ok(());
            }
            return Err(OrchestratorError::InvalidTransition {
                job_id: job_id.to_string(),
                state: job.state,
                operation: "resume",
            });
        }

        if let Err(e) = self.audit.log_resumed(job_id) {
            warn!("Failed to audit resume of {}: {}", job_id, e);
        }
        self.events
            .publish(JobEvent::Resumed {
                job_id: job_id.to_string(),
            })
            .await;
        info!("Resumed job {}", job_id);
        Ok(())
    }

    /// Cancel from any non-terminal state. Signals the holding worker, if
    /// any, and discards the checkpoint. Cancelling a cancelled job is a
    /// no-op.
    pub async fn cancel(&self, job_id: &str) -> Result<(), OrchestratorError> {
        let job = self.require(job_id)?;

        match job.state {
            JobState::Cancelled => return Ok(()),
            state if state.is_terminal() => {
                return Err(OrchestratorError::InvalidTransition {
                    job_id: job_id.to_string(),
                    state,
                    operation: "cancel",
                })
            }
            _ => {}
        }

        if !self.store.cancel(job_id)? {
            let job = self.require(job_id)?;
            if job.state == JobState::Cancelled {
                return Ok(());
            }
            return Err(OrchestratorError::InvalidTransition {
                job_id: job_id.to_string(),
                state: job.state,
                operation: "cancel",
            });
        }

        self.signal_abort(job_id);

        if let Err(e) = self.audit.log_cancelled(job_id) {
            warn!("Failed to audit cancel of {}: {}", job_id, e);
        }
        self.events
            .publish(JobEvent::Cancelled {
                job_id: job_id.to_string(),
            })
            .await;
        info!("Cancelled job {}", job_id);
        Ok(())
    }

    /// Snapshot of a job for status queries.
    pub async fn get_status(&self, job_id: &str) -> Result<JobSnapshot, OrchestratorError> {
        let job = self.require(job_id)?;
        let queue_position = self.store.queue_position(job_id)?;
        Ok(JobSnapshot::from_job(&job, queue_position))
    }

    /// List jobs matching a filter.
    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, OrchestratorError> {
        self.store.list(filter)
    }

    /// Queue statistics by state.
    pub async fn stats(&self) -> Result<QueueStats, OrchestratorError> {
        self.store.stats()
    }

    /// Audit trail for one job, oldest first.
    pub async fn audit_trail(
        &self,
        job_id: &str,
    ) -> Result<Vec<crate::job_store::AuditEntry>, OrchestratorError> {
        self.store.audit_for_job(job_id)
    }

    // =========================================================================
    // Worker-facing dispatch
    // =========================================================================

    /// Atomically claim the next runnable job for a worker.
    ///
    /// Consults the circuit breaker for the job's dependency before handing
    /// it out: with the circuit open the job goes straight back to
    /// `Pending` — deferred, not failed, and no attempt is consumed.
    pub async fn next_job(&self, worker_id: &str) -> Result<Option<ClaimedJob>, OrchestratorError> {
        let Some(job) = self
            .store
            .claim_next(worker_id, self.settings.lease_ttl_secs)?
        else {
            return Ok(None);
        };

        let dependency = dependency_key(&job.resource);
        if let Err(wait) = self.registry.try_acquire(&dependency).await {
            debug!(
                "Deferring job {}: circuit open for {} ({}s left)",
                job.id,
                dependency,
                wait.as_secs()
            );
            self.store.release_to_pending(&job.id, worker_id)?;
            return Ok(None);
        }

        let cancel = CancellationToken::new();
        self.cancel_tokens
            .lock()
            .unwrap()
            .insert(job.id.clone(), cancel.clone());

        if let Err(e) = self.audit.log_started(&job, worker_id) {
            warn!("Failed to audit start of {}: {}", job.id, e);
        }
        self.events
            .publish(JobEvent::Started {
                job_id: job.id.clone(),
                worker_id: worker_id.to_string(),
                attempt: job.attempt_count + 1,
            })
            .await;

        Ok(Some(ClaimedJob {
            dependency,
            cancel,
            job,
        }))
    }

    /// Renew the worker's lease. A `ClaimExpired` return means the worker
    /// must stop writing immediately: the job may already be claimed
    /// elsewhere.
    pub async fn heartbeat(&self, job_id: &str, worker_id: &str) -> Result<(), OrchestratorError> {
        self.store
            .renew_claim(job_id, worker_id, self.settings.lease_ttl_secs)
    }

    /// Persist a checkpoint, then emit the progress event. The store write
    /// happens-before the publish so a crash after the event never leaves
    /// the store stale relative to externally-observed progress.
    pub async fn report_progress(
        &self,
        job_id: &str,
        worker_id: &str,
        checkpoint: Checkpoint,
        bytes_done: u64,
    ) -> Result<(), OrchestratorError> {
        self.store
            .write_checkpoint(job_id, worker_id, &checkpoint, bytes_done)?;
        self.events
            .publish(JobEvent::Progress {
                job_id: job_id.to_string(),
                cursor: checkpoint.cursor,
                bytes_done,
            })
            .await;
        Ok(())
    }

    /// Complete a job: persist the artifact reference, transition to
    /// `Completed`, release the claim, and close the dependency circuit.
    pub async fn report_success(
        &self,
        job_id: &str,
        worker_id: &str,
        artifact_ref: &str,
        bytes_done: u64,
    ) -> Result<(), OrchestratorError> {
        let job = self.require(job_id)?;
        self.store
            .mark_completed(job_id, worker_id, artifact_ref, bytes_done)?;
        self.registry
            .record_success(&dependency_key(&job.resource))
            .await;
        self.forget_token(job_id);

        if let Err(e) = self
            .audit
            .log_completed(job_id, worker_id, artifact_ref, bytes_done)
        {
            warn!("Failed to audit completion of {}: {}", job_id, e);
        }
        self.events
            .publish(JobEvent::Completed {
                job_id: job_id.to_string(),
                artifact_ref: artifact_ref.to_string(),
                bytes_done,
            })
            .await;
        info!(
            "Job {} completed by {} ({} bytes -> {})",
            job_id, worker_id, bytes_done, artifact_ref
        );
        Ok(())
    }

    /// Record a failed execution attempt.
    ///
    /// Retryable failures under the attempt budget schedule a delayed
    /// re-enqueue with exponential backoff; permanent failures and
    /// exhausted budgets transition to `FailedTerminal` and route the job
    /// to the dead-letter path. The attempt count increments exactly once
    /// either way.
    pub async fn report_failure(
        &self,
        job_id: &str,
        worker_id: &str,
        failure: FetchFailure,
    ) -> Result<(), OrchestratorError> {
        let job = self.require(job_id)?;

        // Transient failures count against the dependency's health;
        // a rejected resource says nothing about the dependency.
        if !failure.is_permanent() {
            self.registry
                .record_failure(&dependency_key(&job.resource))
                .await;
        }

        let attempt = job.attempt_count + 1;

        if self.retry_policy.should_retry(&failure, attempt) {
            let delay_secs = self.retry_policy.delay_secs(attempt);
            let next_retry_at = self.retry_policy.next_retry_at(attempt);
            self.store
                .mark_retry_waiting(job_id, worker_id, next_retry_at, &failure)?;
            self.forget_token(job_id);

            if let Err(e) = self.audit.log_retry_scheduled(
                job_id,
                worker_id,
                attempt,
                next_retry_at,
                delay_secs,
                &failure,
            ) {
                warn!("Failed to audit retry of {}: {}", job_id, e);
            }
            self.events
                .publish(JobEvent::RetryScheduled {
                    job_id: job_id.to_string(),
                    attempt,
                    next_retry_at,
                    error: failure.clone(),
                })
                .await;
            info!(
                "Job {} attempt {} failed ({}), retrying in {}s",
                job_id, attempt, failure, delay_secs
            );
        } else {
            self.store
                .mark_failed_terminal(job_id, worker_id, &failure)?;
            self.forget_token(job_id);

            if let Err(e) = self.audit.log_failed(job_id, worker_id, attempt, &failure) {
                warn!("Failed to audit failure of {}: {}", job_id, e);
            }
            if let Err(e) = self.audit.log_dead_lettered(job_id, &failure) {
                warn!("Failed to audit dead-letter of {}: {}", job_id, e);
            }
            self.events
                .publish(JobEvent::Failed {
                    job_id: job_id.to_string(),
                    attempt,
                    error: failure.clone(),
                })
                .await;
            self.events
                .publish(JobEvent::DeadLettered {
                    job_id: job_id.to_string(),
                    error: failure.clone(),
                })
                .await;
            warn!(
                "Job {} failed terminally after attempt {}: {}",
                job_id, attempt, failure
            );
        }
        Ok(())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Move retry-waiting jobs whose backoff elapsed back to `Pending`.
    pub async fn promote_due_retries(&self) -> Result<usize, OrchestratorError> {
        let promoted = self
            .store
            .promote_due_retries(chrono::Utc::now().timestamp())?;
        for job in &promoted {
            debug!("Job {} promoted from retry backoff", job.id);
        }
        Ok(promoted.len())
    }

    /// Void lapsed claims so crashed workers' jobs become reclaimable.
    /// Checkpoints are preserved and the attempt count is untouched: the
    /// work itself did not fail.
    pub async fn reclaim_expired(&self) -> Result<usize, OrchestratorError> {
        let reclaimed = self
            .store
            .reclaim_expired(chrono::Utc::now().timestamp())?;
        for job in &reclaimed {
            let previous = job.claimed_by.clone().unwrap_or_default();
            warn!(
                "Reclaimed job {} from expired claim held by {} (cursor {:?})",
                job.id,
                previous,
                job.checkpoint.as_ref().map(|c| c.cursor)
            );
            self.forget_token(&job.id);
            if let Err(e) = self.audit.log_reclaimed(job, &previous) {
                warn!("Failed to audit reclaim of {}: {}", job.id, e);
            }
            self.events
                .publish(JobEvent::Reclaimed {
                    job_id: job.id.clone(),
                    previous_worker: previous,
                })
                .await;
        }
        Ok(reclaimed.len())
    }

    /// Prune audit entries past the retention window.
    pub async fn prune_audit(&self) -> Result<usize, OrchestratorError> {
        let cutoff = chrono::Utc::now().timestamp()
            - (self.settings.audit_retention_days as i64) * 86400;
        self.store.prune_audit(cutoff)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn require(&self, job_id: &str) -> Result<Job, OrchestratorError> {
        self.store
            .get(job_id)?
            .ok_or_else(|| OrchestratorError::NotFound(job_id.to_string()))
    }

    fn signal_abort(&self, job_id: &str) {
        let token = self.cancel_tokens.lock().unwrap().remove(job_id);
        if let Some(token) = token {
            token.cancel();
        }
    }

    fn forget_token(&self, job_id: &str) {
        self.cancel_tokens.lock().unwrap().remove(job_id);
    }
}
