//! Resumable transfer worker.
//!
//! Each worker loops claim -> transfer -> report. A claimed job runs with
//! a heartbeat task renewing the lease; the transfer loop streams chunks
//! into the spool, persisting a checkpoint (store write happens-before the
//! progress event) at a byte interval. Cancellation is cooperative at
//! chunk granularity, so abort latency is bounded by one chunk arrival or
//! select wakeup. A failed heartbeat self-aborts the transfer: once the
//! lease is uncertain the worker must stop writing, because the job may
//! already be claimed elsewhere.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::artifact_store::ArtifactStore;
use super::fetch_source::FetchSource;
use crate::error::OrchestratorError;
use crate::job_store::{Checkpoint, FetchErrorKind, FetchFailure, Job, JobState};
use crate::lifecycle::{ClaimedJob, LifecycleManager};
use crate::metrics;

fn hex_digest(hasher: &Sha256) -> String {
    let digest = hasher.clone().finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// How a single transfer attempt ended.
enum AttemptOutcome {
    Completed { bytes_done: u64 },
    Failed(FetchFailure),
    /// Cancel or pause signal; the manager already transitioned the job.
    Aborted,
    /// Lease renewal failed or a guarded write was rejected; stop without
    /// reporting, the reaper requeues the job.
    LostClaim,
    /// Daemon shutdown; the claim lapses and is reaped on restart.
    Shutdown,
}

/// One transfer worker. Run as many as `worker_count` in parallel; the
/// store's atomic claim path keeps them from ever sharing a job.
pub struct TransferWorker {
    id: String,
    manager: Arc<LifecycleManager>,
    source: Arc<dyn FetchSource>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl TransferWorker {
    pub fn new(
        id: String,
        manager: Arc<LifecycleManager>,
        source: Arc<dyn FetchSource>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            id,
            manager,
            source,
            artifacts,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Main worker loop - call from a spawned task.
    pub async fn run(&self, shutdown: CancellationToken) {
        let poll_interval =
            Duration::from_secs(self.manager.settings().poll_interval_secs.max(1));
        info!("Transfer worker {} starting", self.id);

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.manager.next_job(&self.id).await {
                Ok(Some(claimed)) => {
                    self.execute(claimed, &shutdown).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(poll_interval) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
                Err(e) => {
                    error!("Worker {} failed to poll for work: {}", self.id, e);
                    tokio::select! {
                        _ = tokio::time::sleep(poll_interval) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }

        info!("Transfer worker {} stopped", self.id);
    }

    /// Execute one claimed job to completion or reportable failure.
    async fn execute(&self, claimed: ClaimedJob, shutdown: &CancellationToken) {
        let job = claimed.job;
        let job_id = job.id.clone();
        let started = Instant::now();

        debug!(
            "Worker {} starting job {} (attempt {}, cursor {:?})",
            self.id,
            job_id,
            job.attempt_count + 1,
            job.checkpoint.as_ref().map(|c| c.cursor)
        );

        // Heartbeat keeps the lease alive strictly inside its TTL. If a
        // renewal fails the transfer must stop writing immediately.
        let lost_claim = CancellationToken::new();
        let heartbeat_stop = CancellationToken::new();
        let heartbeat_task = tokio::spawn({
            let manager = Arc::clone(&self.manager);
            let job_id = job_id.clone();
            let worker_id = self.id.clone();
            let lost_claim = lost_claim.clone();
            let stop = heartbeat_stop.clone();
            let interval =
                Duration::from_secs(manager.settings().heartbeat_interval_secs.max(1));
            async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {}
                        _ = stop.cancelled() => break,
                    }
                    if let Err(e) = manager.heartbeat(&job_id, &worker_id).await {
                        warn!(
                            "Worker {} lost claim on {} ({}), aborting transfer",
                            worker_id, job_id, e
                        );
                        lost_claim.cancel();
                        break;
                    }
                }
            }
        });

        let outcome = self
            .transfer(&job, &claimed.cancel, &lost_claim, shutdown)
            .await;

        heartbeat_stop.cancel();
        let _ = heartbeat_task.await;

        metrics::TRANSFER_ATTEMPT_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());

        match outcome {
            AttemptOutcome::Completed { bytes_done } => {
                match self.artifacts.finalize(&job_id).await {
                    Ok(artifact_ref) => {
                        if let Err(e) = self
                            .manager
                            .report_success(&job_id, &self.id, &artifact_ref, bytes_done)
                            .await
                        {
                            warn!(
                                "Worker {} could not record completion of {}: {}",
                                self.id, job_id, e
                            );
                        }
                    }
                    Err(e) => {
                        let failure =
                            FetchFailure::new(FetchErrorKind::Io, format!("finalize: {}", e));
                        self.report_failure_best_effort(&job_id, failure).await;
                    }
                }
            }
            AttemptOutcome::Failed(failure) => {
                self.report_failure_best_effort(&job_id, failure).await;
            }
            AttemptOutcome::Aborted => {
                // Cancel discards the spool; pause keeps it for resume.
                match self.manager.get_status(&job_id).await {
                    Ok(snapshot) if snapshot.state == JobState::Cancelled => {
                        if let Err(e) = self.artifacts.discard_spool(&job_id).await {
                            warn!("Failed to discard spool of {}: {}", job_id, e);
                        }
                        info!("Worker {} aborted cancelled job {}", self.id, job_id);
                    }
                    Ok(_) => {
                        info!("Worker {} released paused job {}", self.id, job_id);
                    }
                    Err(e) => warn!("Worker {} lost track of {}: {}", self.id, job_id, e),
                }
            }
            AttemptOutcome::LostClaim => {
                warn!(
                    "Worker {} self-aborted {} under an uncertain claim",
                    self.id, job_id
                );
            }
            AttemptOutcome::Shutdown => {
                info!(
                    "Worker {} abandoning {} for shutdown; lease will be reaped",
                    self.id, job_id
                );
            }
        }
    }

    /// Stream the content into the spool, checkpointing as we go.
    async fn transfer(
        &self,
        job: &Job,
        cancel: &CancellationToken,
        lost_claim: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> AttemptOutcome {
        let checkpoint_interval = self.manager.settings().checkpoint_interval_bytes.max(1);
        let mut hasher = Sha256::new();
        let mut cursor: u64 = 0;
        let mut bytes_done: u64 = 0;

        // Align the spool with the last verified checkpoint, or start over.
        match self.resume_point(job, &mut hasher).await {
            Ok(Some((resume_cursor, spool_len))) => {
                cursor = resume_cursor;
                bytes_done = spool_len;
            }
            Ok(None) => {}
            Err(e) => {
                return AttemptOutcome::Failed(FetchFailure::new(
                    FetchErrorKind::Io,
                    format!("spool: {}", e),
                ))
            }
        }

        let stream = match self.source.fetch(&job.resource, cursor).await {
            Ok(stream) => stream,
            Err(failure) => return AttemptOutcome::Failed(failure),
        };
        tokio::pin!(stream);

        let mut last_checkpoint = bytes_done;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return AttemptOutcome::Aborted,
                _ = lost_claim.cancelled() => return AttemptOutcome::LostClaim,
                _ = shutdown.cancelled() => return AttemptOutcome::Shutdown,
                next = stream.next() => next,
            };

            let chunk = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(failure)) => {
                    // Persist what we have so the retry resumes from here
                    // instead of the last periodic checkpoint.
                    self.checkpoint_best_effort(&job.id, cursor, &hasher, bytes_done)
                        .await;
                    return AttemptOutcome::Failed(failure);
                }
            };

            if let Err(e) = self.artifacts.append_spool(&job.id, &chunk.bytes).await {
                return AttemptOutcome::Failed(FetchFailure::new(
                    FetchErrorKind::Io,
                    format!("spool append: {}", e),
                ));
            }
            hasher.update(&chunk.bytes);
            bytes_done += chunk.bytes.len() as u64;
            cursor = chunk.cursor;

            if bytes_done - last_checkpoint >= checkpoint_interval {
                let checkpoint = Checkpoint {
                    cursor,
                    digest: hex_digest(&hasher),
                };
                match self
                    .manager
                    .report_progress(&job.id, &self.id, checkpoint, bytes_done)
                    .await
                {
                    Ok(()) => last_checkpoint = bytes_done,
                    Err(OrchestratorError::ClaimExpired(_)) => {
                        return AttemptOutcome::LostClaim
                    }
                    Err(e) => {
                        // Store hiccup: keep transferring, try again at the
                        // next interval.
                        warn!("Checkpoint write for {} failed: {}", job.id, e);
                    }
                }
            }
        }

        AttemptOutcome::Completed { bytes_done }
    }

    /// Verify the spool against the job's checkpoint.
    ///
    /// Returns `Some((cursor, spool_len))` to resume from, or `None` for a
    /// fresh start. The spool may run past the checkpoint (progress made
    /// after the last persisted cursor); the verified prefix is kept and
    /// the tail dropped. Any mismatch restarts from byte zero rather than
    /// risking a corrupt artifact.
    async fn resume_point(
        &self,
        job: &Job,
        hasher: &mut Sha256,
    ) -> anyhow::Result<Option<(u64, u64)>> {
        let Some(checkpoint) = &job.checkpoint else {
            self.artifacts.truncate_spool(&job.id, 0).await?;
            return Ok(None);
        };

        let spool = self.artifacts.read_spool(&job.id).await?;
        if (spool.len() as u64) < checkpoint.cursor {
            warn!(
                "Spool for {} shorter than checkpoint cursor {}, restarting from zero",
                job.id, checkpoint.cursor
            );
            self.artifacts.truncate_spool(&job.id, 0).await?;
            return Ok(None);
        }

        let prefix = &spool[..checkpoint.cursor as usize];
        let mut prefix_hasher = Sha256::new();
        prefix_hasher.update(prefix);
        if hex_digest(&prefix_hasher) != checkpoint.digest {
            warn!(
                "Checkpoint digest mismatch for {}, restarting from zero",
                job.id
            );
            self.artifacts.truncate_spool(&job.id, 0).await?;
            return Ok(None);
        }

        if (spool.len() as u64) > checkpoint.cursor {
            self.artifacts
                .truncate_spool(&job.id, checkpoint.cursor)
                .await?;
        }
        hasher.update(prefix);
        info!(
            "Resuming job {} from checkpoint cursor {}",
            job.id, checkpoint.cursor
        );
        Ok(Some((checkpoint.cursor, checkpoint.cursor)))
    }

    async fn checkpoint_best_effort(
        &self,
        job_id: &str,
        cursor: u64,
        hasher: &Sha256,
        bytes_done: u64,
    ) {
        let checkpoint = Checkpoint {
            cursor,
            digest: hex_digest(hasher),
        };
        if let Err(e) = self
            .manager
            .report_progress(job_id, &self.id, checkpoint, bytes_done)
            .await
        {
            debug!("Final checkpoint for {} not persisted: {}", job_id, e);
        }
    }

    async fn report_failure_best_effort(&self, job_id: &str, failure: FetchFailure) {
        if let Err(e) = self
            .manager
            .report_failure(job_id, &self.id, failure)
            .await
        {
            warn!(
                "Worker {} could not report failure of {}: {}",
                self.id, job_id, e
            );
        }
    }
}
