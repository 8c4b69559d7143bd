//! Audit logging for job lifecycle transitions.
//!
//! Higher-level interface over the store's raw audit table; every entry is
//! self-describing JSON so dead-lettered jobs stay explainable long after
//! the fact.

use std::sync::Arc;

use crate::error::OrchestratorError;
use crate::job_store::{AuditEntry, AuditEventType, FetchFailure, Job, JobStore};

/// Helper for recording audit events during lifecycle transitions.
pub struct AuditLogger {
    store: Arc<dyn JobStore>,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub fn log_submitted(
        &self,
        job: &Job,
        queue_position: Option<usize>,
    ) -> Result<(), OrchestratorError> {
        let entry = AuditEntry::new(AuditEventType::Submitted, job.id.clone()).with_details(
            serde_json::json!({
                "resource": job.resource,
                "priority": job.priority,
                "queue_position": queue_position,
                "requested_by": job.requested_by,
            }),
        );
        self.store.log_audit_event(entry)
    }

    pub fn log_started(&self, job: &Job, worker_id: &str) -> Result<(), OrchestratorError> {
        let entry = AuditEntry::new(AuditEventType::Started, job.id.clone())
            .with_worker(worker_id)
            .with_details(serde_json::json!({
                "attempt": job.attempt_count + 1,
                "resumed_from_cursor": job.checkpoint.as_ref().map(|c| c.cursor),
            }));
        self.store.log_audit_event(entry)
    }

    pub fn log_retry_scheduled(
        &self,
        job_id: &str,
        worker_id: &str,
        attempt: i32,
        next_retry_at: i64,
        delay_secs: u64,
        failure: &FetchFailure,
    ) -> Result<(), OrchestratorError> {
        let entry = AuditEntry::new(AuditEventType::RetryScheduled, job_id)
            .with_worker(worker_id)
            .with_details(serde_json::json!({
                "attempt": attempt,
                "next_retry_at": next_retry_at,
                "delay_secs": delay_secs,
                "error_kind": failure.kind.as_str(),
                "error_message": failure.message,
            }));
        self.store.log_audit_event(entry)
    }

    pub fn log_completed(
        &self,
        job_id: &str,
        worker_id: &str,
        artifact_ref: &str,
        bytes_done: u64,
    ) -> Result<(), OrchestratorError> {
        let entry = AuditEntry::new(AuditEventType::Completed, job_id)
            .with_worker(worker_id)
            .with_details(serde_json::json!({
                "artifact_ref": artifact_ref,
                "bytes_done": bytes_done,
            }));
        self.store.log_audit_event(entry)
    }

    pub fn log_failed(
        &self,
        job_id: &str,
        worker_id: &str,
        attempt: i32,
        failure: &FetchFailure,
    ) -> Result<(), OrchestratorError> {
        let entry = AuditEntry::new(AuditEventType::Failed, job_id)
            .with_worker(worker_id)
            .with_details(serde_json::json!({
                "attempt": attempt,
                "error_kind": failure.kind.as_str(),
                "error_message": failure.message,
            }));
        self.store.log_audit_event(entry)
    }

    pub fn log_dead_lettered(
        &self,
        job_id: &str,
        failure: &FetchFailure,
    ) -> Result<(), OrchestratorError> {
        let entry =
            AuditEntry::new(AuditEventType::DeadLettered, job_id).with_details(serde_json::json!({
                "error_kind": failure.kind.as_str(),
                "error_message": failure.message,
            }));
        self.store.log_audit_event(entry)
    }

    pub fn log_cancelled(&self, job_id: &str) -> Result<(), OrchestratorError> {
        self.store
            .log_audit_event(AuditEntry::new(AuditEventType::Cancelled, job_id))
    }

    pub fn log_paused(&self, job_id: &str) -> Result<(), OrchestratorError> {
        self.store
            .log_audit_event(AuditEntry::new(AuditEventType::Paused, job_id))
    }

    pub fn log_resumed(&self, job_id: &str) -> Result<(), OrchestratorError> {
        self.store
            .log_audit_event(AuditEntry::new(AuditEventType::Resumed, job_id))
    }

    pub fn log_reclaimed(&self, job: &Job, previous_worker: &str) -> Result<(), OrchestratorError> {
        let entry = AuditEntry::new(AuditEventType::Reclaimed, job.id.clone()).with_details(
            serde_json::json!({
                "previous_worker": previous_worker,
                "checkpoint_cursor": job.checkpoint.as_ref().map(|c| c.cursor),
            }),
        );
        self.store.log_audit_event(entry)
    }
}
