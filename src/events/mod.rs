//! Lifecycle and progress event contract.
//!
//! Events flow over the bus from the lifecycle manager and the transfer
//! workers to independent consumers (metrics, dead-letter inspection).
//! Publishing is best-effort: a sink that cannot keep up never blocks job
//! processing.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::bus::MessageBus;
use crate::job_store::FetchFailure;

/// Bus topics carrying job events.
pub mod topics {
    /// State transitions: submitted, started, completed, failed, ...
    pub const JOB_LIFECYCLE: &str = "jobs.lifecycle";
    /// High-frequency transfer progress.
    pub const JOB_PROGRESS: &str = "jobs.progress";
    /// Jobs that exhausted their retry budget, retained for inspection.
    pub const JOB_DEAD_LETTER: &str = "jobs.dead_letter";
}

/// One job event. Consumers deduplicate on `(job_id, type)` plus the
/// attempt/cursor fields where present — the bus is at-least-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Submitted {
        job_id: String,
        priority: i32,
    },
    Started {
        job_id: String,
        worker_id: String,
        attempt: i32,
    },
    Progress {
        job_id: String,
        cursor: u64,
        bytes_done: u64,
    },
    Completed {
        job_id: String,
        artifact_ref: String,
        bytes_done: u64,
    },
    RetryScheduled {
        job_id: String,
        attempt: i32,
        next_retry_at: i64,
        error: FetchFailure,
    },
    Failed {
        job_id: String,
        attempt: i32,
        error: FetchFailure,
    },
    Cancelled {
        job_id: String,
    },
    Paused {
        job_id: String,
    },
    Resumed {
        job_id: String,
    },
    Reclaimed {
        job_id: String,
        previous_worker: String,
    },
    DeadLettered {
        job_id: String,
        error: FetchFailure,
    },
}

impl JobEvent {
    /// The topic this event belongs on.
    pub fn topic(&self) -> &'static str {
        match self {
            JobEvent::Progress { .. } => topics::JOB_PROGRESS,
            JobEvent::DeadLettered { .. } => topics::JOB_DEAD_LETTER,
            _ => topics::JOB_LIFECYCLE,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Submitted { job_id, .. }
            | JobEvent::Started { job_id, .. }
            | JobEvent::Progress { job_id, .. }
            | JobEvent::Completed { job_id, .. }
            | JobEvent::RetryScheduled { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Cancelled { job_id }
            | JobEvent::Paused { job_id }
            | JobEvent::Resumed { job_id }
            | JobEvent::Reclaimed { job_id, .. }
            | JobEvent::DeadLettered { job_id, .. } => job_id,
        }
    }
}

/// Best-effort publisher wrapping the bus.
#[derive(Clone)]
pub struct EventPublisher {
    bus: Arc<dyn MessageBus>,
}

impl EventPublisher {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }

    /// Publish an event to its topic. Failures are logged and swallowed so
    /// event delivery can never stall the job path.
    pub async fn publish(&self, event: JobEvent) {
        let topic = event.topic();
        let payload = match serde_json::to_value(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to serialize job event: {}", e);
                return;
            }
        };
        if let Err(e) = self.bus.publish(topic, payload).await {
            warn!(
                "Failed to publish {} event for job {}: {}",
                topic,
                event.job_id(),
                e
            );
        }
    }
}
