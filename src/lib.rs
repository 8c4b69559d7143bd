//! Staffetta
//!
//! Resilient content-fetch job orchestration: a durable priority queue,
//! a lifecycle manager with claim leases and exponential-backoff retries,
//! resumable transfer workers, an at-least-once message bus with
//! dead-lettering, and per-dependency circuit breaking.
//!
//! This library exposes the internal modules for testing and embedding.

pub mod breaker;
pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod job_store;
pub mod lifecycle;
pub mod metrics;
pub mod sqlite_persistence;
pub mod transfer;

// Re-export commonly used types for convenience
pub use breaker::{BreakerConfig, CircuitState, HealthRegistry};
pub use bus::{InMemoryBus, Message, MessageBus, Subscription};
pub use config::{AppConfig, CliConfig, FileConfig, OrchestratorSettings};
pub use error::OrchestratorError;
pub use events::{EventPublisher, JobEvent};
pub use job_store::{
    Checkpoint, FetchErrorKind, FetchFailure, Job, JobFilter, JobSnapshot, JobState, JobStore,
    SqliteJobStore,
};
pub use lifecycle::{LifecycleManager, MaintenanceLoop, RetryPolicy};
pub use transfer::{ArtifactStore, FetchSource, FsArtifactStore, HttpFetchSource, TransferWorker};
