//! Prometheus metrics fed by the job event stream.
//!
//! The aggregator is an independent bus consumer: it receives the same
//! lifecycle and progress events as any other subscriber, so a slow or
//! absent metrics sink can never block job processing.

use lazy_static::lazy_static;
use prometheus::{Counter, CounterVec, Gauge, Histogram, HistogramOpts, Opts, Registry};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{MessageBus, Subscription};
use crate::events::{topics, JobEvent};

/// Metric name prefix for all staffetta metrics.
const PREFIX: &str = "staffetta";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Job lifecycle
    pub static ref JOBS_SUBMITTED_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_jobs_submitted_total"),
        "Total jobs accepted at submission"
    ).expect("Failed to create jobs_submitted_total metric");

    pub static ref JOBS_COMPLETED_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_jobs_completed_total"),
        "Total jobs completed successfully"
    ).expect("Failed to create jobs_completed_total metric");

    pub static ref JOBS_FAILED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_failed_total"), "Total terminal job failures"),
        &["error_kind"]
    ).expect("Failed to create jobs_failed_total metric");

    pub static ref JOB_RETRIES_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_job_retries_total"),
        "Total retry attempts scheduled"
    ).expect("Failed to create job_retries_total metric");

    pub static ref JOBS_CANCELLED_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_jobs_cancelled_total"),
        "Total jobs cancelled"
    ).expect("Failed to create jobs_cancelled_total metric");

    pub static ref JOBS_RECLAIMED_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_jobs_reclaimed_total"),
        "Jobs recovered from expired claims"
    ).expect("Failed to create jobs_reclaimed_total metric");

    pub static ref JOBS_RUNNING: Gauge = Gauge::new(
        format!("{PREFIX}_jobs_running"),
        "Jobs currently claimed by a worker"
    ).expect("Failed to create jobs_running metric");

    // Transfer
    pub static ref BYTES_FETCHED_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_bytes_fetched_total"),
        "Total content bytes fetched across completed jobs"
    ).expect("Failed to create bytes_fetched_total metric");

    pub static ref TRANSFER_ATTEMPT_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            format!("{PREFIX}_transfer_attempt_duration_seconds"),
            "Wall time of a single transfer attempt"
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 1800.0])
    ).expect("Failed to create transfer_attempt_duration_seconds metric");

    // Bus
    pub static ref BUS_DEAD_LETTERS_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_bus_dead_letters_total"),
        "Job events observed on the dead-letter topic"
    ).expect("Failed to create bus_dead_letters_total metric");
}

/// Register all metrics with the registry.
pub fn init_metrics() {
    // Ignore errors if already registered (happens in tests)
    let _ = REGISTRY.register(Box::new(JOBS_SUBMITTED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_COMPLETED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_FAILED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_RETRIES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_CANCELLED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_RECLAIMED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_RUNNING.clone()));
    let _ = REGISTRY.register(Box::new(BYTES_FETCHED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(TRANSFER_ATTEMPT_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(BUS_DEAD_LETTERS_TOTAL.clone()));
}

/// Consumer group used by the aggregator; resubscribing under the same
/// name resumes where the previous run left off.
const CONSUMER_GROUP: &str = "metrics-aggregator";

/// Bus consumer translating job events into Prometheus series.
pub struct MetricsAggregator {
    bus: std::sync::Arc<dyn MessageBus>,
}

impl MetricsAggregator {
    pub fn new(bus: std::sync::Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }

    /// Consume lifecycle, progress, and dead-letter topics until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Metrics aggregator starting");

        let mut lifecycle = self.bus.subscribe(topics::JOB_LIFECYCLE, CONSUMER_GROUP).await;
        let mut progress = self.bus.subscribe(topics::JOB_PROGRESS, CONSUMER_GROUP).await;
        let mut dead = self.bus.subscribe(topics::JOB_DEAD_LETTER, CONSUMER_GROUP).await;

        loop {
            let message = tokio::select! {
                m = lifecycle.next() => m,
                m = progress.next() => m,
                m = dead.next() => m,
                _ = shutdown.cancelled() => {
                    info!("Metrics aggregator shutting down");
                    break;
                }
            };

            if message.topic == topics::JOB_DEAD_LETTER {
                BUS_DEAD_LETTERS_TOTAL.inc();
            }

            match serde_json::from_value::<JobEvent>(message.payload.clone()) {
                Ok(event) => Self::observe(&event),
                Err(e) => debug!("Skipping non-event payload on {}: {}", message.topic, e),
            }

            if let Err(e) = self.bus.ack(&message.delivery_id).await {
                warn!("Failed to ack metrics delivery: {}", e);
            }
        }
    }

    /// At-least-once caveat: counters may over-count on redelivery; that is
    /// an accepted property of the sink, not of job state.
    fn observe(event: &JobEvent) {
        match event {
            JobEvent::Submitted { .. } => JOBS_SUBMITTED_TOTAL.inc(),
            JobEvent::Started { .. } => JOBS_RUNNING.inc(),
            JobEvent::Progress { .. } => {}
            JobEvent::Completed { bytes_done, .. } => {
                JOBS_RUNNING.dec();
                JOBS_COMPLETED_TOTAL.inc();
                BYTES_FETCHED_TOTAL.inc_by(*bytes_done as f64);
            }
            JobEvent::RetryScheduled { .. } => {
                JOBS_RUNNING.dec();
                JOB_RETRIES_TOTAL.inc();
            }
            JobEvent::Failed { error, .. } => {
                JOBS_RUNNING.dec();
                JOBS_FAILED_TOTAL
                    .with_label_values(&[error.kind.as_str()])
                    .inc();
            }
            JobEvent::Cancelled { .. } => JOBS_CANCELLED_TOTAL.inc(),
            JobEvent::Paused { .. } | JobEvent::Resumed { .. } => {}
            JobEvent::Reclaimed { .. } => {
                JOBS_RUNNING.dec();
                JOBS_RECLAIMED_TOTAL.inc();
            }
            JobEvent::DeadLettered { .. } => {}
        }
    }
}
