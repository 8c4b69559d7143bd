//! End-to-end orchestrator tests.
//!
//! Drives the full wiring — SQLite store, bus, breaker, lifecycle manager,
//! maintenance loop, and transfer workers — against a scripted fetch
//! source, the way an embedding process would.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use staffetta::breaker::{BreakerConfig, HealthRegistry};
use staffetta::bus::{InMemoryBus, MessageBus, Subscription};
use staffetta::config::OrchestratorSettings;
use staffetta::events::{topics, EventPublisher};
use staffetta::job_store::{
    Checkpoint, FetchErrorKind, FetchFailure, JobSnapshot, JobState, JobStore, SqliteJobStore,
};
use staffetta::lifecycle::{LifecycleManager, MaintenanceLoop};
use staffetta::transfer::{
    ArtifactStore, FetchChunk, FetchSource, FetchStream, FsArtifactStore, TransferWorker,
};

/// What one fetch attempt should do, in submission order.
#[derive(Debug, Clone)]
enum AttemptPlan {
    /// Stream to the end of the data.
    Complete,
    /// Stream up to the absolute offset, then hang until cancelled.
    StallAfter(usize),
    /// Stream up to the absolute offset, then fail.
    FailAfter(usize, FetchFailure),
}

/// Scripted fetch source: serves one byte blob in fixed-size chunks and
/// follows a per-attempt plan. Records every `(resource, cursor)` call.
struct SourceScript {
    data: Vec<u8>,
    chunk_size: usize,
    plans: Mutex<VecDeque<AttemptPlan>>,
    calls: Mutex<Vec<(String, u64)>>,
}

impl SourceScript {
    fn new(data: Vec<u8>, chunk_size: usize, plans: Vec<AttemptPlan>) -> Self {
        Self {
            data,
            chunk_size,
            plans: Mutex::new(plans.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<(String, u64)> {
        self.calls.lock().unwrap().clone()
    }

    fn cursors(&self) -> Vec<u64> {
        self.calls().into_iter().map(|(_, c)| c).collect()
    }
}

#[async_trait]
impl FetchSource for SourceScript {
    async fn fetch(&self, resource: &str, resume_cursor: u64) -> Result<FetchStream, FetchFailure> {
        self.calls
            .lock()
            .unwrap()
            .push((resource.to_string(), resume_cursor));

        let plan = self
            .plans
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(AttemptPlan::Complete);

        let (stop_at, tail_error, stall) = match &plan {
            AttemptPlan::Complete => (self.data.len(), None, false),
            AttemptPlan::StallAfter(offset) => (*offset.min(&self.data.len()), None, true),
            AttemptPlan::FailAfter(offset, failure) => {
                (*offset.min(&self.data.len()), Some(failure.clone()), false)
            }
        };

        let mut items: Vec<Result<FetchChunk, FetchFailure>> = Vec::new();
        let mut offset = resume_cursor as usize;
        while offset < stop_at {
            let end = (offset + self.chunk_size).min(stop_at);
            items.push(Ok(FetchChunk {
                bytes: self.data[offset..end].to_vec(),
                cursor: end as u64,
            }));
            offset = end;
        }
        if let Some(failure) = tail_error {
            items.push(Err(failure));
        }

        let stream = futures::stream::iter(items);
        if stall {
            Ok(stream.chain(futures::stream::pending()).boxed())
        } else {
            Ok(stream.boxed())
        }
    }
}

struct TestApp {
    manager: Arc<LifecycleManager>,
    bus: Arc<InMemoryBus>,
    source: Arc<SourceScript>,
    artifacts: Arc<FsArtifactStore>,
    shutdown: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    _tmp: TempDir,
}

impl TestApp {
    async fn start(source: SourceScript, settings: OrchestratorSettings, workers: usize) -> Self {
        let tmp = TempDir::new().unwrap();
        let store: Arc<dyn JobStore> =
            Arc::new(SqliteJobStore::new(tmp.path().join("jobs.db")).unwrap());
        let bus = Arc::new(InMemoryBus::new(
            Duration::from_secs(settings.visibility_timeout_secs),
            settings.bus_max_deliveries,
        ));
        let registry = Arc::new(HealthRegistry::new(BreakerConfig {
            failure_threshold: settings.breaker_failure_threshold,
            window: Duration::from_secs(settings.breaker_window_secs),
            cooldown: Duration::from_secs(settings.breaker_cooldown_secs),
        }));
        let manager = Arc::new(LifecycleManager::new(
            store,
            registry,
            EventPublisher::new(bus.clone()),
            settings,
        ));
        let source = Arc::new(source);
        let artifacts = Arc::new(FsArtifactStore::new(tmp.path().join("spool")).await.unwrap());

        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let maintenance = MaintenanceLoop::new(Arc::clone(&manager));
        tasks.push(tokio::spawn({
            let shutdown = shutdown.clone();
            async move { maintenance.run(shutdown).await }
        }));

        for index in 0..workers {
            let worker = TransferWorker::new(
                format!("e2e-worker-{}", index),
                Arc::clone(&manager),
                source.clone() as Arc<dyn FetchSource>,
                artifacts.clone() as Arc<dyn ArtifactStore>,
            );
            tasks.push(tokio::spawn({
                let shutdown = shutdown.clone();
                async move { worker.run(shutdown).await }
            }));
        }

        Self {
            manager,
            bus,
            source,
            artifacts,
            shutdown,
            tasks,
            _tmp: tmp,
        }
    }

    async fn stop(mut self) {
        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
    }

    async fn wait_for_state(&self, job_id: &str, state: JobState) -> JobSnapshot {
        for _ in 0..400 {
            let snapshot = self.manager.get_status(job_id).await.unwrap();
            if snapshot.state == state {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("job {} never reached {:?}", job_id, state);
    }
}

fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        retry_base_delay_secs: 0,
        retry_max_delay_secs: 0,
        lease_ttl_secs: 2,
        heartbeat_interval_secs: 1,
        poll_interval_secs: 1,
        checkpoint_interval_bytes: 4,
        maintenance_interval_secs: 1,
        ..Default::default()
    }
}

fn hex_sha256(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[tokio::test]
async fn test_submit_to_completion() {
    let data = b"some perfectly ordinary payload bytes".to_vec();
    let app = TestApp::start(
        SourceScript::new(data.clone(), 8, vec![AttemptPlan::Complete]),
        fast_settings(),
        1,
    )
    .await;

    let job_id = app
        .manager
        .submit(
            "content://simple",
            5,
            serde_json::json!({"audio_only": false}),
            Some("e2e-user".to_string()),
        )
        .await
        .unwrap();

    let snapshot = app.wait_for_state(&job_id, JobState::Completed).await;
    assert_eq!(snapshot.bytes_done, data.len() as u64);

    let artifact_ref = snapshot.artifact_ref.expect("artifact persisted");
    let on_disk = tokio::fs::read(&artifact_ref).await.unwrap();
    assert_eq!(on_disk, data);

    app.stop().await;
}

#[tokio::test]
async fn test_transient_failure_retries_and_resumes_from_checkpoint() {
    let data: Vec<u8> = (0..128).map(|i| (i % 251) as u8).collect();
    let app = TestApp::start(
        SourceScript::new(
            data.clone(),
            4,
            vec![
                AttemptPlan::FailAfter(
                    64,
                    FetchFailure::new(FetchErrorKind::Connection, "reset by peer"),
                ),
                AttemptPlan::Complete,
            ],
        ),
        fast_settings(),
        1,
    )
    .await;

    let job_id = app
        .manager
        .submit("content://resumable", 5, serde_json::Value::Null, None)
        .await
        .unwrap();

    let snapshot = app.wait_for_state(&job_id, JobState::Completed).await;
    assert_eq!(snapshot.attempt_count, 1, "one failed attempt on the books");

    let cursors = app.source.cursors();
    assert_eq!(cursors.len(), 2);
    assert_eq!(cursors[0], 0);
    assert!(
        cursors[1] >= 60,
        "second attempt resumed near the failure point, got {:?}",
        cursors
    );

    let artifact_ref = snapshot.artifact_ref.unwrap();
    assert_eq!(tokio::fs::read(&artifact_ref).await.unwrap(), data);

    app.stop().await;
}

#[tokio::test]
async fn test_exhausted_attempts_reach_failed_terminal_and_dead_letter() {
    let failure = FetchFailure::new(FetchErrorKind::Timeout, "always times out");
    let app = TestApp::start(
        SourceScript::new(
            (0..32u8).collect(),
            4,
            vec![
                AttemptPlan::FailAfter(8, failure.clone()),
                AttemptPlan::FailAfter(8, failure.clone()),
            ],
        ),
        OrchestratorSettings {
            max_attempts: 2,
            ..fast_settings()
        },
        1,
    )
    .await;

    let mut dead_letters = app.bus.subscribe(topics::JOB_DEAD_LETTER, "e2e").await;

    let job_id = app
        .manager
        .submit("content://doomed", 5, serde_json::Value::Null, None)
        .await
        .unwrap();

    let snapshot = app.wait_for_state(&job_id, JobState::FailedTerminal).await;
    assert_eq!(snapshot.attempt_count, 2);
    assert_eq!(snapshot.last_error.unwrap().kind, FetchErrorKind::Timeout);

    // The dead-letter topic carries the terminal failure for inspection
    let message = tokio::time::timeout(Duration::from_secs(5), dead_letters.next())
        .await
        .expect("dead-letter event published");
    assert_eq!(message.payload["type"], "dead_lettered");
    assert_eq!(message.payload["job_id"], job_id);
    app.bus.ack(&message.delivery_id).await.unwrap();

    // And the job is never re-enqueued afterwards
    tokio::time::sleep(Duration::from_secs(2)).await;
    let snapshot = app.manager.get_status(&job_id).await.unwrap();
    assert_eq!(snapshot.state, JobState::FailedTerminal);
    assert_eq!(snapshot.attempt_count, 2);

    app.stop().await;
}

#[tokio::test]
async fn test_cancel_running_job_aborts_within_bound() {
    let app = TestApp::start(
        SourceScript::new(
            (0..64u8).collect(),
            4,
            vec![AttemptPlan::StallAfter(16)],
        ),
        fast_settings(),
        1,
    )
    .await;

    let job_id = app
        .manager
        .submit("content://hung", 5, serde_json::Value::Null, None)
        .await
        .unwrap();

    app.wait_for_state(&job_id, JobState::Running).await;
    // Let the stalled transfer spool its first bytes
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = std::time::Instant::now();
    app.manager.cancel(&job_id).await.unwrap();
    let snapshot = app.wait_for_state(&job_id, JobState::Cancelled).await;

    assert!(
        started.elapsed() < Duration::from_secs(5),
        "cancellation latency within bound"
    );
    assert!(snapshot.artifact_ref.is_none(), "never Completed");
    assert!(snapshot.checkpoint_cursor.is_none(), "checkpoint discarded");

    app.stop().await;
}

#[tokio::test]
async fn test_pause_preserves_checkpoint_and_resume_continues() {
    let data: Vec<u8> = (0..64).map(|i| (7 * i % 256) as u8).collect();
    let app = TestApp::start(
        SourceScript::new(
            data.clone(),
            4,
            vec![AttemptPlan::StallAfter(24), AttemptPlan::Complete],
        ),
        fast_settings(),
        1,
    )
    .await;

    let job_id = app
        .manager
        .submit("content://pausable", 5, serde_json::Value::Null, None)
        .await
        .unwrap();

    app.wait_for_state(&job_id, JobState::Running).await;
    // Wait until at least one checkpoint landed
    for _ in 0..100 {
        let snapshot = app.manager.get_status(&job_id).await.unwrap();
        if snapshot.checkpoint_cursor.unwrap_or(0) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    app.manager.pause(&job_id).await.unwrap();
    let paused = app.wait_for_state(&job_id, JobState::Paused).await;
    let paused_cursor = paused.checkpoint_cursor.expect("checkpoint preserved");
    assert!(paused_cursor > 0);
    assert_eq!(paused.attempt_count, 0, "pause is attempt-neutral");

    app.manager.resume(&job_id).await.unwrap();
    let snapshot = app.wait_for_state(&job_id, JobState::Completed).await;
    assert_eq!(snapshot.bytes_done, data.len() as u64);
    assert_eq!(tokio::fs::read(snapshot.artifact_ref.unwrap()).await.unwrap(), data);

    let cursors = app.source.cursors();
    assert_eq!(cursors[0], 0);
    assert!(
        cursors[1] > 0 && cursors[1] <= paused_cursor,
        "resume continued from the persisted checkpoint: {:?}",
        cursors
    );

    app.stop().await;
}

#[tokio::test]
async fn test_crashed_worker_claim_is_reclaimed_and_transfer_resumes() {
    let data: Vec<u8> = (0..40u8).collect();
    let app = TestApp::start(
        SourceScript::new(data.clone(), 4, vec![AttemptPlan::Complete]),
        fast_settings(),
        0, // no live workers yet: we play the crashing worker ourselves
    )
    .await;

    let job_id = app
        .manager
        .submit("content://orphaned", 5, serde_json::Value::Null, None)
        .await
        .unwrap();

    // A worker claims the job, makes progress, then crashes: no heartbeat,
    // no release, just silence.
    let claimed = app
        .manager
        .next_job("doomed-worker")
        .await
        .unwrap()
        .expect("job claimed");
    assert_eq!(claimed.job.id, job_id);

    let progress = &data[..8];
    app.artifacts.append_spool(&job_id, progress).await.unwrap();
    app.manager
        .report_progress(
            &job_id,
            "doomed-worker",
            Checkpoint {
                cursor: 8,
                digest: hex_sha256(progress),
            },
            8,
        )
        .await
        .unwrap();

    // The lease (2s) lapses; the maintenance loop returns the job to the
    // queue with its checkpoint intact and no attempt-count penalty.
    let reclaimed = app.wait_for_state(&job_id, JobState::Pending).await;
    assert_eq!(reclaimed.checkpoint_cursor, Some(8));
    assert_eq!(reclaimed.attempt_count, 0);

    // A healthy worker picks it up and finishes from the checkpoint.
    let worker = TransferWorker::new(
        "healthy-worker".to_string(),
        Arc::clone(&app.manager),
        app.source.clone() as Arc<dyn FetchSource>,
        app.artifacts.clone() as Arc<dyn ArtifactStore>,
    );
    let shutdown = app.shutdown.clone();
    let handle = tokio::spawn(async move { worker.run(shutdown).await });

    let snapshot = app.wait_for_state(&job_id, JobState::Completed).await;
    assert_eq!(snapshot.bytes_done, data.len() as u64);
    assert_eq!(tokio::fs::read(snapshot.artifact_ref.unwrap()).await.unwrap(), data);

    assert_eq!(
        app.source.cursors(),
        vec![8],
        "the only fetch resumed from the crashed worker's checkpoint"
    );

    app.shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    app.stop().await;
}

#[tokio::test]
async fn test_priority_order_with_fifo_ties() {
    // Start with no workers so the queue builds up
    let app = TestApp::start(
        SourceScript::new(b"x".to_vec(), 1, vec![]),
        fast_settings(),
        0,
    )
    .await;

    // C and B share a priority; C is created first. A is lower priority.
    let c = app
        .manager
        .submit("content://c", 10, serde_json::Value::Null, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await; // coarse created_at tick
    let b = app
        .manager
        .submit("content://b", 10, serde_json::Value::Null, None)
        .await
        .unwrap();
    let a = app
        .manager
        .submit("content://a", 5, serde_json::Value::Null, None)
        .await
        .unwrap();

    assert_eq!(
        app.manager.get_status(&c).await.unwrap().queue_position,
        Some(1)
    );
    assert_eq!(
        app.manager.get_status(&b).await.unwrap().queue_position,
        Some(2)
    );
    assert_eq!(
        app.manager.get_status(&a).await.unwrap().queue_position,
        Some(3)
    );

    // One worker drains them in order
    let worker = TransferWorker::new(
        "drain-worker".to_string(),
        Arc::clone(&app.manager),
        app.source.clone() as Arc<dyn FetchSource>,
        app.artifacts.clone() as Arc<dyn ArtifactStore>,
    );
    let shutdown = app.shutdown.clone();
    let handle = tokio::spawn(async move { worker.run(shutdown).await });

    app.wait_for_state(&a, JobState::Completed).await;
    app.wait_for_state(&b, JobState::Completed).await;
    app.wait_for_state(&c, JobState::Completed).await;

    let resources: Vec<String> = app.source.calls().into_iter().map(|(r, _)| r).collect();
    assert_eq!(
        resources,
        vec![
            "content://c".to_string(),
            "content://b".to_string(),
            "content://a".to_string()
        ]
    );

    app.shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    app.stop().await;
}

#[tokio::test]
async fn test_job_record_round_trips_across_restart() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("jobs.db");

    let job_id = {
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(&db_path).unwrap());
        let bus = Arc::new(InMemoryBus::new(Duration::from_secs(30), 5));
        let manager = LifecycleManager::new(
            store,
            Arc::new(HealthRegistry::with_defaults()),
            EventPublisher::new(bus),
            OrchestratorSettings::default(),
        );

        let job_id = manager
            .submit(
                "content://durable",
                42,
                serde_json::json!({"quality": "high"}),
                Some("restart-user".to_string()),
            )
            .await
            .unwrap();

        // Leave a claimed, checkpointed job behind, as a crash would
        let claimed = manager.next_job("pre-restart-worker").await.unwrap().unwrap();
        assert_eq!(claimed.job.id, job_id);
        manager
            .report_progress(
                &job_id,
                "pre-restart-worker",
                Checkpoint {
                    cursor: 1234,
                    digest: "feedbeef".to_string(),
                },
                1234,
            )
            .await
            .unwrap();
        job_id
    };

    // "Restart": fresh store handle over the same file
    let store = SqliteJobStore::new(&db_path).unwrap();
    let job = store.get(&job_id).unwrap().expect("record survives restart");

    assert_eq!(job.resource, "content://durable");
    assert_eq!(job.priority, 42);
    assert_eq!(job.state, JobState::Running);
    assert_eq!(job.attempt_count, 0);
    assert_eq!(job.claimed_by.as_deref(), Some("pre-restart-worker"));
    assert_eq!(
        job.checkpoint,
        Some(Checkpoint {
            cursor: 1234,
            digest: "feedbeef".to_string()
        })
    );
    assert_eq!(job.bytes_done, 1234);
    assert_eq!(job.options["quality"], "high");
    assert_eq!(job.requested_by.as_deref(), Some("restart-user"));
}
