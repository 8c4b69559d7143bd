//! Background maintenance for the queue.
//!
//! One periodic loop covers the deferred work the manager cannot do
//! inline: promoting retry-waiting jobs whose backoff elapsed, voiding
//! lapsed claims so crashed workers' jobs return to the queue, and
//! pruning old audit entries.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::manager::LifecycleManager;

/// Ticks the queue's deferred transitions until shutdown.
pub struct MaintenanceLoop {
    manager: Arc<LifecycleManager>,
    interval: Duration,
    /// Audit pruning runs on a multiple of the base interval.
    prune_every_ticks: u64,
}

impl MaintenanceLoop {
    pub fn new(manager: Arc<LifecycleManager>) -> Self {
        let interval = Duration::from_secs(manager.settings().maintenance_interval_secs.max(1));
        Self {
            manager,
            interval,
            prune_every_ticks: 720,
        }
    }

    /// Main loop - call from a spawned task.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Maintenance loop starting (interval={}s)",
            self.interval.as_secs()
        );

        // Recover immediately on startup: a restart is exactly when stale
        // claims from the previous run need reaping.
        self.tick().await;

        let mut ticks: u64 = 0;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.cancelled() => {
                    info!("Maintenance loop shutting down");
                    break;
                }
            }

            self.tick().await;
            ticks += 1;

            if ticks % self.prune_every_ticks == 0 {
                match self.manager.prune_audit().await {
                    Ok(0) => {}
                    Ok(n) => info!("Pruned {} old audit entries", n),
                    Err(e) => error!("Audit pruning failed: {}", e),
                }
            }
        }
    }

    async fn tick(&self) {
        match self.manager.reclaim_expired().await {
            Ok(0) => {}
            Ok(n) => info!("Reclaimed {} jobs from expired claims", n),
            Err(e) => error!("Claim reaping failed: {}", e),
        }

        match self.manager.promote_due_retries().await {
            Ok(0) => {}
            Ok(n) => debug!("Promoted {} jobs from retry backoff", n),
            Err(e) => error!("Retry promotion failed: {}", e),
        }
    }
}
