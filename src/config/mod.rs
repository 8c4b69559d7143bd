mod file_config;

pub use file_config::{FileConfig, OrchestratorConfig};

use anyhow::{bail, Result};
use std::path::PathBuf;

/// CLI arguments that take part in config resolution. TOML values override
/// CLI values where present.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub spool_dir: Option<PathBuf>,
    pub source_url: Option<String>,
    pub source_timeout_secs: u64,
}

/// Fully resolved application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    pub spool_dir: PathBuf,
    pub source_url: Option<String>,
    pub source_timeout_secs: u64,
    pub orchestrator: OrchestratorSettings,
}

/// Tuning knobs for the queue, workers, bus, and breaker.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Inclusive priority bounds accepted at submission.
    pub min_priority: i32,
    pub max_priority: i32,
    /// Execution attempts before a job fails terminally.
    pub max_attempts: i32,
    /// Exponential backoff base and ceiling.
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    /// Claim lease duration. Heartbeats must land well inside it.
    pub lease_ttl_secs: i64,
    pub heartbeat_interval_secs: u64,
    /// Worker idle poll interval when the queue is empty or deferred.
    pub poll_interval_secs: u64,
    /// Bus redelivery knobs.
    pub visibility_timeout_secs: u64,
    pub bus_max_deliveries: u32,
    /// Circuit breaker knobs.
    pub breaker_failure_threshold: usize,
    pub breaker_window_secs: u64,
    pub breaker_cooldown_secs: u64,
    /// Number of in-process transfer workers.
    pub worker_count: usize,
    /// Persist a checkpoint after roughly this many new bytes.
    pub checkpoint_interval_bytes: u64,
    pub audit_retention_days: u64,
    pub maintenance_interval_secs: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            min_priority: 0,
            max_priority: 100,
            max_attempts: 5,
            retry_base_delay_secs: 1,
            retry_max_delay_secs: 60,
            lease_ttl_secs: 60,
            heartbeat_interval_secs: 20,
            poll_interval_secs: 1,
            visibility_timeout_secs: 30,
            bus_max_deliveries: 5,
            breaker_failure_threshold: 5,
            breaker_window_secs: 60,
            breaker_cooldown_secs: 30,
            worker_count: 4,
            checkpoint_interval_bytes: 1024 * 1024,
            audit_retention_days: 90,
            maintenance_interval_secs: 5,
        }
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let spool_dir = file
            .spool_dir
            .map(PathBuf::from)
            .or_else(|| cli.spool_dir.clone())
            .unwrap_or_else(|| db_dir.join("spool"));

        let source_url = file.source_url.clone().or_else(|| cli.source_url.clone());
        let source_timeout_secs = file.source_timeout_secs.unwrap_or(cli.source_timeout_secs);

        let defaults = OrchestratorSettings::default();
        let orch_file = file.orchestrator.unwrap_or_default();
        let orchestrator = OrchestratorSettings {
            min_priority: orch_file.min_priority.unwrap_or(defaults.min_priority),
            max_priority: orch_file.max_priority.unwrap_or(defaults.max_priority),
            max_attempts: orch_file.max_attempts.unwrap_or(defaults.max_attempts),
            retry_base_delay_secs: orch_file
                .retry_base_delay_secs
                .unwrap_or(defaults.retry_base_delay_secs),
            retry_max_delay_secs: orch_file
                .retry_max_delay_secs
                .unwrap_or(defaults.retry_max_delay_secs),
            lease_ttl_secs: orch_file.lease_ttl_secs.unwrap_or(defaults.lease_ttl_secs),
            heartbeat_interval_secs: orch_file
                .heartbeat_interval_secs
                .unwrap_or(defaults.heartbeat_interval_secs),
            poll_interval_secs: orch_file
                .poll_interval_secs
                .unwrap_or(defaults.poll_interval_secs),
            visibility_timeout_secs: orch_file
                .visibility_timeout_secs
                .unwrap_or(defaults.visibility_timeout_secs),
            bus_max_deliveries: orch_file
                .bus_max_deliveries
                .unwrap_or(defaults.bus_max_deliveries),
            breaker_failure_threshold: orch_file
                .breaker_failure_threshold
                .unwrap_or(defaults.breaker_failure_threshold),
            breaker_window_secs: orch_file
                .breaker_window_secs
                .unwrap_or(defaults.breaker_window_secs),
            breaker_cooldown_secs: orch_file
                .breaker_cooldown_secs
                .unwrap_or(defaults.breaker_cooldown_secs),
            worker_count: orch_file.worker_count.unwrap_or(defaults.worker_count),
            checkpoint_interval_bytes: orch_file
                .checkpoint_interval_bytes
                .unwrap_or(defaults.checkpoint_interval_bytes),
            audit_retention_days: orch_file
                .audit_retention_days
                .unwrap_or(defaults.audit_retention_days),
            maintenance_interval_secs: orch_file
                .maintenance_interval_secs
                .unwrap_or(defaults.maintenance_interval_secs),
        };

        orchestrator.validate()?;

        Ok(AppConfig {
            db_dir,
            spool_dir,
            source_url,
            source_timeout_secs,
            orchestrator,
        })
    }
}

impl OrchestratorSettings {
    /// Reject configurations that cannot keep claims alive or make no sense.
    pub fn validate(&self) -> Result<()> {
        if self.min_priority > self.max_priority {
            bail!(
                "min_priority {} exceeds max_priority {}",
                self.min_priority,
                self.max_priority
            );
        }
        if self.max_attempts < 1 {
            bail!("max_attempts must be at least 1");
        }
        if self.lease_ttl_secs <= 0 {
            bail!("lease_ttl_secs must be positive");
        }
        // Renewal must land strictly inside the lease or every slow
        // heartbeat loses the claim.
        if self.heartbeat_interval_secs >= self.lease_ttl_secs as u64 {
            bail!(
                "heartbeat_interval_secs {} must be shorter than lease_ttl_secs {}",
                self.heartbeat_interval_secs,
                self.lease_ttl_secs
            );
        }
        if self.retry_max_delay_secs < self.retry_base_delay_secs {
            bail!(
                "retry_max_delay_secs {} is below retry_base_delay_secs {}",
                self.retry_max_delay_secs,
                self.retry_base_delay_secs
            );
        }
        if self.worker_count == 0 {
            bail!("worker_count must be at least 1");
        }
        Ok(())
    }
}
