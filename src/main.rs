use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use staffetta::breaker::{BreakerConfig, HealthRegistry};
use staffetta::bus::InMemoryBus;
use staffetta::config::{AppConfig, CliConfig, FileConfig};
use staffetta::events::EventPublisher;
use staffetta::job_store::{JobStore, SqliteJobStore};
use staffetta::lifecycle::{LifecycleManager, MaintenanceLoop};
use staffetta::metrics::{self, MetricsAggregator};
use staffetta::transfer::{FsArtifactStore, HttpFetchSource, TransferWorker};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[command(version, about = "Resilient content-fetch job orchestration daemon")]
struct CliArgs {
    /// Directory holding the job queue database.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Directory for transfer spools and finalized artifacts.
    /// Defaults to <db_dir>/spool.
    #[clap(long, value_parser = parse_path)]
    pub spool_dir: Option<PathBuf>,

    /// Base URL of the external content service.
    #[clap(long)]
    pub source_url: Option<String>,

    /// Connect timeout for the content service, in seconds.
    #[clap(long, default_value = "30")]
    pub source_timeout_secs: u64,

    /// Optional TOML config file; values there override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "staffetta {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH")
    );

    let args = CliArgs::parse();

    let file_config = match &args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let cli_config = CliConfig {
        db_dir: args.db_dir.clone(),
        spool_dir: args.spool_dir.clone(),
        source_url: args.source_url.clone(),
        source_timeout_secs: args.source_timeout_secs,
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;
    let settings = config.orchestrator.clone();

    metrics::init_metrics();

    let store: Arc<dyn JobStore> = Arc::new(
        SqliteJobStore::new(config.db_dir.join("jobs.db"))
            .context("Failed to open job queue database")?,
    );

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
        settings.clone(),
    ));

    let source = Arc::new(
        HttpFetchSource::new(config.source_url.clone(), config.source_timeout_secs)
            .context("Failed to build fetch client")?,
    );
    let artifacts = Arc::new(
        FsArtifactStore::new(config.spool_dir.clone())
            .await
            .context("Failed to prepare spool directory")?,
    );

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    let aggregator = MetricsAggregator::new(bus.clone());
    tasks.push(tokio::spawn({
        let shutdown = shutdown.clone();
        async move { aggregator.run(shutdown).await }
    }));

    let maintenance = MaintenanceLoop::new(Arc::clone(&manager));
    tasks.push(tokio::spawn({
        let shutdown = shutdown.clone();
        async move { maintenance.run(shutdown).await }
    }));

    for index in 0..settings.worker_count {
        let worker = TransferWorker::new(
            format!("worker-{}-{}", index, uuid::Uuid::new_v4()),
            Arc::clone(&manager),
            source.clone(),
            artifacts.clone(),
        );
        tasks.push(tokio::spawn({
            let shutdown = shutdown.clone();
            async move { worker.run(shutdown).await }
        }));
    }

    info!(
        "Orchestrator up: {} workers, db {:?}, spool {:?}, source {:?}",
        settings.worker_count, config.db_dir, config.spool_dir, config.source_url
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received, draining workers");
    shutdown.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            error!("Task ended abnormally during shutdown: {}", e);
        }
    }

    info!("Shutdown complete");
    Ok(())
}
