//! locsync daemon entry point.
//!
//! Loads configuration, opens the database, wires the sync engine to its
//! collaborators, starts the scheduler and the task runner, and handles
//! graceful shutdown.

mod runner;
mod scheduler;
mod signals;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use locsync_core::config::AppConfig;
use locsync_core::db::Database;
use locsync_core::dispatch::{SqliteTaskQueue, TaskQueue};
use locsync_core::lock::{LockBackend, ResourceLock, SqliteLocks};
use locsync_core::stats::TranslatedResourceStats;
use locsync_core::vcs::GitBackend;
use locsync_core::SyncEngine;

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// locsync reconciliation daemon.
#[derive(Parser, Debug)]
#[command(
    name = "locsync-daemon",
    version,
    about = "Reconciles translation databases with version-controlled locale files"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

/// Wire a [`SyncEngine`] to the collaborators named by `config`.
pub(crate) fn build_engine(
    config: &AppConfig,
    db: Arc<Database>,
    lock_backend: Arc<dyn LockBackend>,
    queue: Arc<dyn TaskQueue>,
) -> SyncEngine {
    let locks = ResourceLock::new(
        lock_backend,
        config.sync.task_timeout(),
        config.sync.lock_poll_interval(),
        config.sync.lock_wait_timeout(),
    );
    let vcs = Arc::new(GitBackend::new(config.checkouts_dir(), &config.vcs));
    SyncEngine::new(
        db,
        locks,
        queue,
        vcs,
        Arc::new(TranslatedResourceStats),
        &config.vcs.source_directory,
    )
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = AppConfig::load_and_resolve(&args.config).context("failed to load configuration")?;

    // Initialize tracing
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .init();

    // Startup banner
    info!("========================================");
    info!("  locsync daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file   : {}", args.config.display());
    info!("Data dir      : {}", config.daemon.data_dir.display());
    info!("Checkouts     : {}", config.checkouts_dir().display());
    info!("Poll interval : {}s", config.daemon.poll_interval_secs);
    info!("Workers       : {}", config.daemon.worker_concurrency);
    info!("Task timeout  : {}s", config.sync.task_timeout_secs);
    info!("Log level     : {}", log_level);
    info!("========================================");

    std::fs::create_dir_all(&config.daemon.data_dir).context("failed to create data directory")?;
    std::fs::create_dir_all(config.checkouts_dir()).context("failed to create checkouts directory")?;

    // Initialize database
    let db_path = config.database_path();
    let db = Database::new(&db_path).context("failed to open database")?;
    db.initialize()
        .context("failed to initialize database schema")?;
    // Lock rows are written on their own connection so a held lock never
    // waits behind the engine's open transaction.
    let lock_db = Database::new(&db_path).context("failed to open lock database connection")?;
    info!("Database initialized at {}", db_path.display());

    let db = Arc::new(db);
    let (queue, receiver) = SqliteTaskQueue::new(db.clone());
    let queue = Arc::new(queue);
    let engine = Arc::new(build_engine(
        &config,
        db,
        Arc::new(SqliteLocks::new(Arc::new(lock_db))),
        queue.clone(),
    ));
    info!("Sync engine initialized");

    // Tasks left unacknowledged by the previous process run again.
    let redelivered = queue
        .redeliver()
        .context("failed to redeliver pending tasks")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start the runner
    let runner = runner::Runner::new(
        engine.clone(),
        queue,
        receiver,
        config.daemon.worker_concurrency,
        config.sync.task_timeout(),
    );
    let runner_stats = runner.stats();
    let runner_handle = tokio::spawn(runner.run(shutdown_rx.clone()));

    // Start the scheduler
    let mut sched = scheduler::Scheduler::new(engine.clone(), &config);
    let scheduler_stats = sched.stats();
    let scheduler_shutdown = shutdown_rx.clone();
    let scheduler_handle = tokio::spawn(async move {
        sched.run(scheduler_shutdown).await;
    });

    let signal = signals::wait_for_shutdown().await;
    info!(%signal, "shutdown signal received, stopping...");

    let _ = shutdown_tx.send(true);

    // Give in-flight work up to 10s to finish.
    let stopped = tokio::time::timeout(Duration::from_secs(10), async {
        let (scheduler, runner) = tokio::join!(scheduler_handle, runner_handle);
        if let Err(e) = scheduler {
            warn!("scheduler task error: {}", e);
        }
        if let Err(e) = runner {
            warn!("runner task error: {}", e);
        }
    })
    .await;
    match stopped {
        Ok(()) => info!("scheduler and runner stopped gracefully"),
        Err(_) => warn!("in-flight tasks did not finish within 10s, forcing shutdown"),
    }

    info!(
        redelivered,
        runs = scheduler_stats.total_runs(),
        run_errors = scheduler_stats.total_errors(),
        tasks_executed = runner_stats.executed(),
        tasks_failed = runner_stats.failed(),
        tasks_timed_out = runner_stats.timed_out(),
        "locsync daemon stopped"
    );
    Ok(())
}
