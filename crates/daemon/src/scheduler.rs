//! Run scheduler that starts reconciliation runs on a configurable interval.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

use locsync_core::config::AppConfig;
use locsync_core::dispatch::SyncOptions;
use locsync_core::SyncEngine;

/// Tracks aggregate statistics across runs.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    total_runs: AtomicU64,
    total_errors: AtomicU64,
    consecutive_errors: AtomicU64,
}

impl SchedulerStats {
    pub fn total_runs(&self) -> u64 {
        self.total_runs.load(Ordering::SeqCst)
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors.load(Ordering::SeqCst)
    }
}

/// The run scheduler.
///
/// Starting a run only records it and queues the coordinator tasks, so it
/// is quick; if the previous start is still in progress the tick is skipped
/// rather than queued.
pub struct Scheduler {
    engine: Arc<SyncEngine>,
    poll_interval: Duration,
    run_on_startup: bool,
    options: SyncOptions,
    projects: Vec<String>,
    running: Arc<AtomicBool>,
    stats: Arc<SchedulerStats>,
}

impl Scheduler {
    pub fn new(engine: Arc<SyncEngine>, config: &AppConfig) -> Self {
        Self {
            engine,
            poll_interval: Duration::from_secs(config.daemon.poll_interval_secs),
            run_on_startup: config.daemon.run_on_startup,
            options: config.sync.default_options(),
            projects: config.sync.projects.clone(),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    /// Main scheduler loop. Returns once shutdown is signalled.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            run_on_startup = self.run_on_startup,
            projects = ?self.projects,
            "scheduler started"
        );

        let mut interval = time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately.
        if !self.run_on_startup {
            interval.tick().await;
        }

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.maybe_start_run("scheduled");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Start a run in the background unless one is still starting.
    /// Returns whether a run was started.
    pub fn maybe_start_run(&self, trigger: &str) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(trigger, "skipping run: previous run still starting");
            return false;
        }

        let run_num = self.stats.total_runs.fetch_add(1, Ordering::SeqCst) + 1;
        info!(run = run_num, trigger, "starting reconciliation run");

        let engine = self.engine.clone();
        let options = self.options;
        let projects = self.projects.clone();
        let running = self.running.clone();
        let stats = self.stats.clone();
        tokio::spawn(async move {
            let result =
                tokio::task::spawn_blocking(move || engine.start_run(options, &projects)).await;
            match result {
                Ok(Ok(sync_log)) => {
                    stats.consecutive_errors.store(0, Ordering::SeqCst);
                    info!(run = run_num, sync_log_id = sync_log.id, "run queued");
                }
                Ok(Err(e)) => record_failure(&stats, run_num, &e.to_string()),
                Err(e) => record_failure(&stats, run_num, &e.to_string()),
            }
            running.store(false, Ordering::SeqCst);
        });
        true
    }
}

fn record_failure(stats: &SchedulerStats, run_num: u64, error: &str) {
    let errors = stats.total_errors.fetch_add(1, Ordering::SeqCst) + 1;
    let consecutive = stats.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
    error!(
        run = run_num,
        error,
        total_errors = errors,
        consecutive_errors = consecutive,
        "failed to start run"
    );
}
