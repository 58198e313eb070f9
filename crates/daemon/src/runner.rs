//! Task runner: executes queued engine tasks on the blocking pool.
//!
//! At most `concurrency` tasks run at once. Each task gets `task_timeout` of
//! wall-clock time; a task that exceeds it is abandoned and never retried.
//! The blocking thread it ran on keeps going until the engine returns, and
//! its locks expire with their lease.
//!
//! A task is acknowledged on the queue only once the engine has returned,
//! so tasks in flight when the daemon stops are delivered again on restart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use locsync_core::dispatch::{TaskEnvelope, TaskQueue};
use locsync_core::SyncEngine;

/// Counters across every task the runner has handled.
#[derive(Debug, Default)]
pub struct RunnerStats {
    executed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

impl RunnerStats {
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn timed_out(&self) -> u64 {
        self.timed_out.load(Ordering::SeqCst)
    }
}

pub struct Runner {
    engine: Arc<SyncEngine>,
    queue: Arc<dyn TaskQueue>,
    receiver: mpsc::UnboundedReceiver<TaskEnvelope>,
    concurrency: usize,
    task_timeout: Duration,
    stats: Arc<RunnerStats>,
}

impl Runner {
    pub fn new(
        engine: Arc<SyncEngine>,
        queue: Arc<dyn TaskQueue>,
        receiver: mpsc::UnboundedReceiver<TaskEnvelope>,
        concurrency: usize,
        task_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            queue,
            receiver,
            concurrency: concurrency.max(1),
            task_timeout,
            stats: Arc::new(RunnerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<RunnerStats> {
        self.stats.clone()
    }

    /// Receive and execute tasks until shutdown is signalled or every
    /// sender is gone, then wait for in-flight tasks.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            concurrency = self.concurrency,
            task_timeout_secs = self.task_timeout.as_secs(),
            "runner started"
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                permit = semaphore.clone().acquire_owned() => {
                    let Ok(permit) = permit else { break };
                    tokio::select! {
                        envelope = self.receiver.recv() => match envelope {
                            Some(envelope) => {
                                in_flight.spawn(execute(
                                    self.engine.clone(),
                                    self.queue.clone(),
                                    envelope,
                                    self.task_timeout,
                                    self.stats.clone(),
                                    permit,
                                ));
                            }
                            None => {
                                info!("task queue closed");
                                break;
                            }
                        },
                        _ = shutdown.changed() => break,
                    }
                }
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }

        if !in_flight.is_empty() {
            info!(in_flight = in_flight.len(), "waiting for in-flight tasks");
        }
        while in_flight.join_next().await.is_some() {}
        info!(
            executed = self.stats.executed(),
            failed = self.stats.failed(),
            timed_out = self.stats.timed_out(),
            "runner stopped"
        );
    }
}

async fn execute(
    engine: Arc<SyncEngine>,
    queue: Arc<dyn TaskQueue>,
    envelope: TaskEnvelope,
    task_timeout: Duration,
    stats: Arc<RunnerStats>,
    _permit: OwnedSemaphorePermit,
) {
    let TaskEnvelope { message_id, task, .. } = envelope;
    let name = task.name();
    debug!(message_id = %message_id, task = name, "executing task");

    let mut handle = tokio::task::spawn_blocking(move || engine.execute(&task));
    match tokio::time::timeout(task_timeout, &mut handle).await {
        Ok(Ok(Ok(()))) => {
            stats.executed.fetch_add(1, Ordering::SeqCst);
            debug!(message_id = %message_id, task = name, "task completed");
        }
        Ok(Ok(Err(e))) => {
            stats.failed.fetch_add(1, Ordering::SeqCst);
            error!(message_id = %message_id, task = name, error = %e, "task failed");
        }
        Ok(Err(e)) => {
            stats.failed.fetch_add(1, Ordering::SeqCst);
            error!(message_id = %message_id, task = name, error = %e, "task panicked");
        }
        Err(_) => {
            stats.timed_out.fetch_add(1, Ordering::SeqCst);
            warn!(
                message_id = %message_id,
                task = name,
                timeout_secs = task_timeout.as_secs(),
                "task exceeded its time limit and was abandoned"
            );
            // Release the slot now; acknowledge once the engine gives up.
            tokio::spawn(async move {
                let _ = handle.await;
                acknowledge(queue, message_id).await;
            });
            return;
        }
    }
    acknowledge(queue, message_id).await;
}

async fn acknowledge(queue: Arc<dyn TaskQueue>, message_id: String) {
    let result = tokio::task::spawn_blocking({
        let message_id = message_id.clone();
        move || queue.ack(&message_id)
    })
    .await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(message_id = %message_id, error = %e, "failed to acknowledge task"),
        Err(e) => warn!(message_id = %message_id, error = %e, "acknowledgement panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use locsync_core::config::AppConfig;
    use locsync_core::db::Database;
    use locsync_core::dispatch::{SqliteTaskQueue, SyncOptions, SyncTask};
    use locsync_core::lock::{lock_key, InMemoryLocks, LockBackend, ResourceLock, PROJECT_LOCK};

    struct Harness {
        _dir: tempfile::TempDir,
        db: Arc<Database>,
        engine: Arc<SyncEngine>,
        queue: Arc<SqliteTaskQueue>,
        locks: Arc<InMemoryLocks>,
        receiver: Option<mpsc::UnboundedReceiver<TaskEnvelope>>,
    }

    impl Harness {
        fn runner(&mut self, concurrency: usize, task_timeout: Duration) -> Runner {
            Runner::new(
                self.engine.clone(),
                self.queue.clone(),
                self.receiver.take().unwrap(),
                concurrency,
                task_timeout,
            )
        }
    }

    fn harness() -> Harness {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        harness_on(Arc::new(db))
    }

    /// A daemon process over an existing database, as after a restart.
    fn harness_on(db: Arc<Database>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.daemon.data_dir = dir.path().to_path_buf();
        config.sync.lock_poll_interval_ms = 5;
        config.sync.lock_wait_timeout_secs = 5;

        let (queue, receiver) = SqliteTaskQueue::new(db.clone());
        let queue = Arc::new(queue);
        let locks = Arc::new(InMemoryLocks::new());
        let engine = Arc::new(crate::build_engine(
            &config,
            db.clone(),
            locks.clone(),
            queue.clone(),
        ));
        Harness {
            _dir: dir,
            db,
            engine,
            queue,
            locks,
            receiver: Some(receiver),
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_executes_and_counts_failures() {
        let mut h = harness();
        let project = h.engine.db().create_project("firefox", "Firefox").unwrap();
        let sync_log = h.engine.start_run(SyncOptions::default(), &[]).unwrap();
        // Unknown project: fails with NotFound.
        h.queue
            .submit(SyncTask::SyncProject {
                project_id: project.id + 100,
                sync_log_id: sync_log.id,
                options: SyncOptions::default(),
            })
            .unwrap();

        let runner = h.runner(2, Duration::from_secs(5));
        let stats = runner.stats();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(runner.run(shutdown_rx));

        wait_until(|| stats.executed() + stats.failed() == 2).await;
        assert_eq!(stats.executed(), 1);
        assert_eq!(stats.failed(), 1);
        assert_eq!(stats.timed_out(), 0);

        let logs = h.engine.db().list_project_sync_logs(sync_log.id).unwrap();
        assert_eq!(logs.len(), 1);
        // Failed tasks are acknowledged too.
        wait_until(|| h.queue.pending().unwrap().is_empty()).await;

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_task_exceeding_timeout_is_abandoned() {
        let mut h = harness();
        let project = h.engine.db().create_project("firefox", "Firefox").unwrap();

        // Hold the project lock so the coordinator blocks.
        let blocker = ResourceLock::new(
            h.locks.clone() as Arc<dyn LockBackend>,
            Duration::from_secs(60),
            Duration::from_millis(5),
            Duration::from_secs(1),
        );
        let guard = blocker.acquire(&lock_key(PROJECT_LOCK, &[project.id])).unwrap();

        h.engine.start_run(SyncOptions::default(), &[]).unwrap();
        let runner = h.runner(1, Duration::from_millis(50));
        let stats = runner.stats();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(runner.run(shutdown_rx));

        wait_until(|| stats.timed_out() == 1).await;
        assert_eq!(stats.executed(), 0);
        // Still running on its blocking thread.
        assert_eq!(h.queue.pending().unwrap().len(), 1);

        drop(guard);
        // Once the engine returns, the abandoned task is acknowledged.
        wait_until(|| h.queue.pending().unwrap().is_empty()).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_tasks_survive_a_stopped_runner() {
        let h = harness();
        h.engine.db().create_project("firefox", "Firefox").unwrap();
        let db = h.db.clone();
        let sync_log = h.engine.start_run(SyncOptions::default(), &[]).unwrap();
        // The daemon stops before any task is received.
        drop(h);

        let mut h = harness_on(db);
        assert_eq!(h.queue.redeliver().unwrap(), 1);
        let runner = h.runner(1, Duration::from_secs(5));
        let stats = runner.stats();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(runner.run(shutdown_rx));

        wait_until(|| stats.executed() == 1).await;
        let logs = h.engine.db().list_project_sync_logs(sync_log.id).unwrap();
        assert_eq!(logs.len(), 1);
        wait_until(|| h.queue.pending().unwrap().is_empty()).await;

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stops_on_shutdown_with_empty_queue() {
        let mut h = harness();
        let runner = h.runner(4, Duration::from_secs(5));
        let stats = runner.stats();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(runner.run(shutdown_rx));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.executed(), 0);
    }
}
