//! Work queue for Coordinator and Worker invocations.
//!
//! Dispatch is explicit message submission: the Coordinator does not run
//! Workers itself, it submits one [`SyncTask::SyncRepository`] per
//! repository and returns. Delivery is at-least-once, so every task must be
//! safe to execute twice.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::{fmt_ts, now, ts_column, Database};
use crate::errors::{DatabaseError, DispatchError};

/// Flags accepted by a Coordinator invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Treat the working trees as already up to date.
    pub no_pull: bool,
    /// Persist database edits but do not push to version control.
    pub no_commit: bool,
    /// Reconcile even when nothing appears to have changed.
    pub force: bool,
}

/// One unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncTask {
    SyncProject {
        project_id: i64,
        sync_log_id: i64,
        options: SyncOptions,
    },
    SyncRepository {
        project_id: i64,
        repository_id: i64,
        project_sync_log_id: i64,
        /// Reference time captured by the Coordinator.
        now: DateTime<Utc>,
        no_pull: bool,
        no_commit: bool,
    },
}

impl SyncTask {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SyncProject { .. } => "sync_project",
            Self::SyncRepository { .. } => "sync_repository",
        }
    }
}

/// A submitted task with its delivery metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub message_id: String,
    pub task: SyncTask,
    pub enqueued_at: DateTime<Utc>,
}

impl TaskEnvelope {
    pub fn new(task: SyncTask) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            task,
            enqueued_at: now(),
        }
    }
}

/// Destination for submitted tasks.
pub trait TaskQueue: Send + Sync {
    /// Enqueue `task` and return its message id.
    fn submit(&self, task: SyncTask) -> Result<String, DispatchError>;

    /// Mark a delivered task as handled. Queues without redelivery have
    /// nothing to forget.
    fn ack(&self, _message_id: &str) -> Result<(), DispatchError> {
        Ok(())
    }
}

/// Queue kept in memory until drained. Used for tests and embedding.
#[derive(Default)]
pub struct InMemoryTaskQueue {
    pending: Mutex<VecDeque<TaskEnvelope>>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pop the oldest pending envelope.
    pub fn take(&self) -> Option<TaskEnvelope> {
        self.pending.lock().ok()?.pop_front()
    }

    /// Remove and return every pending envelope, oldest first.
    pub fn drain(&self) -> Vec<TaskEnvelope> {
        match self.pending.lock() {
            Ok(mut pending) => pending.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TaskQueue for InMemoryTaskQueue {
    fn submit(&self, task: SyncTask) -> Result<String, DispatchError> {
        let envelope = TaskEnvelope::new(task);
        let id = envelope.message_id.clone();
        debug!(message_id = %id, task = envelope.task.name(), "queued task");
        self.pending
            .lock()
            .map_err(|_| DispatchError::Poisoned)?
            .push_back(envelope);
        Ok(id)
    }
}

/// Queue persisted in the `task_queue` table and fed to the daemon's
/// runner over a `tokio` channel.
///
/// A row lives until the task is acknowledged, so tasks a stopped runner
/// never finished are delivered again by [`SqliteTaskQueue::redeliver`].
pub struct SqliteTaskQueue {
    db: Arc<Database>,
    sender: mpsc::UnboundedSender<TaskEnvelope>,
}

impl SqliteTaskQueue {
    pub fn new(db: Arc<Database>) -> (Self, mpsc::UnboundedReceiver<TaskEnvelope>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { db, sender }, receiver)
    }

    /// Every unacknowledged envelope, oldest first.
    pub fn pending(&self) -> Result<Vec<TaskEnvelope>, DispatchError> {
        let rows = {
            let conn = self.db.conn();
            let mut stmt = conn
                .prepare("SELECT message_id, task, enqueued_at FROM task_queue ORDER BY id")
                .map_err(DatabaseError::from)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        ts_column(row, 2)?,
                    ))
                })
                .map_err(DatabaseError::from)?;
            let rows: Vec<(String, String, DateTime<Utc>)> = rows
                .collect::<Result<_, _>>()
                .map_err(DatabaseError::from)?;
            rows
        };

        rows.into_iter()
            .map(|(message_id, task, enqueued_at)| {
                Ok(TaskEnvelope {
                    message_id,
                    task: serde_json::from_str(&task)?,
                    enqueued_at,
                })
            })
            .collect()
    }

    /// Send every unacknowledged envelope to the receiver again.
    /// Returns how many were sent.
    pub fn redeliver(&self) -> Result<usize, DispatchError> {
        let pending = self.pending()?;
        let count = pending.len();
        for envelope in pending {
            let name = envelope.task.name();
            self.sender
                .send(envelope)
                .map_err(|_| DispatchError::Closed(name.to_string()))?;
        }
        if count > 0 {
            info!(count, "redelivered unacknowledged tasks");
        }
        Ok(count)
    }
}

impl TaskQueue for SqliteTaskQueue {
    fn submit(&self, task: SyncTask) -> Result<String, DispatchError> {
        let envelope = TaskEnvelope::new(task);
        let id = envelope.message_id.clone();
        let name = envelope.task.name();
        let payload = serde_json::to_string(&envelope.task)?;
        self.db
            .conn()
            .execute(
                "INSERT INTO task_queue (message_id, task, enqueued_at) VALUES (?1, ?2, ?3)",
                params![id, payload, fmt_ts(&envelope.enqueued_at)],
            )
            .map_err(DatabaseError::from)?;

        // The row outlives a stopped receiver; the next runner redelivers it.
        if self.sender.send(envelope).is_err() {
            debug!(message_id = %id, task = name, "runner gone, task left for redelivery");
        } else {
            debug!(message_id = %id, task = name, "submitted task");
        }
        Ok(id)
    }

    fn ack(&self, message_id: &str) -> Result<(), DispatchError> {
        self.db
            .conn()
            .execute(
                "DELETE FROM task_queue WHERE message_id = ?1",
                params![message_id],
            )
            .map_err(DatabaseError::from)?;
        debug!(message_id, "acknowledged task");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn repository_task() -> SyncTask {
        SyncTask::SyncRepository {
            project_id: 1,
            repository_id: 2,
            project_sync_log_id: 3,
            now: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
            no_pull: false,
            no_commit: true,
        }
    }

    #[test]
    fn test_task_json_is_tagged() {
        let json = serde_json::to_value(SyncTask::SyncProject {
            project_id: 1,
            sync_log_id: 9,
            options: SyncOptions {
                force: true,
                ..Default::default()
            },
        })
        .unwrap();
        assert_eq!(json["type"], "sync_project");
        assert_eq!(json["options"]["force"], true);

        let task = repository_task();
        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"type\":\"sync_repository\""));
        let back: SyncTask = serde_json::from_str(&json).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn test_in_memory_queue_is_fifo() {
        let queue = InMemoryTaskQueue::new();
        let first = queue.submit(repository_task()).unwrap();
        let second = queue
            .submit(SyncTask::SyncProject {
                project_id: 1,
                sync_log_id: 1,
                options: SyncOptions::default(),
            })
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.take().unwrap().message_id, first);
        let rest = queue.drain();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].message_id, second);
        assert!(queue.is_empty());
    }

    fn database() -> Arc<Database> {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        Arc::new(db)
    }

    #[test]
    fn test_sqlite_queue_delivers_and_acks() {
        let (queue, mut receiver) = SqliteTaskQueue::new(database());
        let id = queue.submit(repository_task()).unwrap();

        let delivered = receiver.try_recv().unwrap();
        assert_eq!(delivered.message_id, id);
        assert_eq!(delivered.task, repository_task());
        assert_eq!(queue.pending().unwrap(), vec![delivered]);

        queue.ack(&id).unwrap();
        assert!(queue.pending().unwrap().is_empty());
        // Acknowledging twice is harmless.
        queue.ack(&id).unwrap();
    }

    #[test]
    fn test_unacked_tasks_are_redelivered_to_a_new_receiver() {
        let db = database();
        let (queue, receiver) = SqliteTaskQueue::new(db.clone());
        let ids: Vec<String> = (0..3)
            .map(|_| queue.submit(repository_task()).unwrap())
            .collect();
        drop(receiver);
        // Submitting with nobody listening still persists the task.
        let late = queue.submit(repository_task()).unwrap();
        drop(queue);

        let (queue, mut receiver) = SqliteTaskQueue::new(db);
        queue.ack(&ids[1]).unwrap();
        assert_eq!(queue.redeliver().unwrap(), 3);

        let redelivered: Vec<String> = std::iter::from_fn(|| receiver.try_recv().ok())
            .map(|envelope| envelope.message_id)
            .collect();
        assert_eq!(redelivered, vec![ids[0].clone(), ids[2].clone(), late]);
    }

    #[test]
    fn test_redeliver_without_receiver_is_closed() {
        let (queue, receiver) = SqliteTaskQueue::new(database());
        drop(receiver);
        queue.submit(repository_task()).unwrap();
        assert!(matches!(queue.redeliver(), Err(DispatchError::Closed(_))));
    }
}
