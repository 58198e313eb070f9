//! Keyed resource locks serializing Coordinator and Worker invocations.
//!
//! A lock key is built from a template and the invocation's identifiers
//! (see [`lock_key`]). Acquiring a key blocks, by polling the backend, until
//! no other live holder has it. Holders carry a lease: a holder that
//! outlives its lease is treated as abandoned and its key may be taken over.
//!
//! Two backends exist. [`InMemoryLocks`] serves a single process;
//! [`SqliteLocks`] stores leases in the `task_locks` table so every node
//! sharing the database observes the same keys.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::params;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::{fmt_ts, Database};
use crate::errors::{DatabaseError, LockError};

/// Key template for a Coordinator invocation.
pub const PROJECT_LOCK: &str = "project={0}";

/// Key template for a Worker invocation.
pub const REPOSITORY_LOCK: &str = "project={0},repo={1}";

/// Substitute `{0}`, `{1}`, ... in `template` with `args`.
pub fn lock_key(template: &str, args: &[i64]) -> String {
    args.iter()
        .enumerate()
        .fold(template.to_string(), |key, (i, arg)| {
            key.replace(&format!("{{{i}}}"), &arg.to_string())
        })
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// Storage for lock leases.
pub trait LockBackend: Send + Sync {
    /// Try to take `key` for `holder` for at most `lease`. Returns `false`
    /// when another holder has a live lease.
    fn try_acquire(&self, key: &str, holder: &str, lease: Duration) -> Result<bool, LockError>;

    /// Give up `key` if `holder` still owns it.
    fn release(&self, key: &str, holder: &str) -> Result<(), LockError>;
}

/// Process-local lock table.
#[derive(Default)]
pub struct InMemoryLocks {
    held: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockBackend for InMemoryLocks {
    fn try_acquire(&self, key: &str, holder: &str, lease: Duration) -> Result<bool, LockError> {
        let mut held = self.held.lock().map_err(|_| LockError::Poisoned)?;
        let now = Instant::now();
        if let Some((owner, expires)) = held.get(key) {
            if *expires > now {
                return Ok(owner == holder);
            }
            warn!(lock_key = key, previous = %owner, "taking over expired lock");
        }
        held.insert(key.to_string(), (holder.to_string(), now + lease));
        Ok(true)
    }

    fn release(&self, key: &str, holder: &str) -> Result<(), LockError> {
        let mut held = self.held.lock().map_err(|_| LockError::Poisoned)?;
        if held.get(key).is_some_and(|(owner, _)| owner == holder) {
            held.remove(key);
        }
        Ok(())
    }
}

/// Lock table shared through the database.
///
/// Use a dedicated connection: a Worker keeps the engine connection busy
/// inside its per-locale transaction. A busy database is reported as "not
/// acquired" and the caller keeps polling.
pub struct SqliteLocks {
    db: Arc<Database>,
}

impl SqliteLocks {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl LockBackend for SqliteLocks {
    fn try_acquire(&self, key: &str, holder: &str, lease: Duration) -> Result<bool, LockError> {
        let now = Utc::now();
        let expires = now
            + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(365));
        let conn = self.db.conn();
        let result = conn.execute(
            "INSERT INTO task_locks (lock_key, holder, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (lock_key) DO UPDATE
                SET holder = excluded.holder,
                    acquired_at = excluded.acquired_at,
                    expires_at = excluded.expires_at
                WHERE task_locks.expires_at <= excluded.acquired_at
                   OR task_locks.holder = excluded.holder",
            params![key, holder, fmt_ts(&now), fmt_ts(&expires)],
        );
        match result.map_err(DatabaseError::from) {
            Ok(changed) => Ok(changed > 0),
            Err(e) if e.is_busy() => {
                debug!(lock_key = key, "lock table busy");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn release(&self, key: &str, holder: &str) -> Result<(), LockError> {
        let conn = self.db.conn();
        conn.execute(
            "DELETE FROM task_locks WHERE lock_key = ?1 AND holder = ?2",
            params![key, holder],
        )
        .map_err(DatabaseError::from)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ResourceLock
// ---------------------------------------------------------------------------

/// Blocking acquirer over a [`LockBackend`].
#[derive(Clone)]
pub struct ResourceLock {
    backend: Arc<dyn LockBackend>,
    lease: Duration,
    poll_interval: Duration,
    wait_timeout: Duration,
}

impl ResourceLock {
    pub fn new(
        backend: Arc<dyn LockBackend>,
        lease: Duration,
        poll_interval: Duration,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            lease,
            poll_interval,
            wait_timeout,
        }
    }

    /// Block until `key` is granted, or fail with [`LockError::Timeout`].
    pub fn acquire(&self, key: &str) -> Result<LockGuard, LockError> {
        let holder = Uuid::new_v4().to_string();
        let started = Instant::now();
        let mut waiting = false;

        loop {
            if self.backend.try_acquire(key, &holder, self.lease)? {
                debug!(lock_key = key, waited_ms = started.elapsed().as_millis() as u64, "lock acquired");
                return Ok(LockGuard {
                    backend: self.backend.clone(),
                    key: key.to_string(),
                    holder,
                    lease: self.lease,
                    retry_interval: self.poll_interval,
                });
            }
            if started.elapsed() >= self.wait_timeout {
                return Err(LockError::Timeout {
                    key: key.to_string(),
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            if !waiting {
                debug!(lock_key = key, "waiting for lock");
                waiting = true;
            }
            std::thread::sleep(self.poll_interval);
        }
    }
}

/// A held lock. Released on drop.
///
/// A busy lock table is retried for up to the lease; past that the key
/// expires on its own.
pub struct LockGuard {
    backend: Arc<dyn LockBackend>,
    key: String,
    holder: String,
    lease: Duration,
    retry_interval: Duration,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let started = Instant::now();
        loop {
            match self.backend.release(&self.key, &self.holder) {
                Ok(()) => {
                    debug!(lock_key = %self.key, "lock released");
                    return;
                }
                Err(LockError::DatabaseError(e))
                    if e.is_busy() && started.elapsed() < self.lease =>
                {
                    debug!(lock_key = %self.key, "lock table busy, retrying release");
                    std::thread::sleep(self.retry_interval);
                }
                Err(e) => {
                    warn!(lock_key = %self.key, error = %e, "failed to release lock");
                    return;
                }
            }
        }
    }
}
