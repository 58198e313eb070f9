//! SQLite persistence layer for locsync.
//!
//! Provides a [`Database`] handle with WAL-mode journaling, automatic schema
//! migrations, and query helpers for every table used by the sync engine.
//! Statements that must run inside a caller-owned transaction live in
//! [`store`] and take the transaction's `&Connection` explicitly.

pub mod queries;
pub mod schema;
pub mod store;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// Main database handle wrapping a SQLite connection.
///
/// The connection is opened in WAL mode for concurrent-read performance and
/// uses `PRAGMA foreign_keys = ON`. The inner connection is wrapped in a
/// `Mutex` so that `Database` is `Send + Sync`, enabling use inside `Arc`.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");

        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;

        debug!("database opened successfully with WAL mode");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (useful for testing).
    pub fn in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run all schema migrations to bring the database up to date.
    pub fn initialize(&self) -> Result<(), DatabaseError> {
        info!("initializing database schema");
        let conn = self.conn();
        schema::run_migrations(&conn)?;
        debug!("database schema is up to date");
        Ok(())
    }

    /// Obtain a lock on the underlying connection.
    ///
    /// If the Mutex is poisoned (a previous holder panicked), the lock is
    /// recovered rather than propagating a panic. Any transaction the
    /// panicking holder had open was rolled back when it unwound.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("database mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Execute a closure inside a SQLite transaction. If the closure returns
    /// `Ok`, the transaction is committed; otherwise it is rolled back.
    ///
    /// The closure's error type only needs to absorb [`DatabaseError`], so
    /// engine code can raise its own errors (e.g. a failed write-back) from
    /// inside the transactional scope and have them abort it.
    pub fn transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<DatabaseError>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(DatabaseError::from)?;
        let result = f(&tx)?;
        tx.commit().map_err(DatabaseError::from)?;
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Current time truncated to the stored precision (microseconds).
///
/// Values captured with this function survive a database round trip
/// unchanged, so they can be compared with what the ledger returns.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 encoding; string order equals time order.
pub fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Read a timestamp column.
pub(crate) fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw, idx)
}

/// Read a nullable timestamp column.
pub(crate) fn opt_ts_column(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_ts(&s, idx)).transpose()
}
