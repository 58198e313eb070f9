//! Error types for the locsync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Vcs(#[from] VcsError),

    #[error(transparent)]
    WriteBack(#[from] WriteBackError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Sync engine errors
// ---------------------------------------------------------------------------

/// Errors raised by the reconciliation engine.
///
/// Only [`SyncError::WriteBack`] is recovered by the repository worker (per
/// locale). Every other variant aborts the invocation that raised it.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A project, repository or run record referenced by an invocation does
    /// not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        entity: String,
        id: String,
    },

    /// Pushing a locale's edits to version control failed.
    #[error("write-back failed: {0}")]
    WriteBack(#[from] WriteBackError),

    /// Reading or pulling a working tree failed.
    #[error("sync VCS error: {0}")]
    Vcs(#[from] VcsError),

    /// A resource lock could not be acquired.
    #[error("sync lock error: {0}")]
    Lock(#[from] LockError),

    /// Submitting follow-up work failed.
    #[error("sync dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Database error during sync.
    #[error("sync database error: {0}")]
    Database(#[from] DatabaseError),
}

impl SyncError {
    /// Shorthand for a [`SyncError::NotFound`].
    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// VCS errors
// ---------------------------------------------------------------------------

/// Errors from reading, cloning or pulling working trees.
#[derive(Debug, Error)]
pub enum VcsError {
    /// The checkout path does not exist or is not a git repository.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// A resource file in the working tree could not be parsed.
    #[error("invalid resource file '{path}': {detail}")]
    ParseError {
        path: String,
        detail: String,
    },

    /// Generic I/O wrapper.
    #[error("vcs I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors from pushing accepted edits back to version control.
#[derive(Debug, Error)]
pub enum WriteBackError {
    /// Writing locale files into the checkout failed.
    #[error("failed to write '{path}': {detail}")]
    WriteFailed {
        path: String,
        detail: String,
    },

    /// Creating the commit failed.
    #[error("commit to '{repository}' failed: {detail}")]
    CommitFailed {
        repository: String,
        detail: String,
    },

    /// The remote rejected the push (e.g. non-fast-forward).
    #[error("push rejected for branch '{branch}': {detail}")]
    PushRejected {
        branch: String,
        detail: String,
    },

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),
}

// ---------------------------------------------------------------------------
// Lock errors
// ---------------------------------------------------------------------------

/// Errors from the keyed resource lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// Waited longer than the configured ceiling for a key.
    #[error("timed out after {waited_secs}s waiting for lock '{key}'")]
    Timeout {
        key: String,
        waited_secs: u64,
    },

    /// The in-process lock table was poisoned by a panicking holder.
    #[error("lock table poisoned")]
    Poisoned,

    /// The shared lock table could not be read or written.
    #[error("lock database error: {0}")]
    DatabaseError(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Dispatch errors
// ---------------------------------------------------------------------------

/// Errors from submitting tasks to a work queue.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The receiving side of the queue is gone.
    #[error("task queue '{0}' is closed")]
    Closed(String),

    /// The in-memory queue was poisoned by a panicking holder.
    #[error("task queue poisoned")]
    Poisoned,

    /// The persistent queue could not be read or written.
    #[error("task queue storage error: {0}")]
    Database(#[from] DatabaseError),

    /// A task could not be encoded or a stored task decoded.
    #[error("task payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue {
        field: String,
        detail: String,
    },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed {
        version: u32,
        detail: String,
    },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        entity: String,
        id: String,
    },

    /// A stored value could not be decoded.
    #[error("invalid stored value in {column}: {detail}")]
    InvalidValue {
        column: String,
        detail: String,
    },
}

impl DatabaseError {
    /// Whether this error is SQLite reporting a competing writer.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::SqliteError(rusqlite::Error::SqliteFailure(e, _))
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
        )
    }
}

/// How the repository worker treats an error raised inside a locale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorKind {
    /// Referenced record absent; fatal for the invocation.
    NotFound,
    /// Version-control push failed; only the locale is aborted.
    WriteBack,
    /// Anything else; propagates and leaves the run record open.
    Unclassified,
}

impl SyncError {
    /// Classify this error per the engine's recovery policy.
    pub fn kind(&self) -> SyncErrorKind {
        match self {
            Self::NotFound { .. } => SyncErrorKind::NotFound,
            Self::WriteBack(_) => SyncErrorKind::WriteBack,
            _ => SyncErrorKind::Unclassified,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = SyncError::not_found("project", 42);
        assert_eq!(err.to_string(), "project not found: 42");

        let err = WriteBackError::PushRejected {
            branch: "main".into(),
            detail: "non-fast-forward".into(),
        };
        assert_eq!(
            err.to_string(),
            "push rejected for branch 'main': non-fast-forward"
        );

        let err = LockError::Timeout {
            key: "project=1".into(),
            waited_secs: 30,
        };
        assert!(err.to_string().contains("project=1"));
    }

    #[test]
    fn test_sync_error_kind() {
        assert_eq!(SyncError::not_found("repository", 7).kind(), SyncErrorKind::NotFound);

        let write_back: SyncError = WriteBackError::CommitFailed {
            repository: "https://example.com/l10n.git".into(),
            detail: "index locked".into(),
        }
        .into();
        assert_eq!(write_back.kind(), SyncErrorKind::WriteBack);

        let db: SyncError = DatabaseError::NotFound {
            entity: "translation".into(),
            id: "1".into(),
        }
        .into();
        assert_eq!(db.kind(), SyncErrorKind::Unclassified);
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let core: CoreError = SyncError::not_found("sync_log", 1).into();
        assert!(matches!(core, CoreError::Sync(_)));

        let core: CoreError = DispatchError::Closed("runner".into()).into();
        assert!(matches!(core, CoreError::Dispatch(_)));
    }
}
