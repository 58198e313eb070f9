//! Domain model types used throughout locsync.
//!
//! These types bridge the sync engine, the database layer and the working
//! tree. Run Ledger records are at the bottom of the file.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// A translatable product.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Project {
    pub id: i64,
    pub slug: String,
    pub name: String,
    /// Database-side edits exist that have not been reconciled yet.
    pub has_changed: bool,
    /// Excluded from scheduled runs.
    pub sync_disabled: bool,
}

/// A language/region identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Locale {
    pub id: i64,
    pub code: String,
    pub name: String,
}

/// A version-controlled location belonging to a project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Repository {
    pub id: i64,
    pub project_id: i64,
    pub url: String,
    pub branch: String,
    /// Locales this repository covers, ordered by code.
    pub locales: Vec<Locale>,
}

impl Repository {
    /// Checkout location below `root` for a repository of `project_slug`.
    pub fn checkout_path(&self, root: &Path, project_slug: &str) -> std::path::PathBuf {
        root.join(project_slug).join(self.id.to_string())
    }
}

/// A resource file, identified by its path relative to a locale directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub id: i64,
    pub project_id: i64,
    pub path: String,
}

/// A translatable source string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub id: i64,
    pub resource_id: i64,
    pub key: String,
    pub string: String,
    pub string_plural: String,
    pub obsolete: bool,
}

/// A translation of one entity (and optionally one plural form) into one
/// locale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub id: i64,
    pub entity_id: i64,
    pub locale_id: i64,
    pub plural_form: Option<i64>,
    pub string: String,
    pub approved: bool,
    pub approved_date: Option<DateTime<Utc>>,
    pub date: DateTime<Utc>,
    pub user: Option<String>,
}

/// Record that an entity changed in the database for a locale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyMarker {
    pub id: i64,
    pub entity_id: i64,
    pub locale_id: i64,
    pub changed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Run Ledger
// ---------------------------------------------------------------------------

/// One reconciliation run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncLog {
    pub id: i64,
    pub start_time: DateTime<Utc>,
}

/// A project processed within a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectSyncLog {
    pub id: i64,
    pub sync_log_id: i64,
    pub project_id: i64,
    pub start_time: DateTime<Utc>,
    pub skipped: bool,
    pub skipped_end_time: Option<DateTime<Utc>>,
}

/// A repository processed for a project within a run.
///
/// A record without an `end_time` after its invocation ended marks a run
/// that needs manual investigation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepositorySyncLog {
    pub id: i64,
    pub project_sync_log_id: i64,
    pub repository_id: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl RepositorySyncLog {
    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }
}

/// Derived state of a project run record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProjectSyncStatus {
    /// Nothing needed reconciling.
    Skipped,
    /// Every repository of the project has a finished record.
    Synced,
    /// Repository work is outstanding, running, or failed.
    InProgress,
}

impl std::fmt::Display for ProjectSyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Skipped => write!(f, "skipped"),
            Self::Synced => write!(f, "synced"),
            Self::InProgress => write!(f, "in_progress"),
        }
    }
}
