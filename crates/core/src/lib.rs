//! locsync core library.
//!
//! This crate reconciles translations stored in a SQLite database with the
//! locale files of version-controlled repositories: configuration,
//! persistence and the run ledger, keyed resource locks, task dispatch,
//! working-tree access, the changeset and merge step, and the sync engine.

pub mod changeset;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod errors;
pub mod lock;
pub mod merge;
pub mod models;
pub mod stats;
pub mod sync_engine;
pub mod vcs;

// Re-exports for convenience.
pub use changeset::Changeset;
pub use config::AppConfig;
pub use db::Database;
pub use dispatch::{SyncOptions, SyncTask, TaskEnvelope, TaskQueue};
pub use lock::ResourceLock;
pub use sync_engine::SyncEngine;
