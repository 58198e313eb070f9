//! TOML-based configuration system for locsync.
//!
//! Sensitive values (the push token) are stored as `_env` fields that
//! reference environment variable names. The actual secrets are resolved at
//! runtime via [`AppConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dispatch::SyncOptions;
use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon / scheduling settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Reconciliation behaviour settings.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Working-tree and push settings.
    #[serde(default)]
    pub vcs: VcsConfig,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Daemon / scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Seconds between scheduled reconciliation runs (default 600).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for persistent data (database, checkouts).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Number of invocations the runner executes at once.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Start a run immediately instead of waiting for the first interval.
    #[serde(default = "default_true")]
    pub run_on_startup: bool,
}

fn default_poll_interval() -> u64 {
    600
}
fn default_log_level() -> String {
    "info".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/locsync")
}
fn default_worker_concurrency() -> usize {
    4
}
fn default_true() -> bool {
    true
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            worker_concurrency: default_worker_concurrency(),
            run_on_startup: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

/// Reconciliation behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Wall-clock ceiling for one invocation. Also used as the lock lease.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,

    /// How often a blocked lock acquisition retries.
    #[serde(default = "default_lock_poll_interval")]
    pub lock_poll_interval_ms: u64,

    /// Give up waiting for a lock after this many seconds.
    #[serde(default = "default_lock_wait_timeout")]
    pub lock_wait_timeout_secs: u64,

    /// Scheduled runs treat working trees as up to date.
    #[serde(default)]
    pub no_pull: bool,

    /// Scheduled runs persist database edits without pushing.
    #[serde(default)]
    pub no_commit: bool,

    /// Scheduled runs ignore the "nothing changed" short-circuit.
    #[serde(default)]
    pub force: bool,

    /// Restrict scheduled runs to these project slugs (empty = all).
    #[serde(default)]
    pub projects: Vec<String>,
}

fn default_task_timeout() -> u64 {
    1800
}
fn default_lock_poll_interval() -> u64 {
    250
}
fn default_lock_wait_timeout() -> u64 {
    3600
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            task_timeout_secs: default_task_timeout(),
            lock_poll_interval_ms: default_lock_poll_interval(),
            lock_wait_timeout_secs: default_lock_wait_timeout(),
            no_pull: false,
            no_commit: false,
            force: false,
            projects: Vec::new(),
        }
    }
}

impl SyncConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_wait_timeout_secs)
    }

    /// Flags applied to scheduled runs.
    pub fn default_options(&self) -> SyncOptions {
        SyncOptions {
            no_pull: self.no_pull,
            no_commit: self.no_commit,
            force: self.force,
        }
    }
}

// ---------------------------------------------------------------------------
// VCS
// ---------------------------------------------------------------------------

/// Working-tree and push configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcsConfig {
    /// Where repository checkouts live. Defaults to `<data_dir>/checkouts`.
    #[serde(default)]
    pub checkouts_dir: Option<PathBuf>,

    /// Directory (inside each checkout) holding the source locale files.
    #[serde(default = "default_source_directory")]
    pub source_directory: String,

    /// Remote to pull from and push to.
    #[serde(default = "default_remote")]
    pub remote: String,

    /// Environment variable holding the token used for fetch and push.
    #[serde(default)]
    pub token_env: Option<String>,

    /// Author of write-back commits.
    #[serde(default = "default_author_name")]
    pub author_name: String,

    #[serde(default = "default_author_email")]
    pub author_email: String,

    /// Resolved token (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub token: Option<String>,
}

fn default_source_directory() -> String {
    "en-US".into()
}
fn default_remote() -> String {
    "origin".into()
}
fn default_author_name() -> String {
    "Locsync".into()
}
fn default_author_email() -> String {
    "sync@locsync.local".into()
}

impl Default for VcsConfig {
    fn default() -> Self {
        Self {
            checkouts_dir: None,
            source_directory: default_source_directory(),
            remote: default_remote(),
            token_env: None,
            author_name: default_author_name(),
            author_email: default_author_email(),
            token: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading / validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve all `_env` references into their secret values.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");

        if let Some(ref env_name) = self.vcs.token_env {
            self.vcs.token = resolve_optional_env(env_name, "vcs.token_env");
        }

        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.poll_interval_secs == 0 {
            return Err(invalid("daemon.poll_interval_secs", "poll interval must be > 0"));
        }
        if self.daemon.worker_concurrency == 0 {
            return Err(invalid("daemon.worker_concurrency", "concurrency must be > 0"));
        }
        if self.sync.task_timeout_secs == 0 {
            return Err(invalid("sync.task_timeout_secs", "task timeout must be > 0"));
        }
        if self.sync.lock_poll_interval_ms == 0 {
            return Err(invalid("sync.lock_poll_interval_ms", "poll interval must be > 0"));
        }
        if self.vcs.source_directory.trim().is_empty() {
            return Err(invalid("vcs.source_directory", "source directory must not be empty"));
        }
        if self.vcs.remote.trim().is_empty() {
            return Err(invalid("vcs.remote", "remote name must not be empty"));
        }

        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Path of the engine database inside the data directory.
    pub fn database_path(&self) -> PathBuf {
        self.daemon.data_dir.join("locsync.db")
    }

    /// Root directory for repository checkouts.
    pub fn checkouts_dir(&self) -> PathBuf {
        self.vcs
            .checkouts_dir
            .clone()
            .unwrap_or_else(|| self.daemon.data_dir.join("checkouts"))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            sync: SyncConfig::default(),
            vcs: VcsConfig::default(),
        }
    }
}

fn invalid(field: &str, detail: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        detail: detail.into(),
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}
