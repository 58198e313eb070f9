//! Reconciliation engine: the Project Sync Coordinator and the Repository
//! Sync Worker.
//!
//! A run proceeds as follows:
//!
//! 1. [`SyncEngine::start_run`] records a run and submits one
//!    [`SyncTask::SyncProject`] per project.
//! 2. The Coordinator ([`SyncEngine::sync_project`]) pulls, decides whether
//!    anything changed, runs the project-wide resource merge and submits one
//!    [`SyncTask::SyncRepository`] per repository, all carrying the same
//!    reference time.
//! 3. The Worker ([`SyncEngine::sync_repository`]) reconciles each locale of
//!    its repository in a transaction of its own and writes accepted edits
//!    back to version control.
//!
//! Every invocation runs under a keyed [`ResourceLock`] and is safe to
//! execute more than once.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::changeset::Changeset;
use crate::db::{self, store, Database};
use crate::dispatch::{SyncOptions, SyncTask, TaskQueue};
use crate::errors::{SyncError, SyncErrorKind};
use crate::lock::{lock_key, ResourceLock, PROJECT_LOCK, REPOSITORY_LOCK};
use crate::merge::{self, MergeSummary};
use crate::models::{Locale, Project, Repository, SyncLog};
use crate::stats::StatsUpdater;
use crate::vcs::{VcsBackend, VcsProject, VcsResource};

/// Result of a Coordinator invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ProjectSyncOutcome {
    /// Nothing changed; the project run record was sealed as skipped.
    Skipped { project_sync_log_id: i64 },
    /// One Worker task was submitted per repository.
    Dispatched {
        project_sync_log_id: i64,
        repositories: usize,
    },
}

/// Result of a Worker invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySyncOutcome {
    pub repository_sync_log_id: i64,
    pub locales_synced: usize,
    /// Locales rolled back after a failed write-back.
    pub locales_failed: usize,
}

/// The reconciliation engine.
pub struct SyncEngine {
    db: Arc<Database>,
    locks: ResourceLock,
    queue: Arc<dyn TaskQueue>,
    vcs: Arc<dyn VcsBackend>,
    stats: Arc<dyn StatsUpdater>,
    source_directory: String,
}

fn missing(entity: &str, id: i64) -> SyncError {
    error!(entity, id, "referenced record not found");
    SyncError::not_found(entity, id)
}

impl SyncEngine {
    pub fn new(
        db: Arc<Database>,
        locks: ResourceLock,
        queue: Arc<dyn TaskQueue>,
        vcs: Arc<dyn VcsBackend>,
        stats: Arc<dyn StatsUpdater>,
        source_directory: &str,
    ) -> Self {
        info!(source_directory, "initializing sync engine");
        Self {
            db,
            locks,
            queue,
            vcs,
            stats,
            source_directory: source_directory.to_string(),
        }
    }

    /// Return a reference to the database.
    pub fn db(&self) -> &Database {
        &self.db
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Record a new run and submit a Coordinator task for each project:
    /// every enabled project, or exactly the projects named by `slugs`.
    pub fn start_run(&self, options: SyncOptions, slugs: &[String]) -> Result<SyncLog, SyncError> {
        let projects = if slugs.is_empty() {
            self.db.list_projects(false)?
        } else {
            let mut projects = Vec::with_capacity(slugs.len());
            for slug in slugs {
                match self.db.get_project_by_slug(slug)? {
                    Some(project) => projects.push(project),
                    None => {
                        error!(slug = %slug, "project not found");
                        return Err(SyncError::not_found("project", slug));
                    }
                }
            }
            projects
        };

        let sync_log = self.db.create_sync_log(&db::now())?;
        for project in &projects {
            self.queue.submit(SyncTask::SyncProject {
                project_id: project.id,
                sync_log_id: sync_log.id,
                options,
            })?;
        }
        info!(
            sync_log_id = sync_log.id,
            projects = projects.len(),
            "reconciliation run started"
        );
        Ok(sync_log)
    }

    /// Run one queued task.
    pub fn execute(&self, task: &SyncTask) -> Result<(), SyncError> {
        match *task {
            SyncTask::SyncProject {
                project_id,
                sync_log_id,
                options,
            } => {
                self.sync_project(project_id, sync_log_id, options)?;
            }
            SyncTask::SyncRepository {
                project_id,
                repository_id,
                project_sync_log_id,
                now,
                no_pull,
                no_commit,
            } => {
                self.sync_repository(
                    project_id,
                    repository_id,
                    project_sync_log_id,
                    now,
                    no_pull,
                    no_commit,
                )?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Coordinator
    // -----------------------------------------------------------------------

    /// Reconcile project-wide state and fan out to the repositories.
    ///
    /// Holds the project lock for the whole invocation.
    pub fn sync_project(
        &self,
        project_id: i64,
        sync_log_id: i64,
        options: SyncOptions,
    ) -> Result<ProjectSyncOutcome, SyncError> {
        let _guard = self.locks.acquire(&lock_key(PROJECT_LOCK, &[project_id]))?;

        let project = self
            .db
            .get_project(project_id)?
            .ok_or_else(|| missing("project", project_id))?;
        let sync_log = self
            .db
            .get_sync_log(sync_log_id)?
            .ok_or_else(|| missing("sync_log", sync_log_id))?;

        let now = db::now();
        let project_log = self.db.create_project_sync_log(sync_log.id, project.id, &now)?;
        let repositories = self.db.list_repositories(project.id)?;

        let changed = if options.no_pull {
            true
        } else {
            self.vcs.pull(&project, &repositories)?
        };

        if !options.force && !changed && !project.has_changed {
            self.db.mark_project_sync_skipped(project_log.id, &db::now())?;
            info!(project = %project.slug, sync_log_id, "no changes, project skipped");
            return Ok(ProjectSyncOutcome::Skipped {
                project_sync_log_id: project_log.id,
            });
        }

        let sources = self.collect_sources(&project, &repositories)?;
        self.db
            .transaction(|conn| merge::sync_resources(conn, project.id, &sources, &now))?;

        for repository in &repositories {
            self.queue.submit(SyncTask::SyncRepository {
                project_id: project.id,
                repository_id: repository.id,
                project_sync_log_id: project_log.id,
                now,
                no_pull: options.no_pull,
                no_commit: options.no_commit,
            })?;
        }

        info!(
            project = %project.slug,
            sync_log_id,
            repositories = repositories.len(),
            "project synced, repository tasks dispatched"
        );
        Ok(ProjectSyncOutcome::Dispatched {
            project_sync_log_id: project_log.id,
            repositories: repositories.len(),
        })
    }

    /// Union of the source resources of every repository checkout. The
    /// first repository providing a path wins.
    fn collect_sources(
        &self,
        project: &Project,
        repositories: &[Repository],
    ) -> Result<BTreeMap<String, VcsResource>, SyncError> {
        let mut sources = BTreeMap::new();
        for repository in repositories {
            let tree = self.working_tree(project, repository);
            for (path, resource) in tree.source_resources()? {
                sources.entry(path).or_insert(resource);
            }
        }
        Ok(sources)
    }

    fn working_tree(&self, project: &Project, repository: &Repository) -> VcsProject {
        VcsProject::new(
            self.vcs.checkout_path(project, repository),
            &self.source_directory,
        )
    }

    // -----------------------------------------------------------------------
    // Worker
    // -----------------------------------------------------------------------

    /// Reconcile every locale of one repository as of `now`.
    ///
    /// Holds the repository lock for the whole invocation and the project
    /// lock around each locale's transaction. A failed write-back rolls back
    /// its locale only. Any other error propagates and leaves the repository
    /// run record without an end time.
    pub fn sync_repository(
        &self,
        project_id: i64,
        repository_id: i64,
        project_sync_log_id: i64,
        now: DateTime<Utc>,
        no_pull: bool,
        no_commit: bool,
    ) -> Result<RepositorySyncOutcome, SyncError> {
        let _guard = self
            .locks
            .acquire(&lock_key(REPOSITORY_LOCK, &[project_id, repository_id]))?;

        let project = self
            .db
            .get_project(project_id)?
            .ok_or_else(|| missing("project", project_id))?;
        let repository = self
            .db
            .get_repository(repository_id)?
            .filter(|r| r.project_id == project.id)
            .ok_or_else(|| missing("repository", repository_id))?;
        let project_log = self
            .db
            .get_project_sync_log(project_sync_log_id)?
            .ok_or_else(|| missing("project_sync_log", project_sync_log_id))?;

        let log = self
            .db
            .create_repository_sync_log(project_log.id, repository.id, &db::now())?;
        let mut outcome = RepositorySyncOutcome {
            repository_sync_log_id: log.id,
            ..Default::default()
        };

        if !no_pull {
            self.vcs.pull(&project, std::slice::from_ref(&repository))?;
        }

        if repository.locales.is_empty() {
            warn!(
                project = %project.slug,
                repository = repository.id,
                "repository has no locales, nothing to sync"
            );
            self.db.finish_repository_sync_log(log.id, &db::now())?;
            return Ok(outcome);
        }

        let tree = self.working_tree(&project, &repository);
        let source_paths: BTreeSet<String> = tree.source_resources()?.into_keys().collect();

        for locale in &repository.locales {
            let vcs_locale = tree.load_locale(&locale.code)?;
            let result = self.sync_locale(
                &project,
                &repository,
                locale,
                now,
                no_commit,
                &source_paths,
                &vcs_locale,
            );
            match result {
                Ok(summary) => {
                    debug!(
                        project = %project.slug,
                        locale = %locale.code,
                        database_wins = summary.database_wins,
                        working_tree_wins = summary.working_tree_wins,
                        deferred = summary.deferred,
                        "locale synced"
                    );
                    outcome.locales_synced += 1;
                }
                Err(e) if e.kind() == SyncErrorKind::WriteBack => {
                    warn!(
                        project = %project.slug,
                        repository = repository.id,
                        locale = %locale.code,
                        error = %e,
                        "write-back failed, locale rolled back"
                    );
                    outcome.locales_failed += 1;
                }
                Err(e) => return Err(e),
            }
        }

        self.db.finish_repository_sync_log(log.id, &db::now())?;
        info!(
            project = %project.slug,
            repository = repository.id,
            locales_synced = outcome.locales_synced,
            locales_failed = outcome.locales_failed,
            "repository synced"
        );
        Ok(outcome)
    }

    /// The per-locale unit of work. Everything, the write-back included,
    /// happens inside one transaction.
    #[allow(clippy::too_many_arguments)]
    fn sync_locale(
        &self,
        project: &Project,
        repository: &Repository,
        locale: &Locale,
        now: DateTime<Utc>,
        no_commit: bool,
        source_paths: &BTreeSet<String>,
        vcs_locale: &BTreeMap<String, VcsResource>,
    ) -> Result<MergeSummary, SyncError> {
        let _guard = self.locks.acquire(&lock_key(PROJECT_LOCK, &[project.id]))?;

        self.db.transaction(|conn| {
            let mut changeset = Changeset::new(project.id, now);
            let summary =
                merge::update_translations(conn, &mut changeset, locale, source_paths, vcs_locale)?;
            changeset.execute(conn)?;
            self.stats.update_stats(conn, project.id, &changeset, locale)?;

            store::delete_dirty_markers(conn, project.id, locale.id, &now)?;
            store::clear_project_dirty(conn, project.id)?;

            store::demote_duplicate_approvals(conn, project.id, locale.id)?;
            changeset.save_synced_values(conn, locale.id, !no_commit)?;

            if !no_commit && changeset.locales_to_commit().contains(locale.code.as_str()) {
                self.vcs.commit(project, repository, now, &changeset, locale)?;
            }
            Ok::<_, SyncError>(summary)
        })
    }
}
