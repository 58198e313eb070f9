//! Version-control collaborator: pulling checkouts, reading working trees,
//! and writing accepted edits back.

pub mod git;
pub mod working_tree;

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::changeset::Changeset;
use crate::errors::{VcsError, WriteBackError};
use crate::models::{Locale, Project, Repository};

pub use git::GitBackend;
pub use working_tree::{VcsEdit, VcsProject, VcsResource, VcsValue};

/// Pull and commit operations the engine needs from version control.
pub trait VcsBackend: Send + Sync {
    /// Bring the checkouts of `repositories` up to date. Returns whether any
    /// of them changed.
    fn pull(&self, project: &Project, repositories: &[Repository]) -> Result<bool, VcsError>;

    /// Write `locale`'s working-tree edits from `changeset` into the
    /// repository checkout and publish them.
    fn commit(
        &self,
        project: &Project,
        repository: &Repository,
        now: DateTime<Utc>,
        changeset: &Changeset,
        locale: &Locale,
    ) -> Result<(), WriteBackError>;

    /// Location of the repository's checkout.
    fn checkout_path(&self, project: &Project, repository: &Repository) -> PathBuf;
}
