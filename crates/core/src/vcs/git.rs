//! `git2`-backed checkouts and the default [`VcsBackend`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use git2::{
    Cred, FetchOptions, IndexAddOption, Oid, PushOptions, RemoteCallbacks, RepositoryInitOptions,
    ResetType, Signature, Status, StatusOptions,
};
use tracing::{debug, info, instrument, warn};

use super::{VcsBackend, VcsProject};
use crate::changeset::Changeset;
use crate::config::VcsConfig;
use crate::errors::{VcsError, WriteBackError};
use crate::models::{Locale, Project, Repository};

// ---------------------------------------------------------------------------
// GitClient
// ---------------------------------------------------------------------------

/// High-level Git client wrapping a `git2::Repository`.
pub struct GitClient {
    repo: git2::Repository,
    repo_path: PathBuf,
}

fn remote_callbacks(token: Option<&str>) -> RemoteCallbacks<'static> {
    let mut callbacks = RemoteCallbacks::new();
    if let Some(tok) = token {
        let tok = tok.to_string();
        callbacks.credentials(move |_url, _username, _allowed| {
            Cred::userpass_plaintext("x-access-token", &tok)
        });
    }
    callbacks
}

impl GitClient {
    /// Open an existing Git repository at `repo_path`.
    pub fn open<P: AsRef<Path>>(repo_path: P) -> Result<Self, VcsError> {
        let path = repo_path.as_ref();
        let repo = git2::Repository::open(path)
            .map_err(|_| VcsError::RepositoryNotFound(path.display().to_string()))?;
        Ok(Self {
            repo,
            repo_path: path.to_path_buf(),
        })
    }

    /// Create an empty repository whose initial branch is `branch`.
    pub fn init<P: AsRef<Path>>(repo_path: P, branch: &str) -> Result<Self, VcsError> {
        let path = repo_path.as_ref();
        let repo =
            git2::Repository::init_opts(path, RepositoryInitOptions::new().initial_head(branch))?;
        Ok(Self {
            repo,
            repo_path: path.to_path_buf(),
        })
    }

    /// Clone `branch` of `url` into `path`.
    #[instrument(skip(token), fields(path = %path.display()))]
    pub fn clone_repo(
        url: &str,
        branch: &str,
        path: &Path,
        token: Option<&str>,
    ) -> Result<Self, VcsError> {
        info!("cloning git repository");
        let mut fetch_opts = FetchOptions::new();
        fetch_opts.remote_callbacks(remote_callbacks(token));
        let mut builder = git2::build::RepoBuilder::new();
        builder.fetch_options(fetch_opts).branch(branch);
        let repo = builder.clone(url, path)?;
        info!("clone completed");
        Ok(Self {
            repo,
            repo_path: path.to_path_buf(),
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Fetch from a named remote.
    #[instrument(skip(self, token))]
    pub fn fetch(&self, remote_name: &str, token: Option<&str>) -> Result<(), VcsError> {
        let mut remote = self.repo.find_remote(remote_name)?;
        let mut fetch_opts = FetchOptions::new();
        fetch_opts.remote_callbacks(remote_callbacks(token));
        remote.fetch(&[] as &[&str], Some(&mut fetch_opts), None)?;
        debug!("fetch completed");
        Ok(())
    }

    /// Fetch and move `branch` to the remote's tip. Returns whether HEAD
    /// moved.
    #[instrument(skip(self, token))]
    pub fn pull(&self, remote_name: &str, branch: &str, token: Option<&str>) -> Result<bool, VcsError> {
        self.fetch(remote_name, token)?;
        let remote_ref = format!("refs/remotes/{remote_name}/{branch}");
        let target = self.repo.find_reference(&remote_ref)?.peel_to_commit()?;
        if self.head_oid() == Some(target.id()) {
            debug!("already up to date");
            return Ok(false);
        }

        let local_ref = format!("refs/heads/{branch}");
        match self.repo.find_reference(&local_ref) {
            Ok(mut reference) => {
                reference.set_target(target.id(), "locsync: fast-forward pull")?;
            }
            Err(_) => {
                self.repo
                    .reference(&local_ref, target.id(), true, "locsync: track remote branch")?;
            }
        }
        self.repo.set_head(&local_ref)?;
        self.repo
            .checkout_head(Some(git2::build::CheckoutBuilder::new().force()))?;
        info!(head = %target.id(), "pull completed");
        Ok(true)
    }

    /// Whether the working tree differs from HEAD, untracked files included.
    pub fn has_changes(&self) -> Result<bool, git2::Error> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        Ok(!self.repo.statuses(Some(&mut opts))?.is_empty())
    }

    /// Stage all changes and create a commit.
    #[instrument(skip(self, message))]
    pub fn commit_all(&self, message: &str, author_name: &str, author_email: &str) -> Result<Oid, git2::Error> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;
        let tree_oid = index.write_tree()?;
        let tree = self.repo.find_tree(tree_oid)?;
        let author = Signature::now(author_name, author_email)?;
        let parent_commit = match self.repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(_) => None,
        };
        let parents: Vec<&git2::Commit> = parent_commit.iter().collect();
        let oid = self
            .repo
            .commit(Some("HEAD"), &author, &author, message, &tree, &parents)?;
        info!(sha = %oid, "created commit");
        Ok(oid)
    }

    /// Push a local branch to a remote.
    #[instrument(skip(self, token))]
    pub fn push(&self, remote_name: &str, branch: &str, token: Option<&str>) -> Result<(), WriteBackError> {
        let mut remote = self.repo.find_remote(remote_name)?;
        let mut callbacks = remote_callbacks(token);
        let rejection = Arc::new(Mutex::new(None::<String>));
        let slot = rejection.clone();
        callbacks.push_update_reference(move |refname, status| {
            if let Some(msg) = status {
                warn!(refname, msg, "push rejected");
                if let Ok(mut slot) = slot.lock() {
                    *slot = Some(msg.to_string());
                }
            }
            Ok(())
        });
        let mut push_opts = PushOptions::new();
        push_opts.remote_callbacks(callbacks);
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        remote
            .push(&[&refspec], Some(&mut push_opts))
            .map_err(|e| WriteBackError::PushRejected {
                branch: branch.to_string(),
                detail: e.message().to_string(),
            })?;
        let rejected = rejection.lock().ok().and_then(|mut r| r.take());
        if let Some(detail) = rejected {
            return Err(WriteBackError::PushRejected {
                branch: branch.to_string(),
                detail,
            });
        }
        info!("push completed");
        Ok(())
    }

    pub fn head_oid(&self) -> Option<Oid> {
        self.repo.head().ok().and_then(|h| h.target())
    }

    /// Hard-reset to `oid` and delete untracked files.
    pub fn reset_hard(&self, oid: Oid) -> Result<(), git2::Error> {
        let target = self.repo.find_object(oid, None)?;
        self.repo.reset(&target, ResetType::Hard, None)?;

        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let untracked: Vec<PathBuf> = self
            .repo
            .statuses(Some(&mut opts))?
            .iter()
            .filter(|entry| entry.status().contains(Status::WT_NEW))
            .filter_map(|entry| entry.path().map(|p| self.repo_path.join(p)))
            .collect();
        for path in untracked {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove untracked file");
            }
        }
        debug!(sha = %oid, "checkout reset");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GitBackend
// ---------------------------------------------------------------------------

/// [`VcsBackend`] keeping one git checkout per repository under
/// `<checkouts_dir>/<project slug>/<repository id>`.
pub struct GitBackend {
    checkouts_dir: PathBuf,
    source_directory: String,
    remote: String,
    token: Option<String>,
    author_name: String,
    author_email: String,
}

impl GitBackend {
    pub fn new(checkouts_dir: PathBuf, config: &VcsConfig) -> Self {
        Self {
            checkouts_dir,
            source_directory: config.source_directory.clone(),
            remote: config.remote.clone(),
            token: config.token.clone(),
            author_name: config.author_name.clone(),
            author_email: config.author_email.clone(),
        }
    }

    fn pull_repository(&self, project: &Project, repository: &Repository) -> Result<bool, VcsError> {
        let path = self.checkout_path(project, repository);
        if !path.join(".git").exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            GitClient::clone_repo(&repository.url, &repository.branch, &path, self.token.as_deref())?;
            return Ok(true);
        }
        GitClient::open(&path)?.pull(&self.remote, &repository.branch, self.token.as_deref())
    }

    fn write_and_publish(
        &self,
        client: &GitClient,
        project: &Project,
        repository: &Repository,
        changeset: &Changeset,
        locale: &Locale,
    ) -> Result<(), WriteBackError> {
        let tree = VcsProject::new(client.repo_path(), &self.source_directory);
        if let Some(files) = changeset.vcs_edits(&locale.code) {
            for (path, edits) in files {
                tree.write_resource(&locale.code, path, edits)
                    .map_err(|e| WriteBackError::WriteFailed {
                        path: format!("{}/{}", locale.code, path),
                        detail: e.to_string(),
                    })?;
            }
        }

        if !client.has_changes()? {
            info!("working tree unchanged, nothing to commit");
            return Ok(());
        }

        let message = commit_message(project, locale, &changeset.commit_authors(&locale.code));
        client
            .commit_all(&message, &self.author_name, &self.author_email)
            .map_err(|e| WriteBackError::CommitFailed {
                repository: repository.url.clone(),
                detail: e.message().to_string(),
            })?;
        client.push(&self.remote, &repository.branch, self.token.as_deref())
    }
}

fn commit_message(project: &Project, locale: &Locale, authors: &[String]) -> String {
    let mut message = format!("Update {} ({}) translations for {}", locale.name, locale.code, project.name);
    if !authors.is_empty() {
        message.push_str("\n\nTranslators:\n");
        for author in authors {
            message.push_str(&format!("- {author}\n"));
        }
    }
    message
}

impl VcsBackend for GitBackend {
    #[instrument(skip_all, fields(project = %project.slug))]
    fn pull(&self, project: &Project, repositories: &[Repository]) -> Result<bool, VcsError> {
        let mut changed = false;
        for repository in repositories {
            let repo_changed = self.pull_repository(project, repository)?;
            debug!(repository = repository.id, changed = repo_changed, "pulled repository");
            changed |= repo_changed;
        }
        Ok(changed)
    }

    #[instrument(skip_all, fields(project = %project.slug, repository = repository.id, locale = %locale.code))]
    fn commit(
        &self,
        project: &Project,
        repository: &Repository,
        _now: DateTime<Utc>,
        changeset: &Changeset,
        locale: &Locale,
    ) -> Result<(), WriteBackError> {
        let path = self.checkout_path(project, repository);
        let client = GitClient::open(&path).map_err(|e| WriteBackError::CommitFailed {
            repository: repository.url.clone(),
            detail: e.to_string(),
        })?;
        let previous = client.head_oid();

        let result = self.write_and_publish(&client, project, repository, changeset, locale);
        if result.is_err() {
            if let Some(oid) = previous {
                if let Err(e) = client.reset_hard(oid) {
                    warn!(error = %e, "failed to reset checkout after write-back failure");
                }
            }
        }
        result
    }

    fn checkout_path(&self, project: &Project, repository: &Repository) -> PathBuf {
        repository.checkout_path(&self.checkouts_dir, &project.slug)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::now;
    use crate::vcs::{VcsEdit, VcsValue};

    struct Remote {
        _dir: tempfile::TempDir,
        origin: PathBuf,
        seed: GitClient,
    }

    /// A bare `origin` with one commit on `main`, plus a seed clone used to
    /// push further commits.
    fn remote() -> Remote {
        let dir = tempfile::tempdir().unwrap();
        let origin = dir.path().join("origin.git");
        git2::Repository::init_opts(
            &origin,
            RepositoryInitOptions::new().bare(true).initial_head("main"),
        )
        .unwrap();

        let seed = GitClient::init(dir.path().join("seed"), "main").unwrap();
        seed.repo
            .remote("origin", origin.to_str().unwrap())
            .unwrap();
        write_file(seed.repo_path(), "en-US/main.json", r#"{"title": "Title"}"#);
        seed.commit_all("initial", "Seed", "seed@example.com").unwrap();
        seed.push("origin", "main", None).unwrap();

        Remote {
            _dir: dir,
            origin,
            seed,
        }
    }

    fn write_file(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    fn fixture(remote: &Remote, checkouts: &Path) -> (GitBackend, Project, Repository, Locale) {
        let backend = GitBackend::new(checkouts.to_path_buf(), &VcsConfig::default());
        let project = Project {
            id: 1,
            slug: "firefox".into(),
            name: "Firefox".into(),
            has_changed: false,
            sync_disabled: false,
        };
        let locale = Locale {
            id: 1,
            code: "fr".into(),
            name: "French".into(),
        };
        let repository = Repository {
            id: 7,
            project_id: 1,
            url: remote.origin.to_str().unwrap().to_string(),
            branch: "main".into(),
            locales: vec![locale.clone()],
        };
        (backend, project, repository, locale)
    }

    fn french_title(project: &Project) -> Changeset {
        let mut changeset = Changeset::new(project.id, now());
        changeset.update_vcs_entity(
            "fr",
            "main.json",
            "title",
            VcsEdit::Set(VcsValue::Single("Titre".into())),
            vec!["alice".to_string()],
        );
        changeset
    }

    #[test]
    fn test_pull_clones_then_tracks_remote() {
        let remote = remote();
        let checkouts = tempfile::tempdir().unwrap();
        let (backend, project, repository, _) = fixture(&remote, checkouts.path());
        let repos = vec![repository.clone()];

        assert!(backend.pull(&project, &repos).unwrap(), "clone counts as a change");
        let path = backend.checkout_path(&project, &repository);
        assert!(path.join("en-US/main.json").exists());
        assert!(!backend.pull(&project, &repos).unwrap());

        write_file(remote.seed.repo_path(), "en-US/main.json", r#"{"title": "New"}"#);
        remote.seed.commit_all("update", "Seed", "seed@example.com").unwrap();
        remote.seed.push("origin", "main", None).unwrap();

        assert!(backend.pull(&project, &repos).unwrap());
        let body = std::fs::read_to_string(path.join("en-US/main.json")).unwrap();
        assert!(body.contains("New"));
    }

    #[test]
    fn test_commit_writes_and_pushes() {
        let remote = remote();
        let checkouts = tempfile::tempdir().unwrap();
        let (backend, project, repository, locale) = fixture(&remote, checkouts.path());
        backend.pull(&project, &[repository.clone()]).unwrap();

        backend
            .commit(&project, &repository, now(), &french_title(&project), &locale)
            .unwrap();

        let origin = git2::Repository::open_bare(&remote.origin).unwrap();
        let head = origin
            .find_reference("refs/heads/main")
            .unwrap()
            .peel_to_commit()
            .unwrap();
        assert!(head.message().unwrap().contains("French (fr)"));
        assert!(head.message().unwrap().contains("- alice"));
        assert_eq!(head.author().name(), Some("Locsync"));
        assert!(head.tree().unwrap().get_path(Path::new("fr/main.json")).is_ok());
    }

    #[test]
    fn test_commit_without_changes_is_noop() {
        let remote = remote();
        let checkouts = tempfile::tempdir().unwrap();
        let (backend, project, repository, locale) = fixture(&remote, checkouts.path());
        backend.pull(&project, &[repository.clone()]).unwrap();
        let client = GitClient::open(backend.checkout_path(&project, &repository)).unwrap();
        let before = client.head_oid();

        backend
            .commit(&project, &repository, now(), &Changeset::new(project.id, now()), &locale)
            .unwrap();
        assert_eq!(client.head_oid(), before);
    }

    #[test]
    fn test_failed_push_resets_checkout() {
        let remote = remote();
        let checkouts = tempfile::tempdir().unwrap();
        let (backend, project, repository, locale) = fixture(&remote, checkouts.path());
        backend.pull(&project, &[repository.clone()]).unwrap();
        let path = backend.checkout_path(&project, &repository);
        let client = GitClient::open(&path).unwrap();
        let before = client.head_oid();

        // Origin moves on, so the checkout's push is not a fast-forward.
        write_file(remote.seed.repo_path(), "en-US/other.json", "{}");
        remote.seed.commit_all("diverge", "Seed", "seed@example.com").unwrap();
        remote.seed.push("origin", "main", None).unwrap();

        let result = backend.commit(&project, &repository, now(), &french_title(&project), &locale);
        assert!(result.is_err());
        assert_eq!(client.head_oid(), before);
        assert!(!path.join("fr/main.json").exists());
    }

    #[test]
    fn test_open_missing_repository() {
        assert!(matches!(
            GitClient::open("/nonexistent/checkout"),
            Err(VcsError::RepositoryNotFound(_))
        ));
    }
}
