//! Repository clone cache.
//!
//! Each repository URL maps to `{root}/{key}/repo`, where `key` is the first
//! 12 hex characters of the URL's SHA-256. Clone-or-fetch runs under the
//! distributed lock keyed by the same hash, so concurrent jobs for one
//! repository serialize only for that step.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::{AppConfig, LockTimeoutPolicy};
use crate::errors::{LockError, RepoError};
use crate::lock::SharedLock;

const KEY_LEN: usize = 12;
const FALLBACK_BRANCH: &str = "main";

pub struct RepoCache {
    root: PathBuf,
    git_binary: String,
    lock: SharedLock,
    lock_wait: Duration,
    lock_lease: Duration,
    git_timeout: Duration,
    timeout_policy: LockTimeoutPolicy,
}

impl RepoCache {
    pub fn new(config: &AppConfig, lock: SharedLock) -> Self {
        Self {
            root: config.repos.root.clone(),
            git_binary: config.repos.git_binary.clone(),
            lock,
            lock_wait: config.lock_wait(),
            lock_lease: config.lock_lease(),
            git_timeout: Duration::from_secs(config.repos.git_timeout_secs),
            timeout_policy: config.repos.lock_timeout_policy,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stable short cache key for a repository URL.
    pub fn repo_key(url: &str) -> String {
        let digest = Sha256::digest(url.as_bytes());
        let mut key = hex::encode(digest);
        key.truncate(KEY_LEN);
        key
    }

    /// Where the clone for `url` lives (whether or not it exists yet).
    pub fn repo_dir(&self, url: &str) -> PathBuf {
        self.root.join(Self::repo_key(url)).join("repo")
    }

    /// Clone `url` if absent, fetch it if present, and return the clone path.
    pub async fn ensure(&self, url: &str) -> Result<PathBuf, RepoError> {
        let key = Self::repo_key(url);
        let entry_dir = self.root.join(&key);
        tokio::fs::create_dir_all(&entry_dir)
            .await
            .map_err(|source| RepoError::Io {
                path: entry_dir.clone(),
                source,
            })?;

        let mut guard = match self
            .lock
            .acquire(&key, self.lock_lease, self.lock_wait)
            .await
        {
            Ok(guard) => Some(guard),
            Err(source @ LockError::Timeout { .. }) => match self.timeout_policy {
                LockTimeoutPolicy::Proceed => {
                    warn!(repo = %url, key = %key, "lock wait timed out, proceeding with idempotent clone/fetch");
                    None
                }
                LockTimeoutPolicy::Fail => {
                    return Err(RepoError::LockTimeout {
                        url: url.to_string(),
                        source,
                    });
                }
            },
            Err(e) => return Err(RepoError::Lock(e)),
        };

        let repo_dir = entry_dir.join("repo");
        let result = self.clone_or_fetch(url, &repo_dir).await;

        if let Some(guard) = guard.as_mut() {
            if let Err(e) = guard.release().await {
                warn!(repo = %url, error = %e, "failed to release repository lock");
            }
        }

        result.map(|()| repo_dir)
    }

    async fn clone_or_fetch(&self, url: &str, repo_dir: &Path) -> Result<(), RepoError> {
        if repo_dir.join(".git").exists() {
            info!(repo = %url, path = %repo_dir.display(), "fetching cached repository");
            let dir = repo_dir.to_string_lossy();
            return self
                .git("fetch", url, &["-C", dir.as_ref(), "fetch", "--all", "--prune"])
                .await;
        }

        // A directory without .git is a leftover from an interrupted clone.
        if repo_dir.exists() {
            warn!(repo = %url, path = %repo_dir.display(), "removing incomplete clone");
            tokio::fs::remove_dir_all(repo_dir)
                .await
                .map_err(|source| RepoError::Io {
                    path: repo_dir.to_path_buf(),
                    source,
                })?;
        }

        info!(repo = %url, path = %repo_dir.display(), "cloning repository");
        let dir = repo_dir.to_string_lossy();
        self.git("clone", url, &["clone", url, dir.as_ref()]).await
    }

    async fn git(&self, operation: &'static str, url: &str, args: &[&str]) -> Result<(), RepoError> {
        let child = Command::new(&self.git_binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.git_timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(RepoError::GitFailed {
                    operation,
                    url: url.to_string(),
                    detail: format!("failed to run {}: {}", self.git_binary, e),
                });
            }
            Err(_) => {
                return Err(RepoError::GitTimeout {
                    operation,
                    url: url.to_string(),
                    secs: self.git_timeout.as_secs(),
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RepoError::GitFailed {
                operation,
                url: url.to_string(),
                detail: stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Remote default branch of a clone (`origin/HEAD`), falling back to the
/// local HEAD branch and then `main`.
pub fn default_branch(repo_dir: &Path) -> String {
    let Ok(repo) = git2::Repository::open(repo_dir) else {
        return FALLBACK_BRANCH.to_string();
    };

    if let Ok(reference) = repo.find_reference("refs/remotes/origin/HEAD") {
        if let Some(target) = reference.symbolic_target() {
            if let Some(branch) = target.strip_prefix("refs/remotes/origin/") {
                return branch.to_string();
            }
        }
    }

    repo.head()
        .ok()
        .filter(|head| head.is_branch())
        .and_then(|head| head.shorthand().map(String::from))
        .unwrap_or_else(|| FALLBACK_BRANCH.to_string())
}
