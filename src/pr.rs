//! Pull-request creation after a successful job.
//!
//! In worktree mode the agent commits to a branch it names itself (matching
//! `pr.branch_pattern`). The pipeline picks the newest such branch in the
//! cached clone, requires commits ahead of `origin/<base>`, pushes it, and
//! opens a pull request with `gh`.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use agentcore_common::Job;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::AppConfig;

const TITLE_MAX_CHARS: usize = 70;

/// What the pipeline needs to know about a finished job.
#[derive(Debug, Clone, Copy)]
pub struct PrRequest<'a> {
    pub job: &'a Job,
    pub repo_dir: &'a Path,
    pub base_ref: &'a str,
}

#[async_trait]
pub trait PullRequestCreator: Send + Sync {
    /// Returns the pull-request URL, or `None` when there is nothing to propose.
    async fn create(&self, request: PrRequest<'_>) -> Result<Option<String>>;
}

/// `git push` + `gh pr create`.
pub struct GhPullRequests {
    git_binary: String,
    gh_binary: String,
    branch_pattern: glob::Pattern,
    token: Option<String>,
    /// Bound on each external command; shares the git command timeout.
    command_timeout: Duration,
}

impl GhPullRequests {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let branch_pattern = glob::Pattern::new(&config.pr.branch_pattern)
            .with_context(|| format!("Invalid branch pattern: {}", config.pr.branch_pattern))?;
        Ok(Self {
            git_binary: config.repos.git_binary.clone(),
            gh_binary: config.pr.gh_binary.clone(),
            branch_pattern,
            token: config.github.token.clone(),
            command_timeout: Duration::from_secs(config.repos.git_timeout_secs),
        })
    }

    /// Run `cmd` to completion within the command timeout. The child is
    /// killed when the wait is abandoned.
    async fn output(&self, mut cmd: Command, what: &str) -> Result<Output> {
        match tokio::time::timeout(self.command_timeout, cmd.output()).await {
            Ok(result) => result.with_context(|| format!("Failed to run {}", what)),
            Err(_) => bail!(
                "{} timed out after {}s",
                what,
                self.command_timeout.as_secs()
            ),
        }
    }

    async fn push(&self, repo_dir: &Path, branch: &str) -> Result<()> {
        let mut cmd = self.command(&self.git_binary, repo_dir);
        cmd.args(["push", "origin", branch]);
        let output = self.output(cmd, "git push").await?;
        if !output.status.success() {
            bail!(
                "git push of {} failed: {}",
                branch,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn open(&self, request: &PrRequest<'_>, branch: &str) -> Result<String> {
        let job = request.job;
        let title = pr_title(job.task());
        let body = format!(
            "Job: {}\n\nTask: {}\n\nProfile: {}",
            job.id(),
            job.task(),
            job.profile()
        );
        let mut cmd = self.command(&self.gh_binary, request.repo_dir);
        cmd.args(["pr", "create", "--title", &title, "--body", &body])
            .args(["--head", branch, "--base", request.base_ref]);
        let output = self.output(cmd, "gh pr create").await?;
        if !output.status.success() {
            bail!(
                "gh pr create failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let url = String::from_utf8(output.stdout)
            .context("Invalid UTF-8 in gh output")?
            .trim()
            .to_string();
        if url.is_empty() {
            bail!("gh pr create printed no URL");
        }
        Ok(url)
    }

    fn command(&self, binary: &str, repo_dir: &Path) -> Command {
        let mut cmd = Command::new(binary);
        cmd.current_dir(repo_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(token) = &self.token {
            cmd.env("GITHUB_TOKEN", token).env("GH_TOKEN", token);
        }
        cmd
    }
}

#[async_trait]
impl PullRequestCreator for GhPullRequests {
    async fn create(&self, request: PrRequest<'_>) -> Result<Option<String>> {
        let repo_dir: PathBuf = request.repo_dir.to_path_buf();
        let pattern = self.branch_pattern.clone();
        let base = request.base_ref.to_string();
        let candidate = tokio::task::spawn_blocking(move || -> Result<Option<(String, usize)>> {
            let Some(branch) = newest_matching_branch(&repo_dir, &pattern)? else {
                return Ok(None);
            };
            let ahead = commits_ahead(&repo_dir, &branch, &base)?;
            Ok(Some((branch, ahead)))
        })
        .await
        .context("Branch inspection task failed")??;

        let Some((branch, ahead)) = candidate else {
            debug!(job_id = %request.job.id(), "no agent branch found, skipping pull request");
            return Ok(None);
        };
        if ahead == 0 {
            debug!(job_id = %request.job.id(), branch = %branch, "agent branch has no new commits");
            return Ok(None);
        }

        self.push(request.repo_dir, &branch).await?;
        let url = self.open(&request, &branch).await?;
        info!(job_id = %request.job.id(), branch = %branch, pr_url = %url, "pull request created");
        Ok(Some(url))
    }
}

fn pr_title(task: &str) -> String {
    task.trim().chars().take(TITLE_MAX_CHARS).collect()
}

/// Local branch matching `pattern` whose tip commit is the most recent.
pub fn newest_matching_branch(repo_dir: &Path, pattern: &glob::Pattern) -> Result<Option<String>> {
    let repo = git2::Repository::open(repo_dir)
        .with_context(|| format!("Failed to open repository at {}", repo_dir.display()))?;
    let mut newest: Option<(i64, String)> = None;
    for entry in repo.branches(Some(git2::BranchType::Local))? {
        let (branch, _) = entry?;
        let Some(name) = branch.name()?.map(String::from) else {
            continue;
        };
        if !pattern.matches(&name) {
            continue;
        }
        let time = branch.get().peel_to_commit()?.time().seconds();
        if newest.as_ref().is_none_or(|(t, _)| time >= *t) {
            newest = Some((time, name));
        }
    }
    Ok(newest.map(|(_, name)| name))
}

/// Commits on `branch` not reachable from `origin/<base>` (or local `<base>`).
pub fn commits_ahead(repo_dir: &Path, branch: &str, base: &str) -> Result<usize> {
    let repo = git2::Repository::open(repo_dir)
        .with_context(|| format!("Failed to open repository at {}", repo_dir.display()))?;
    let local = repo
        .revparse_single(&format!("refs/heads/{}", branch))?
        .peel_to_commit()?
        .id();
    let upstream = repo
        .revparse_single(&format!("refs/remotes/origin/{}", base))
        .or_else(|_| repo.revparse_single(&format!("refs/heads/{}", base)))
        .with_context(|| format!("Base branch {} not found", base))?
        .peel_to_commit()?
        .id();
    let (ahead, _behind) = repo.graph_ahead_behind(local, upstream)?;
    Ok(ahead)
}
