//! The job record and its lifecycle state machine.
//!
//! A [`Job`] is created `queued`, moved to `running` by the runner, and ends in
//! exactly one terminal state. Every mutation goes through a named transition
//! method so the record invariants hold no matter which component holds it:
//!
//! - status only moves along `queued → running → {succeeded, failed, cancelled}`
//!   (plus `queued → cancelled`); terminal states are sinks.
//! - `pid` is only ever attached while `running`.
//! - `exit_code` is set iff the status is `succeeded` or `failed`.
//! - `output` / `error` are truncated to [`OUTPUT_LIMIT_BYTES`] /
//!   [`ERROR_LIMIT_BYTES`] on the way in.
//! - `created_at <= started_at <= ended_at` whenever present.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ceiling for captured standard output.
pub const OUTPUT_LIMIT_BYTES: usize = 50_000;

/// Ceiling for captured error detail.
pub const ERROR_LIMIT_BYTES: usize = 10_000;

/// Default record time-to-live in the fast cache (one day).
pub const DEFAULT_TTL_SECONDS: u64 = 86_400;

/// Exit code recorded for failures that never produced a process exit status.
pub const NO_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    /// Read-time interpretation only; never persisted by the runner.
    Expired,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }

    /// Whether `self → next` is an edge of the lifecycle graph.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Queued, Expired)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Expired)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    #[default]
    FireAndForget,
    Sync,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FireAndForget => "fire_and_forget",
            Self::Sync => "sync",
        }
    }
}

/// Rejected lifecycle transition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Job {id}: illegal transition {from} -> {to}")]
    Illegal {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {id}: {action} requires status running, found {status}")]
    NotRunning {
        id: String,
        action: &'static str,
        status: JobStatus,
    },

    #[error("Job {id}: pull request can only be attached to a succeeded job, found {status}")]
    NotSucceeded { id: String, status: JobStatus },
}

/// Descriptive fields supplied at submission time.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub task: String,
    pub profile: String,
    pub repo_url: Option<String>,
    pub base_ref: Option<String>,
    pub mode: JobMode,
    pub resume_session_id: Option<String>,
    pub ttl_seconds: u64,
}

impl NewJob {
    pub fn new(task: impl Into<String>, profile: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            profile: profile.into(),
            ttl_seconds: DEFAULT_TTL_SECONDS,
            ..Default::default()
        }
    }

    pub fn with_repo(mut self, repo_url: impl Into<String>) -> Self {
        self.repo_url = Some(repo_url.into());
        self
    }

    pub fn with_base_ref(mut self, base_ref: impl Into<String>) -> Self {
        self.base_ref = Some(base_ref.into());
        self
    }

    pub fn with_mode(mut self, mode: JobMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_resume_session(mut self, session_id: impl Into<String>) -> Self {
        self.resume_session_id = Some(session_id.into());
        self
    }

    /// Cache lifetime of the record. `0` means it never expires.
    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }
}

/// Result of a subprocess that ran to completion.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub session_id: Option<String>,
}

/// One tracked invocation of the coding agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    id: String,
    task: String,
    profile: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    repo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    base_ref: Option<String>,
    #[serde(default)]
    mode: JobMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resume_session_id: Option<String>,

    status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ended_at: Option<DateTime<Utc>>,
    ttl_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    worker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    config_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pr_url: Option<String>,
}

impl Job {
    /// Create a fresh `queued` record with a new random identifier.
    pub fn new(spec: NewJob) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task: spec.task,
            profile: spec.profile,
            repo_url: spec.repo_url.filter(|u| !u.is_empty()),
            base_ref: spec.base_ref.filter(|b| !b.is_empty()),
            mode: spec.mode,
            resume_session_id: spec.resume_session_id.filter(|s| !s.is_empty()),
            status: JobStatus::Queued,
            pid: None,
            exit_code: None,
            session_id: None,
            output: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            ttl_seconds: spec.ttl_seconds,
            worker: None,
            cwd: None,
            config_dir: None,
            pr_url: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn repo_url(&self) -> Option<&str> {
        self.repo_url.as_deref()
    }

    pub fn base_ref(&self) -> Option<&str> {
        self.base_ref.as_deref()
    }

    pub fn mode(&self) -> JobMode {
        self.mode
    }

    pub fn resume_session_id(&self) -> Option<&str> {
        self.resume_session_id.as_deref()
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Session identifier discovered in the agent's output, usable for resume.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds
    }

    pub fn worker(&self) -> Option<&str> {
        self.worker.as_deref()
    }

    pub fn cwd(&self) -> Option<&str> {
        self.cwd.as_deref()
    }

    pub fn config_dir(&self) -> Option<&str> {
        self.config_dir.as_deref()
    }

    pub fn pr_url(&self) -> Option<&str> {
        self.pr_url.as_deref()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    // ── Transitions ───────────────────────────────────────────────────

    /// `queued → running`, recording the executing worker.
    pub fn start(&mut self, worker: &str) -> Result<(), TransitionError> {
        self.move_to(JobStatus::Running)?;
        self.started_at = Some(self.not_before(self.created_at));
        self.worker = Some(worker.to_string());
        Ok(())
    }

    /// Record where the agent runs and which config directory it reads.
    pub fn record_workspace(
        &mut self,
        cwd: Option<String>,
        config_dir: Option<String>,
    ) -> Result<(), TransitionError> {
        self.require_running("record workspace")?;
        if cwd.is_some() {
            self.cwd = cwd;
        }
        if config_dir.is_some() {
            self.config_dir = config_dir;
        }
        Ok(())
    }

    /// Attach the OS process id of the spawned agent.
    pub fn attach_process(&mut self, pid: u32) -> Result<(), TransitionError> {
        self.require_running("attach process")?;
        self.pid = Some(pid);
        Ok(())
    }

    /// `running → succeeded | failed` from a subprocess exit.
    pub fn complete(&mut self, outcome: ProcessOutcome) -> Result<(), TransitionError> {
        let next = if outcome.exit_code == 0 {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        };
        self.move_to(next)?;
        self.exit_code = Some(outcome.exit_code);
        self.output = Some(truncate_utf8(&outcome.stdout, OUTPUT_LIMIT_BYTES));
        self.error = if outcome.stderr.trim().is_empty() {
            (next == JobStatus::Failed)
                .then(|| format!("Agent exited with code {}", outcome.exit_code))
        } else {
            Some(truncate_utf8(&outcome.stderr, ERROR_LIMIT_BYTES))
        };
        if outcome.session_id.is_some() {
            self.session_id = outcome.session_id;
        }
        self.ended_at = Some(self.end_time());
        Ok(())
    }

    /// `running → failed` with a human-readable cause.
    ///
    /// Failures that never produced an exit status record [`NO_EXIT_CODE`].
    pub fn fail(
        &mut self,
        error: impl Into<String>,
        exit_code: Option<i32>,
    ) -> Result<(), TransitionError> {
        self.move_to(JobStatus::Failed)?;
        self.exit_code = Some(exit_code.unwrap_or(NO_EXIT_CODE));
        self.error = Some(truncate_utf8(&error.into(), ERROR_LIMIT_BYTES));
        self.ended_at = Some(self.end_time());
        Ok(())
    }

    /// Cancel a queued or running job.
    ///
    /// Returns `false` without touching the record when the job is already
    /// terminal, which makes repeated cancellation a no-op.
    pub fn cancel(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = JobStatus::Cancelled;
        self.ended_at = Some(self.end_time());
        true
    }

    /// Attach an auto-created pull request to a succeeded job.
    pub fn attach_pr(&mut self, url: impl Into<String>) -> Result<(), TransitionError> {
        if self.status != JobStatus::Succeeded {
            return Err(TransitionError::NotSucceeded {
                id: self.id.clone(),
                status: self.status,
            });
        }
        self.pr_url = Some(url.into());
        Ok(())
    }

    /// Reinterpret a stale non-terminal record as `expired`.
    ///
    /// Applied at read time only; returns whether the status changed.
    pub fn expire_if_stale(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_terminal() || self.ttl_seconds == 0 {
            return false;
        }
        let ttl = Duration::seconds(i64::try_from(self.ttl_seconds).unwrap_or(i64::MAX));
        let deadline = self.created_at.checked_add_signed(ttl);
        match deadline {
            Some(deadline) if now > deadline => {
                self.status = JobStatus::Expired;
                true
            }
            _ => false,
        }
    }

    fn move_to(&mut self, next: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::Illegal {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    fn require_running(&self, action: &'static str) -> Result<(), TransitionError> {
        if self.status != JobStatus::Running {
            return Err(TransitionError::NotRunning {
                id: self.id.clone(),
                action,
                status: self.status,
            });
        }
        Ok(())
    }

    fn end_time(&self) -> DateTime<Utc> {
        self.not_before(self.started_at.unwrap_or(self.created_at))
    }

    fn not_before(&self, floor: DateTime<Utc>) -> DateTime<Utc> {
        Utc::now().max(floor)
    }
}

/// Truncate `text` to at most `limit` bytes without splitting a character.
pub fn truncate_utf8(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
