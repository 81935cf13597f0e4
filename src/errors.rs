//! Typed error hierarchy for agentcore.
//!
//! One enum per subsystem:
//! - `StoreError` for the dual-backend key-value store
//! - `LockError` for the distributed lock
//! - `RepoError` for repository cache acquisition
//! - `ProfileError` for profile loading and materialization
//! - `RunnerError` for a single job execution
//! - `OrchestratorError` for submission and cancellation

use std::path::PathBuf;
use std::time::Duration;

use agentcore_common::{ERROR_LIMIT_BYTES, TransitionError};
use thiserror::Error;

/// Room kept for the cause line ahead of captured stderr.
const CAUSE_RESERVE_BYTES: usize = 200;

/// Errors from the key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Durable store I/O failed at {path}: {source}")]
    Durable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to (de)serialize value for key {key}: {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Fast cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Invalid key '{0}'")]
    InvalidKey(String),

    #[error("Record {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Blocking store task failed: {0}")]
    Join(String),
}

/// Errors from lock acquisition.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Timed out after {waited:?} waiting for lock on {resource}")]
    Timeout { resource: String, waited: Duration },

    #[error("Lock backend error: {0}")]
    Backend(String),

    #[error("Lock file error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the repository cache.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("git {operation} failed for {url}: {detail}")]
    GitFailed {
        operation: &'static str,
        url: String,
        detail: String,
    },

    #[error("git {operation} timed out after {secs}s for {url}")]
    GitTimeout {
        operation: &'static str,
        url: String,
        secs: u64,
    },

    #[error("Lock wait for {url} timed out")]
    LockTimeout {
        url: String,
        #[source]
        source: LockError,
    },

    #[error(transparent)]
    Lock(LockError),

    #[error("Repository cache I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from profile resolution.
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("Profile not found: {0}")]
    NotFound(String),

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Failed to materialize profile {name}: {detail}")]
    Materialize { name: String, detail: String },

    #[error("Profile I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from one job execution. Every variant ends the job as `failed`.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    #[error("Profile materialization failed: {0}")]
    Materialize(#[source] ProfileError),

    #[error("Clone failed: {0}")]
    Repo(#[from] RepoError),

    #[error("Agent binary not found: {0}")]
    BinaryNotFound(String),

    #[error("Failed to spawn agent process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Timeout after {secs}s{}", stderr_tail(.stderr))]
    Timeout { secs: u64, stderr: String },

    #[error("Failed waiting on agent process: {0}")]
    Wait(#[source] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Newline plus the end of `stderr`, sized so the whole message fits the
/// job's error ceiling. Empty when nothing was captured.
fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim_end();
    if trimmed.is_empty() {
        return String::new();
    }
    let limit = ERROR_LIMIT_BYTES - CAUSE_RESERVE_BYTES;
    let mut start = trimmed.len().saturating_sub(limit);
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("\n{}", &trimmed[start..])
}

/// Errors from submission and cancellation.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Worker {worker} is draining and not accepting new jobs")]
    Draining { worker: String },

    #[error("Job {0} not found")]
    JobNotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Job {id} did not finish: {detail}")]
    RunAborted { id: String, detail: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_durable_carries_path() {
        let path = PathBuf::from("/store/job/abc.json");
        let err = StoreError::Durable {
            path: path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        match &err {
            StoreError::Durable { path: p, source } => {
                assert_eq!(p, &path);
                assert_eq!(source.kind(), std::io::ErrorKind::PermissionDenied);
            }
            _ => panic!("Expected Durable"),
        }
        assert!(err.to_string().contains("abc.json"));
    }

    #[test]
    fn lock_timeout_names_resource() {
        let err = LockError::Timeout {
            resource: "repo:abc123".into(),
            waited: Duration::from_secs(3),
        };
        assert!(err.to_string().contains("repo:abc123"));
    }

    #[test]
    fn runner_error_timeout_message_mentions_timeout() {
        let err = RunnerError::Timeout {
            secs: 30,
            stderr: String::new(),
        };
        assert_eq!(err.to_string(), "Timeout after 30s");
    }

    #[test]
    fn runner_error_timeout_keeps_stderr_tail() {
        let err = RunnerError::Timeout {
            secs: 1,
            stderr: "fatal: auth prompt blocked\n".into(),
        };
        assert_eq!(err.to_string(), "Timeout after 1s\nfatal: auth prompt blocked");

        let noisy = format!("{}END", "é".repeat(ERROR_LIMIT_BYTES));
        let message = RunnerError::Timeout {
            secs: 5,
            stderr: noisy,
        }
        .to_string();
        assert!(message.starts_with("Timeout after 5s\n"));
        assert!(message.ends_with("END"));
        assert!(message.len() <= ERROR_LIMIT_BYTES);
    }

    #[test]
    fn runner_error_converts_from_repo_error() {
        let inner = RepoError::GitFailed {
            operation: "clone",
            url: "https://example.com/r.git".into(),
            detail: "fatal: not found".into(),
        };
        let err: RunnerError = inner.into();
        match &err {
            RunnerError::Repo(RepoError::GitFailed { operation, .. }) => {
                assert_eq!(*operation, "clone")
            }
            _ => panic!("Expected RunnerError::Repo(GitFailed)"),
        }
        assert!(err.to_string().starts_with("Clone failed:"));
    }

    #[test]
    fn orchestrator_error_draining_is_matchable() {
        let err = OrchestratorError::Draining {
            worker: "pod-1".into(),
        };
        assert!(matches!(err, OrchestratorError::Draining { .. }));
        assert!(err.to_string().contains("pod-1"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::InvalidKey("x".into()));
        assert_std_error(&LockError::Backend("x".into()));
        assert_std_error(&ProfileError::NotFound("x".into()));
        assert_std_error(&RunnerError::Timeout {
            secs: 1,
            stderr: String::new(),
        });
        assert_std_error(&OrchestratorError::JobNotFound("x".into()));
    }
}
