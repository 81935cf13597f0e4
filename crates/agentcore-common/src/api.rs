//! Wire types shared by the REST server and the CLI client.

use serde::{Deserialize, Serialize};

use crate::job::{Job, JobStatus};

/// Body of `POST /jobs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitJobRequest {
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_ref: Option<String>,
    /// Block until the job reaches a terminal state.
    #[serde(default)]
    pub wait: bool,
    /// Resume an earlier agent session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Query string of `GET /jobs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobListQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobList {
    pub count: usize,
    pub jobs: Vec<Job>,
}

impl JobList {
    pub fn new(jobs: Vec<Job>) -> Self {
        Self {
            count: jobs.len(),
            jobs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub id: String,
    pub status: JobStatus,
    /// False when the job was already terminal.
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub model: String,
    pub max_turns: u32,
    pub worktree: bool,
    pub auto_pr: bool,
    pub permission_mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effort: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub service: String,
    pub worker: String,
    pub draining: bool,
}

/// Error payload returned by every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
