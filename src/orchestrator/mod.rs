//! Job submission, lookup, and cancellation.
//!
//! Every submission persists a `queued` record before anything else happens,
//! then hands the job to a supervised background task. `wait=true` callers
//! await that task; nothing else is blocked by them.

use std::sync::Arc;
use std::time::Duration;

use agentcore_common::{CancelResponse, Job, JobMode, JobStatus, NewJob, SubmitJobRequest};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::drain::DrainCoordinator;
use crate::errors::{OrchestratorError, StoreError};
use crate::jobs::JobStore;
use crate::runner::{Runner, force_failed, signal};

const FALLBACK_PROFILE: &str = "code";
const PANIC_MESSAGE: &str = "job runner panicked";

#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<AppConfig>,
    jobs: JobStore,
    runner: Arc<Runner>,
    drain: DrainCoordinator,
    tracker: TaskTracker,
}

impl Orchestrator {
    pub fn new(config: Arc<AppConfig>, runner: Arc<Runner>, drain: DrainCoordinator) -> Self {
        Self {
            config,
            jobs: runner.jobs().clone(),
            runner,
            drain,
            tracker: TaskTracker::new(),
        }
    }

    pub fn worker(&self) -> &str {
        self.runner.worker()
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    pub fn drain(&self) -> &DrainCoordinator {
        &self.drain
    }

    /// Number of job runs still in flight in this process.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Persist a `queued` job and start it in the background.
    ///
    /// With `wait` set, returns the terminal record instead of the queued one.
    pub async fn submit(&self, request: SubmitJobRequest) -> Result<Job, OrchestratorError> {
        let task = request.task.trim();
        if task.is_empty() {
            return Err(OrchestratorError::BadRequest("task must not be empty".into()));
        }
        if self.drain.is_draining().await {
            return Err(OrchestratorError::Draining {
                worker: self.worker().to_string(),
            });
        }

        let profile = request
            .profile
            .filter(|p| !p.trim().is_empty())
            .or_else(|| self.config.default_profile().map(String::from))
            .unwrap_or_else(|| FALLBACK_PROFILE.to_string());
        let mode = if request.wait {
            JobMode::Sync
        } else {
            JobMode::FireAndForget
        };

        let mut spec = NewJob::new(task, profile)
            .with_mode(mode)
            .with_ttl(self.config.repos.job_ttl_seconds);
        if let Some(url) = request.repo_url.filter(|u| !u.trim().is_empty()) {
            spec = spec.with_repo(url);
        }
        if let Some(base) = request.base_ref.filter(|b| !b.trim().is_empty()) {
            spec = spec.with_base_ref(base);
        }
        if let Some(session) = request.session_id.filter(|s| !s.trim().is_empty()) {
            spec = spec.with_resume_session(session);
        }

        let job = self.jobs.create(spec).await?;
        info!(job_id = %job.id(), profile = %job.profile(), mode = %mode.as_str(), "job queued");

        let handle = self.tracker.spawn(supervise(
            self.runner.clone(),
            self.jobs.clone(),
            job.clone(),
        ));
        if !request.wait {
            return Ok(job);
        }

        match handle.await {
            Ok(Ok(job)) => Ok(job),
            Ok(Err(detail)) => Err(OrchestratorError::RunAborted {
                id: job.id().to_string(),
                detail,
            }),
            Err(e) => Err(OrchestratorError::RunAborted {
                id: job.id().to_string(),
                detail: e.to_string(),
            }),
        }
    }

    /// Fetch one job, with read-time expiry applied.
    pub async fn get(&self, id: &str) -> Result<Job, OrchestratorError> {
        self.jobs
            .get(id)
            .await?
            .ok_or_else(|| OrchestratorError::JobNotFound(id.to_string()))
    }

    pub async fn list(
        &self,
        limit: usize,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, OrchestratorError> {
        Ok(self.jobs.list(limit, status).await?)
    }

    /// Cancel a queued or running job. Already-terminal jobs are left as is.
    ///
    /// The agent only receives a signal when it runs on this worker; a pid
    /// recorded by another host means nothing here.
    pub async fn cancel(&self, id: &str) -> Result<CancelResponse, OrchestratorError> {
        let job = self.get(id).await?;
        if job.is_terminal() {
            debug!(job_id = %id, status = %job.status(), "cancel on terminal job ignored");
            return Ok(CancelResponse {
                id: id.to_string(),
                status: job.status(),
                cancelled: false,
            });
        }

        if let Some(pid) = job.pid() {
            if job.worker() == Some(self.worker()) {
                match signal::terminate_group(pid) {
                    Ok(signal::Delivery::Sent) => info!(job_id = %id, pid, "sent SIGTERM to agent"),
                    Ok(signal::Delivery::Gone) => {
                        debug!(job_id = %id, pid, "agent already exited")
                    }
                    Err(e) => warn!(job_id = %id, pid, error = %e, "failed to signal agent"),
                }
            } else {
                warn!(
                    job_id = %id,
                    owner = job.worker().unwrap_or("unknown"),
                    "job runs on another worker, marking cancelled without signalling"
                );
            }
        }

        let (job, cancelled) = match self.jobs.update(id, |j| Ok(j.cancel())).await {
            Ok(result) => result,
            Err(StoreError::NotFound(_)) => return Err(OrchestratorError::JobNotFound(id.into())),
            Err(e) => return Err(e.into()),
        };
        if cancelled {
            info!(job_id = %id, "job cancelled");
        }
        Ok(CancelResponse {
            id: id.to_string(),
            status: job.status(),
            cancelled,
        })
    }

    /// Stop accepting tracked work and wait up to `timeout` for runs to end.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let remaining = self.tracker.len();
        if remaining > 0 {
            info!(remaining, "waiting for in-flight jobs");
        }
        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(remaining = self.tracker.len(), "shutdown timed out with jobs still running");
                false
            }
        }
    }
}

/// Run one job on its own task so a panic cannot escape, then record it.
///
/// Errs only when the panic could not be written to the store.
async fn supervise(runner: Arc<Runner>, jobs: JobStore, job: Job) -> Result<Job, String> {
    let id = job.id().to_string();
    let worker = runner.worker().to_string();
    let run = tokio::spawn(async move { runner.run(job).await });
    let e = match run.await {
        Ok(job) => return Ok(job),
        Err(e) => e,
    };

    error!(job_id = %id, error = %e, "job runner aborted");
    match jobs
        .update(&id, |j| force_failed(j, &worker, PANIC_MESSAGE))
        .await
    {
        Ok((job, ())) => Ok(job),
        Err(StoreError::Transition(_)) => match jobs.get(&id).await {
            Ok(Some(job)) => Ok(job),
            Ok(None) => Err(format!("job {} vanished after runner panic", id)),
            Err(e) => Err(e.to_string()),
        },
        Err(e) => {
            error!(job_id = %id, error = %e, "could not record runner panic");
            Err(e.to_string())
        }
    }
}
