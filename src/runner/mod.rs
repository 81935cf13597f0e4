//! Execution engine: drives one job from `queued` to a terminal state.
//!
//! Pipeline, strictly in order:
//!
//! 1. resolve the profile (falling back to the configured default)
//! 2. `queued → running`, persisted before any slow work
//! 3. start the telemetry trace (best effort)
//! 4. clone or fetch the repository under its lock, detect the base branch
//! 5. materialize the profile package
//! 6. build agent arguments and environment
//! 7. spawn the agent and persist its pid
//! 8. wait with the profile timeout, terminating the process group on expiry
//!    or when the record is cancelled from elsewhere
//! 9. record exit code, output, and discovered session id
//! 10. open a pull request when the profile asks for one (best effort)
//! 11. ship the transcript and close the trace (always, best effort)
//!
//! [`Runner::run`] never returns an error: every failure before the agent
//! exits becomes a `failed` record. Terminal writes go through
//! [`JobStore::update`], so a concurrent cancellation is never overwritten.

pub mod process;
pub mod signal;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agentcore_common::{Job, JobStatus, ProcessOutcome, TransitionError};
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::errors::{RunnerError, StoreError};
use crate::jobs::JobStore;
use crate::pr::{PrRequest, PullRequestCreator};
use crate::profiles::{self, MaterializeTarget, Profile, ProfileRegistry, PromptContext};
use crate::repos::{self, RepoCache};
use crate::telemetry::{self, SharedTelemetry};

pub use process::{AgentCommand, AgentExit, RunningAgent, find_session_id};

/// Collaborators a [`Runner`] drives.
pub struct RunnerDeps {
    pub config: Arc<AppConfig>,
    pub jobs: JobStore,
    pub profiles: Arc<ProfileRegistry>,
    pub repos: Arc<RepoCache>,
    pub telemetry: SharedTelemetry,
    pub pull_requests: Arc<dyn PullRequestCreator>,
}

pub struct Runner {
    config: Arc<AppConfig>,
    jobs: JobStore,
    profiles: Arc<ProfileRegistry>,
    repos: Arc<RepoCache>,
    telemetry: SharedTelemetry,
    pull_requests: Arc<dyn PullRequestCreator>,
    worker: String,
}

/// Where the agent ran; filled in as the pipeline progresses.
#[derive(Debug, Default)]
struct Workspace {
    cwd: Option<PathBuf>,
    base_ref: Option<String>,
}

/// Move a job to `failed`, starting it first when it never left `queued`.
pub(crate) fn force_failed(
    job: &mut Job,
    worker: &str,
    error: &str,
) -> Result<(), TransitionError> {
    if job.status() == JobStatus::Queued {
        job.start(worker)?;
    }
    job.fail(error, None)
}

impl Runner {
    pub fn new(deps: RunnerDeps) -> Self {
        let worker = deps.config.worker_id();
        Self {
            config: deps.config,
            jobs: deps.jobs,
            profiles: deps.profiles,
            repos: deps.repos,
            telemetry: deps.telemetry,
            pull_requests: deps.pull_requests,
            worker,
        }
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    /// Run `job` to completion and return its final stored record.
    pub async fn run(&self, job: Job) -> Job {
        let id = job.id().to_string();
        let mut workspace = Workspace::default();

        info!(job_id = %id, profile = %job.profile(), "job starting");
        if let Err(e) = self.execute(&job, &mut workspace).await {
            self.record_failure(&id, &e).await;
        }

        self.finalize(&id, job).await
    }

    async fn execute(&self, job: &Job, workspace: &mut Workspace) -> Result<(), RunnerError> {
        let id = job.id();

        let profile = self
            .profiles
            .resolve(job.profile(), self.config.default_profile())
            .map_err(|_| RunnerError::ProfileNotFound(job.profile().to_string()))?;

        let (running, ()) = self.jobs.update(id, |j| j.start(&self.worker)).await?;
        if let Err(e) = self.telemetry.start_trace(&running).await {
            warn!(job_id = %id, error = %e, "telemetry trace start failed");
        }

        if let Some(url) = job.repo_url() {
            let dir = self.repos.ensure(url).await?;
            let base_ref = match job.base_ref() {
                Some(base) => base.to_string(),
                None => detect_base_branch(dir.clone()).await,
            };
            workspace.base_ref = Some(base_ref);
            workspace.cwd = Some(dir);
        } else {
            workspace.base_ref = job.base_ref().map(String::from);
        }

        let config_dir = self.materialize(&profile, id, workspace.cwd.as_deref()).await?;
        self.jobs
            .update(id, |j| {
                j.record_workspace(
                    workspace.cwd.as_ref().map(|p| p.display().to_string()),
                    config_dir.as_ref().map(|p| p.display().to_string()),
                )
            })
            .await?;

        let command = AgentCommand {
            binary: self.config.agent.binary.clone(),
            args: self.agent_args(&profile, job, workspace),
            cwd: workspace.cwd.clone(),
            env: self.agent_env(config_dir.as_deref()),
        };
        let agent = command.spawn()?;
        let pid = agent.pid();
        match self.jobs.update(id, |j| j.attach_process(pid)).await {
            Ok(_) => info!(job_id = %id, pid, "agent running"),
            Err(StoreError::Transition(_)) => {
                // Cancelled between spawn and pid write; the canceller had no pid.
                info!(job_id = %id, pid, "job cancelled during spawn, terminating agent");
                if let Err(e) = signal::terminate_group(pid) {
                    warn!(job_id = %id, pid, error = %e, "failed to terminate agent");
                }
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let limit = Duration::from_secs(profile.agent.timeout_secs);
        let grace = Duration::from_secs(self.config.agent.termination_grace_secs);
        let wait = agent.wait(limit, grace);
        tokio::pin!(wait);
        let exit = tokio::select! {
            exit = &mut wait => exit?,
            () = self.ended_elsewhere(id) => {
                info!(job_id = %id, pid, "job ended by another party, terminating agent");
                if let Err(e) = signal::terminate_group(pid) {
                    warn!(job_id = %id, pid, error = %e, "failed to terminate agent");
                }
                match tokio::time::timeout(grace, &mut wait).await {
                    Ok(exit) => exit?,
                    Err(_) => {
                        if let Err(e) = signal::kill_group(pid) {
                            warn!(job_id = %id, pid, error = %e, "failed to kill agent");
                        }
                        wait.await?
                    }
                }
            }
        };
        let (exit_code, stdout, stderr) = match exit {
            AgentExit::Exited {
                exit_code,
                stdout,
                stderr,
            } => (exit_code, stdout, stderr),
            AgentExit::TimedOut { after, stderr, .. } => {
                return Err(RunnerError::Timeout {
                    secs: after.as_secs(),
                    stderr,
                });
            }
        };

        let outcome = ProcessOutcome {
            exit_code,
            session_id: find_session_id(&stdout),
            stdout,
            stderr,
        };
        let completed = match self.jobs.update(id, |j| j.complete(outcome)).await {
            Ok((job, ())) => job,
            Err(StoreError::Transition(e)) => {
                debug!(job_id = %id, reason = %e, "job already terminal, exit not recorded");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        info!(job_id = %id, exit_code, status = %completed.status(), "agent exited");

        if completed.status() == JobStatus::Succeeded && profile.auto_pr {
            if let (Some(dir), Some(base)) = (workspace.cwd.as_deref(), workspace.base_ref.as_deref()) {
                self.open_pull_request(&completed, dir, base).await;
            }
        }
        Ok(())
    }

    /// Resolves once the stored record is terminal, which only a
    /// cancellation can cause while the agent is still running.
    async fn ended_elsewhere(&self, id: &str) {
        let poll = Duration::from_millis(self.config.agent.cancel_poll_ms.max(10));
        loop {
            tokio::time::sleep(poll).await;
            match self.jobs.load(id).await {
                Ok(Some(job)) if job.is_terminal() => return,
                Ok(_) => {}
                Err(e) => debug!(job_id = %id, error = %e, "could not re-read job while waiting"),
            }
        }
    }

    /// Write the profile package where the agent will read it and return
    /// the config directory handed to the agent, if any.
    async fn materialize(
        &self,
        profile: &Profile,
        job_id: &str,
        cwd: Option<&Path>,
    ) -> Result<Option<PathBuf>, RunnerError> {
        let agent = &self.config.agent;
        let (target_root, config_dir) = if agent.isolate_config_dir {
            let dir = agent.job_config_root.join(job_id);
            (Some(dir.clone()), Some(dir))
        } else {
            (cwd.map(Path::to_path_buf), agent.home_path.clone())
        };
        let Some(root) = target_root else {
            return Ok(config_dir);
        };

        let profile = profile.clone();
        let isolate = agent.isolate_config_dir;
        let written = tokio::task::spawn_blocking(move || {
            if isolate {
                std::fs::create_dir_all(&root).map_err(|e| crate::errors::ProfileError::Io {
                    path: root.clone(),
                    source: e,
                })?;
                profiles::materialize(&profile, MaterializeTarget::ConfigDir(&root))
            } else {
                profiles::materialize(&profile, MaterializeTarget::Project(&root))
            }
        })
        .await
        .map_err(|e| RunnerError::Store(StoreError::Join(e.to_string())))?
        .map_err(RunnerError::Materialize)?;
        debug!(job_id = %job_id, files = written.len(), "profile materialized");
        Ok(config_dir)
    }

    fn agent_args(&self, profile: &Profile, job: &Job, workspace: &Workspace) -> Vec<String> {
        let context = PromptContext {
            job_id: job.id(),
            task: job.task(),
            repo_url: job.repo_url(),
            base_ref: workspace.base_ref.as_deref(),
        };
        let mut args = profiles::build_cli_args(profile, job.task(), &context);
        if let Some(session) = job.resume_session_id() {
            args.extend(["--resume".to_string(), session.to_string()]);
        }
        args
    }

    fn agent_env(&self, config_dir: Option<&Path>) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        let otel = &self.config.otel;
        if otel.enabled {
            let flag = |on: bool| if on { "1" } else { "0" }.to_string();
            env.insert("CLAUDE_CODE_ENABLE_TELEMETRY".into(), "1".into());
            env.insert("OTEL_METRICS_EXPORTER".into(), "otlp".into());
            env.insert("OTEL_LOGS_EXPORTER".into(), "otlp".into());
            env.insert("OTEL_EXPORTER_OTLP_PROTOCOL".into(), otel.protocol.clone());
            env.insert("OTEL_EXPORTER_OTLP_ENDPOINT".into(), otel.endpoint.clone());
            env.insert("OTEL_LOG_USER_PROMPTS".into(), flag(otel.log_prompts));
            env.insert("OTEL_LOG_TOOL_DETAILS".into(), flag(otel.log_tool_details));
        }
        if let Some(dir) = config_dir {
            env.insert("CLAUDE_CONFIG_DIR".into(), dir.display().to_string());
        }
        if let Some(token) = &self.config.github.token {
            env.insert("GITHUB_TOKEN".into(), token.clone());
        }
        env
    }

    async fn open_pull_request(&self, job: &Job, repo_dir: &Path, base_ref: &str) {
        let request = PrRequest {
            job,
            repo_dir,
            base_ref,
        };
        match self.pull_requests.create(request).await {
            Ok(Some(url)) => {
                if let Err(e) = self.jobs.update(job.id(), |j| j.attach_pr(url)).await {
                    warn!(job_id = %job.id(), error = %e, "failed to record pull request url");
                }
            }
            Ok(None) => debug!(job_id = %job.id(), "no pull request needed"),
            Err(e) => warn!(job_id = %job.id(), error = %e, "auto pull request failed"),
        }
    }

    async fn record_failure(&self, id: &str, cause: &RunnerError) {
        let message = cause.to_string();
        warn!(job_id = %id, error = %message, "job failed");
        match self
            .jobs
            .update(id, |j| force_failed(j, &self.worker, &message))
            .await
        {
            Ok(_) => {}
            Err(StoreError::Transition(e)) => {
                debug!(job_id = %id, reason = %e, "job already terminal, failure not recorded")
            }
            Err(e) => error!(job_id = %id, error = %e, "could not persist job failure"),
        }
    }

    async fn finalize(&self, id: &str, submitted: Job) -> Job {
        let job = match self.jobs.load(id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                error!(job_id = %id, "job record vanished during run");
                submitted
            }
            Err(e) => {
                error!(job_id = %id, error = %e, "could not reload job record");
                submitted
            }
        };

        let transcripts = &self.config.telemetry.transcripts_dir;
        match telemetry::ship_transcript(self.telemetry.as_ref(), transcripts, &job).await {
            Ok(turns) if turns > 0 => debug!(job_id = %id, turns, "transcript shipped"),
            Ok(_) => {}
            Err(e) => warn!(job_id = %id, error = %e, "transcript shipping failed"),
        }
        if let Err(e) = self.telemetry.end_trace(&job).await {
            warn!(job_id = %id, error = %e, "telemetry trace end failed");
        }

        info!(job_id = %id, status = %job.status(), "job finished");
        job
    }
}

async fn detect_base_branch(dir: PathBuf) -> String {
    tokio::task::spawn_blocking(move || repos::default_branch(&dir))
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "default branch detection failed");
            "main".to_string()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::FileLock;
    use crate::store::{FileBackend, KvStore};
    use crate::telemetry::NoopTelemetry;
    use agentcore_common::{NO_EXIT_CODE, NewJob};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Mutex;
    use tempfile::{TempDir, tempdir};

    #[derive(Default)]
    struct RecordingPrs {
        calls: Mutex<Vec<String>>,
        url: Option<String>,
    }

    #[async_trait]
    impl PullRequestCreator for RecordingPrs {
        async fn create(&self, request: PrRequest<'_>) -> Result<Option<String>> {
            self.calls.lock().unwrap().push(request.base_ref.to_string());
            Ok(self.url.clone())
        }
    }

    struct Harness {
        dir: TempDir,
        runner: Runner,
        prs: Arc<RecordingPrs>,
    }

    impl Harness {
        fn reload_profiles(mut self) -> Self {
            self.runner.profiles = Arc::new(ProfileRegistry::load(&self.runner.config).unwrap());
            self
        }
    }

    fn stub_agent(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn harness(agent_body: &str, tweak: impl FnOnce(&mut AppConfig)) -> Harness {
        harness_with_prs(agent_body, tweak, RecordingPrs::default())
    }

    fn harness_with_prs(
        agent_body: &str,
        tweak: impl FnOnce(&mut AppConfig),
        prs: RecordingPrs,
    ) -> Harness {
        let dir = tempdir().unwrap();
        let mut config = AppConfig::rooted_at(dir.path());
        config.agent.binary = stub_agent(dir.path(), agent_body).display().to_string();
        config.agent.termination_grace_secs = 2;
        config.worker.name = Some("test-worker".into());
        tweak(&mut config);
        let config = Arc::new(config);

        let jobs = JobStore::new(KvStore::durable_only(FileBackend::new(&config.store.root)));
        let lock = Arc::new(FileLock::new(config.repos.root.clone()));
        let prs = Arc::new(prs);
        let runner = Runner::new(RunnerDeps {
            config: config.clone(),
            jobs,
            profiles: Arc::new(ProfileRegistry::load(&config).unwrap()),
            repos: Arc::new(RepoCache::new(&config, lock)),
            telemetry: Arc::new(NoopTelemetry),
            pull_requests: prs.clone(),
        });
        Harness { dir, runner, prs }
    }

    fn write_profile(h: &Harness, name: &str, yml: &str) -> PathBuf {
        let dir = h.dir.path().join("profiles").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("profile.yml"), yml).unwrap();
        dir
    }

    async fn submit(h: &Harness, spec: NewJob) -> Job {
        let job = h.runner.jobs().create(spec).await.unwrap();
        h.runner.run(job).await
    }

    #[tokio::test]
    async fn test_successful_run_records_output_and_session() {
        let h = harness(
            r#"echo "args: $*"; echo '{"type":"result","session_id":"sess-42"}'"#,
            |_| {},
        );
        let job = submit(&h, NewJob::new("do the thing", "review")).await;
        assert_eq!(job.status(), JobStatus::Succeeded);
        assert_eq!(job.exit_code(), Some(0));
        assert_eq!(job.session_id(), Some("sess-42"));
        assert_eq!(job.worker(), Some("test-worker"));
        assert!(job.pid().is_some());
        let output = job.output().unwrap();
        assert!(output.contains("--max-turns 40"));
        assert!(output.contains("-p do the thing"));
        assert!(job.pr_url().is_none());
        assert!(job.started_at().unwrap() <= job.ended_at().unwrap());
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_with_stderr() {
        let h = harness("echo boom >&2; exit 7", |_| {});
        let job = submit(&h, NewJob::new("task", "code")).await;
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.exit_code(), Some(7));
        assert_eq!(job.error().map(str::trim), Some("boom"));
    }

    #[tokio::test]
    async fn test_unknown_profile_without_default_fails_before_spawn() {
        let h = harness("touch \"$(dirname \"$0\")/spawned\"", |c| {
            c.agent.default_profile = String::new();
        });
        let job = submit(&h, NewJob::new("task", "nope").with_repo("/no/such/repo")).await;
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.error(), Some("Profile not found: nope"));
        assert_eq!(job.exit_code(), Some(NO_EXIT_CODE));
        assert!(job.pid().is_none());
        assert!(!h.dir.path().join("spawned").exists());
        assert!(!h.dir.path().join("repos").exists());
    }

    #[tokio::test]
    async fn test_unknown_profile_falls_back_to_default() {
        let h = harness("exit 0", |_| {});
        let job = submit(&h, NewJob::new("task", "nope")).await;
        assert_eq!(job.status(), JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_timeout_terminates_and_fails() {
        let h = harness(
            "trap 'touch \"$(dirname \"$0\")/terminated\"; exit 143' TERM\nwhile true; do sleep 0.1; done",
            |_| {},
        );
        write_profile(&h, "quick", "claude:\n  timeout: 1\nauto_pr: false\n");
        let h = h.reload_profiles();
        let job = submit(&h, NewJob::new("task", "quick")).await;
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.error(), Some("Timeout after 1s"));
        assert_eq!(job.exit_code(), Some(NO_EXIT_CODE));
        assert!(h.dir.path().join("terminated").exists());
    }

    #[tokio::test]
    async fn test_timeout_error_carries_captured_stderr() {
        let h = harness(
            "echo 'fatal: auth prompt blocked' >&2\nwhile true; do sleep 0.1; done",
            |_| {},
        );
        write_profile(&h, "quick", "claude:\n  timeout: 1\nauto_pr: false\n");
        let h = h.reload_profiles();
        let job = submit(&h, NewJob::new("task", "quick")).await;
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(
            job.error(),
            Some("Timeout after 1s\nfatal: auth prompt blocked")
        );
    }

    #[tokio::test]
    async fn test_missing_binary_fails_job() {
        let h = harness("exit 0", |c| {
            c.agent.binary = "/nonexistent/agent-binary".into();
        });
        let job = submit(&h, NewJob::new("task", "code")).await;
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(
            job.error(),
            Some("Agent binary not found: /nonexistent/agent-binary")
        );
    }

    #[tokio::test]
    async fn test_clone_failure_fails_job() {
        let h = harness("exit 0", |_| {});
        let missing = h.dir.path().join("missing-origin");
        let job = submit(
            &h,
            NewJob::new("task", "code").with_repo(missing.display().to_string()),
        )
        .await;
        assert_eq!(job.status(), JobStatus::Failed);
        assert!(job.error().unwrap().starts_with("Clone failed:"));
    }

    #[tokio::test]
    async fn test_cancellation_from_another_worker_terminates_agent() {
        let h = harness(
            "trap 'touch \"$(dirname \"$0\")/terminated\"; exit 143' TERM\nwhile true; do sleep 0.1; done",
            |c| c.agent.cancel_poll_ms = 50,
        );
        let job = h
            .runner
            .jobs()
            .create(NewJob::new("task", "code"))
            .await
            .unwrap();
        let id = job.id().to_string();

        // Marks the record only, the way a canceller without the pid would.
        let cancel_remotely = async {
            loop {
                let current = h.runner.jobs().load(&id).await.unwrap().unwrap();
                if current.pid().is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
            h.runner.jobs().update(&id, |j| Ok(j.cancel())).await.unwrap();
        };

        let started = std::time::Instant::now();
        let (job, ()) = tokio::join!(h.runner.run(job), cancel_remotely);
        assert_eq!(job.status(), JobStatus::Cancelled);
        assert!(job.exit_code().is_none());
        assert!(h.dir.path().join("terminated").exists());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancelled_before_run_stays_cancelled() {
        let h = harness("touch \"$(dirname \"$0\")/spawned\"", |_| {});
        let job = h
            .runner
            .jobs()
            .create(NewJob::new("task", "code"))
            .await
            .unwrap();
        h.runner.jobs().update(job.id(), |j| Ok(j.cancel())).await.unwrap();
        let job = h.runner.run(job).await;
        assert_eq!(job.status(), JobStatus::Cancelled);
        assert!(job.exit_code().is_none());
        assert!(!h.dir.path().join("spawned").exists());
    }

    #[tokio::test]
    async fn test_environment_and_isolated_config_dir() {
        let h = harness(
            "echo \"CFG=$CLAUDE_CONFIG_DIR TOKEN=$GITHUB_TOKEN OTEL=$CLAUDE_CODE_ENABLE_TELEMETRY\"",
            |c| {
                c.agent.isolate_config_dir = true;
                c.github.token = Some("ghp_test".into());
                c.otel.enabled = true;
            },
        );
        let pkg = write_profile(&h, "iso", "auto_pr: false\n");
        std::fs::create_dir_all(pkg.join(".claude")).unwrap();
        std::fs::write(pkg.join(".claude/CLAUDE.md"), "rules").unwrap();
        let h = h.reload_profiles();

        let job = submit(&h, NewJob::new("task", "iso")).await;
        assert_eq!(job.status(), JobStatus::Succeeded);
        let expected_dir = h.dir.path().join("job-state").join(job.id());
        assert_eq!(job.config_dir(), Some(expected_dir.display().to_string().as_str()));
        assert!(expected_dir.join("CLAUDE.md").exists());
        let output = job.output().unwrap();
        assert!(output.contains(&format!("CFG={}", expected_dir.display())));
        assert!(output.contains("TOKEN=ghp_test"));
        assert!(output.contains("OTEL=1"));
    }

    #[tokio::test]
    async fn test_resume_flag_appended() {
        let h = harness("echo \"$*\"", |_| {});
        let job = submit(&h, NewJob::new("task", "code").with_resume_session("prev-1")).await;
        assert!(job.output().unwrap().trim_end().ends_with("--resume prev-1"));
        assert_eq!(job.resume_session_id(), Some("prev-1"));
    }

    #[test]
    fn test_force_failed_from_queued_and_running() {
        let mut queued = Job::new(NewJob::new("t", "code"));
        force_failed(&mut queued, "w", "boom").unwrap();
        assert_eq!(queued.status(), JobStatus::Failed);
        assert_eq!(queued.worker(), Some("w"));

        let mut cancelled = Job::new(NewJob::new("t", "code"));
        cancelled.cancel();
        assert!(force_failed(&mut cancelled, "w", "boom").is_err());
    }

    mod with_repository {
        use super::*;

        fn git_available() -> bool {
            std::process::Command::new("git")
                .arg("--version")
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false)
        }

        fn init_origin(dir: &Path) -> String {
            let repo = git2::Repository::init(dir).unwrap();
            std::fs::write(dir.join("README.md"), "hello").unwrap();
            let mut index = repo.index().unwrap();
            index.add_path(Path::new("README.md")).unwrap();
            index.write().unwrap();
            let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
            let sig = git2::Signature::now("Test", "test@example.com").unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
                .unwrap();
            dir.display().to_string()
        }

        #[tokio::test]
        async fn test_runs_in_clone_and_opens_pull_request() {
            if !git_available() {
                return;
            }
            let prs = RecordingPrs {
                url: Some("https://github.com/org/repo/pull/1".into()),
                ..Default::default()
            };
            let h = harness_with_prs("pwd; ls", |_| {}, prs);
            let origin = h.dir.path().join("origin");
            std::fs::create_dir_all(&origin).unwrap();
            let url = init_origin(&origin);

            let job = submit(&h, NewJob::new("task", "code").with_repo(url.clone())).await;
            assert_eq!(job.status(), JobStatus::Succeeded);
            let clone = h.runner.repos.repo_dir(&url);
            assert_eq!(job.cwd(), Some(clone.display().to_string().as_str()));
            assert!(job.output().unwrap().contains("README.md"));
            assert_eq!(job.pr_url(), Some("https://github.com/org/repo/pull/1"));
            assert_eq!(h.prs.calls.lock().unwrap().len(), 1);
        }

        #[tokio::test]
        async fn test_auto_pr_disabled_skips_pipeline() {
            if !git_available() {
                return;
            }
            let h = harness("exit 0", |_| {});
            let origin = h.dir.path().join("origin");
            std::fs::create_dir_all(&origin).unwrap();
            let url = init_origin(&origin);

            let job = submit(
                &h,
                NewJob::new("task", "review")
                    .with_repo(url)
                    .with_base_ref("develop"),
            )
            .await;
            assert_eq!(job.status(), JobStatus::Succeeded);
            assert!(job.pr_url().is_none());
            assert!(h.prs.calls.lock().unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_failed_job_never_opens_pull_request() {
            if !git_available() {
                return;
            }
            let prs = RecordingPrs {
                url: Some("https://example.com/pr".into()),
                ..Default::default()
            };
            let h = harness_with_prs("exit 1", |_| {}, prs);
            let origin = h.dir.path().join("origin");
            std::fs::create_dir_all(&origin).unwrap();
            let url = init_origin(&origin);
            let job = submit(&h, NewJob::new("task", "code").with_repo(url)).await;
            assert_eq!(job.status(), JobStatus::Failed);
            assert!(job.pr_url().is_none());
            assert!(h.prs.calls.lock().unwrap().is_empty());
        }
    }
}
