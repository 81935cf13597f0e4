//! Agent subprocess: spawn, capture, bounded wait, termination.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use agentcore_common::NO_EXIT_CODE;

use super::signal::{self, Delivery};
use crate::errors::RunnerError;

/// Everything needed to start one agent process.
#[derive(Debug, Clone, Default)]
pub struct AgentCommand {
    pub binary: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Overlay on top of the inherited environment.
    pub env: BTreeMap<String, String>,
}

impl AgentCommand {
    /// Start the process as its own group leader with piped output.
    pub fn spawn(&self) -> Result<RunningAgent, RunnerError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RunnerError::BinaryNotFound(self.binary.clone())
            } else {
                RunnerError::SpawnFailed(e)
            }
        })?;

        let pid = child
            .id()
            .ok_or_else(|| RunnerError::SpawnFailed(std::io::Error::other("process exited before its pid was read")))?;
        let stdout = child.stdout.take().map(collect);
        let stderr = child.stderr.take().map(collect);
        debug!(pid, binary = %self.binary, "agent process spawned");

        Ok(RunningAgent {
            child,
            pid,
            stdout,
            stderr,
        })
    }
}

fn collect<R>(mut reader: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Err(e) = reader.read_to_end(&mut buf).await {
            warn!(error = %e, "agent output stream closed with error");
        }
        buf
    })
}

/// How the process ended.
#[derive(Debug)]
pub enum AgentExit {
    Exited {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    /// Output written before the group was terminated is kept.
    TimedOut {
        after: Duration,
        stdout: String,
        stderr: String,
    },
}

pub struct RunningAgent {
    child: Child,
    pid: u32,
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

impl RunningAgent {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Wait up to `limit` for exit. On expiry the process group gets SIGTERM,
    /// then SIGKILL if it is still alive after `grace`.
    pub async fn wait(mut self, limit: Duration, grace: Duration) -> Result<AgentExit, RunnerError> {
        match tokio::time::timeout(limit, self.child.wait()).await {
            Ok(Ok(status)) => {
                let stdout = drain(self.stdout.take(), grace).await;
                let stderr = drain(self.stderr.take(), grace).await;
                Ok(AgentExit::Exited {
                    exit_code: exit_code(status),
                    stdout,
                    stderr,
                })
            }
            Ok(Err(e)) => Err(RunnerError::Wait(e)),
            Err(_) => {
                warn!(pid = self.pid, timeout_secs = limit.as_secs(), "agent timed out, terminating process group");
                self.terminate(grace).await;
                let stdout = drain(self.stdout.take(), grace).await;
                let stderr = drain(self.stderr.take(), grace).await;
                Ok(AgentExit::TimedOut {
                    after: limit,
                    stdout,
                    stderr,
                })
            }
        }
    }

    async fn terminate(&mut self, grace: Duration) {
        match signal::terminate_group(self.pid) {
            Ok(Delivery::Sent) => {}
            Ok(Delivery::Gone) => debug!(pid = self.pid, "process group already gone"),
            Err(e) => warn!(pid = self.pid, error = %e, "failed to signal process group"),
        }
        if tokio::time::timeout(grace, self.child.wait()).await.is_ok() {
            return;
        }
        warn!(pid = self.pid, "agent ignored SIGTERM, killing");
        if let Err(e) = signal::kill_group(self.pid) {
            warn!(pid = self.pid, error = %e, "failed to kill process group");
        }
        if let Err(e) = self.child.kill().await {
            warn!(pid = self.pid, error = %e, "failed to reap killed agent");
        }
    }
}

/// Await a reader task. A descendant that escaped the group can hold the pipe
/// open, so the wait is bounded.
async fn drain(handle: Option<JoinHandle<Vec<u8>>>, bound: Duration) -> String {
    let Some(mut handle) = handle else {
        return String::new();
    };
    match tokio::time::timeout(bound, &mut handle).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(e)) => {
            warn!(error = %e, "output reader task failed");
            String::new()
        }
        Err(_) => {
            handle.abort();
            warn!("agent output pipe still open after exit, output dropped");
            String::new()
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(NO_EXIT_CODE)
}

/// Last session identifier printed on a JSON stdout line, searching from the end.
pub fn find_session_id(stdout: &str) -> Option<String> {
    stdout.lines().rev().find_map(|line| {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        let value: serde_json::Value = serde_json::from_str(line).ok()?;
        ["session_id", "sessionId"]
            .iter()
            .find_map(|key| value.get(*key).and_then(|v| v.as_str()))
            .filter(|sid| !sid.is_empty())
            .map(String::from)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> AgentCommand {
        AgentCommand {
            binary: "sh".into(),
            args: vec!["-c".into(), script.into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let agent = sh("echo out; echo err >&2; exit 3").spawn().unwrap();
        assert!(agent.pid() > 0);
        match agent.wait(Duration::from_secs(10), Duration::from_secs(1)).await.unwrap() {
            AgentExit::Exited {
                exit_code,
                stdout,
                stderr,
            } => {
                assert_eq!(exit_code, 3);
                assert_eq!(stdout.trim(), "out");
                assert_eq!(stderr.trim(), "err");
            }
            other => panic!("unexpected exit: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_env_overlay_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let mut cmd = sh("printf '%s %s' \"$AGENT_FLAG\" \"$(pwd)\"");
        cmd.env.insert("AGENT_FLAG".into(), "on".into());
        cmd.cwd = Some(dir.path().to_path_buf());
        let exit = cmd
            .spawn()
            .unwrap()
            .wait(Duration::from_secs(10), Duration::from_secs(1))
            .await
            .unwrap();
        let AgentExit::Exited { stdout, .. } = exit else {
            panic!("expected exit");
        };
        let canonical = dir.path().canonicalize().unwrap();
        assert!(stdout.starts_with("on "));
        assert!(stdout.ends_with(&*canonical.to_string_lossy()) || stdout.ends_with(&*dir.path().to_string_lossy()));
    }

    #[tokio::test]
    async fn test_missing_binary_is_binary_not_found() {
        let cmd = AgentCommand {
            binary: "/definitely/not/an/agent".into(),
            ..Default::default()
        };
        let err = cmd.spawn().err().unwrap();
        assert!(matches!(err, RunnerError::BinaryNotFound(b) if b == "/definitely/not/an/agent"));
    }

    #[tokio::test]
    async fn test_timeout_sends_sigterm_to_group() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("terminated");
        let script = format!(
            "trap 'touch {}; exit 143' TERM; while true; do sleep 0.1; done",
            marker.display()
        );
        let agent = sh(&script).spawn().unwrap();
        let exit = agent
            .wait(Duration::from_millis(300), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(exit, AgentExit::TimedOut { .. }));
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn test_timeout_keeps_output_written_before_termination() {
        let agent = sh("echo partial; echo 'fatal: auth prompt blocked' >&2; while true; do sleep 0.1; done")
            .spawn()
            .unwrap();
        let exit = agent
            .wait(Duration::from_millis(500), Duration::from_secs(2))
            .await
            .unwrap();
        let AgentExit::TimedOut { stdout, stderr, .. } = exit else {
            panic!("expected timeout, got {:?}", exit);
        };
        assert_eq!(stdout.trim(), "partial");
        assert_eq!(stderr.trim(), "fatal: auth prompt blocked");
    }

    #[tokio::test]
    async fn test_timeout_escalates_to_kill() {
        let agent = sh("trap '' TERM; while true; do sleep 0.1; done").spawn().unwrap();
        let started = std::time::Instant::now();
        let exit = agent
            .wait(Duration::from_millis(200), Duration::from_millis(300))
            .await
            .unwrap();
        assert!(matches!(exit, AgentExit::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_find_session_id_prefers_last_json_line() {
        let stdout = "starting\n{\"session_id\":\"first\"}\nnoise\n{\"type\":\"result\",\"sessionId\":\"last\"}\n";
        assert_eq!(find_session_id(stdout).as_deref(), Some("last"));
    }

    #[test]
    fn test_find_session_id_skips_invalid_json() {
        let stdout = "{\"session_id\":\"abc\"}\n{not json\n{\"other\":1}\n";
        assert_eq!(find_session_id(stdout).as_deref(), Some("abc"));
        assert!(find_session_id("plain text only").is_none());
        assert!(find_session_id("{\"session_id\":\"\"}").is_none());
    }
}
