//! Best-effort trace export for job runs.
//!
//! A job produces one trace: created when the run starts, extended with the
//! agent's conversation turns read from its session transcript, and closed
//! with the final status. Nothing here may change a job's outcome; callers
//! log and discard every error.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use agentcore_common::Job;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::TelemetryConfig;

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn start_trace(&self, job: &Job) -> Result<()>;
    async fn append_turns(&self, job: &Job, turns: &[TranscriptTurn]) -> Result<()>;
    async fn end_trace(&self, job: &Job) -> Result<()>;
}

pub type SharedTelemetry = Arc<dyn TelemetrySink>;

/// Sink for deployments without a tracing backend.
pub struct NoopTelemetry;

#[async_trait]
impl TelemetrySink for NoopTelemetry {
    async fn start_trace(&self, _: &Job) -> Result<()> {
        Ok(())
    }
    async fn append_turns(&self, _: &Job, _: &[TranscriptTurn]) -> Result<()> {
        Ok(())
    }
    async fn end_trace(&self, _: &Job) -> Result<()> {
        Ok(())
    }
}

/// Langfuse sink when host and both keys are configured, otherwise no-op.
pub fn from_config(config: &TelemetryConfig) -> SharedTelemetry {
    match (
        config.langfuse_host.as_deref(),
        config.langfuse_public_key.as_deref(),
        config.langfuse_secret_key.as_deref(),
    ) {
        (Some(host), Some(public_key), Some(secret_key)) => {
            Arc::new(LangfuseSink::new(host, public_key, secret_key))
        }
        _ => Arc::new(NoopTelemetry),
    }
}

// ── Langfuse ──────────────────────────────────────────────────────────

pub struct LangfuseSink {
    client: reqwest::Client,
    endpoint: String,
    public_key: String,
    secret_key: String,
}

impl LangfuseSink {
    pub fn new(host: &str, public_key: &str, secret_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/api/public/ingestion", host.trim_end_matches('/')),
            public_key: public_key.to_string(),
            secret_key: secret_key.to_string(),
        }
    }

    async fn ingest(&self, batch: Vec<Value>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let count = batch.len();
        self.client
            .post(&self.endpoint)
            .basic_auth(&self.public_key, Some(&self.secret_key))
            .json(&json!({ "batch": batch }))
            .send()
            .await
            .context("Failed to reach Langfuse")?
            .error_for_status()
            .context("Langfuse rejected ingestion batch")?;
        debug!(events = count, "telemetry batch ingested");
        Ok(())
    }
}

fn event(kind: &str, body: Value) -> Value {
    json!({
        "id": uuid::Uuid::new_v4().to_string(),
        "timestamp": Utc::now().to_rfc3339(),
        "type": kind,
        "body": body,
    })
}

#[async_trait]
impl TelemetrySink for LangfuseSink {
    async fn start_trace(&self, job: &Job) -> Result<()> {
        self.ingest(vec![event("trace-create", trace_start_body(job))])
            .await
    }

    async fn append_turns(&self, job: &Job, turns: &[TranscriptTurn]) -> Result<()> {
        let batch = turns
            .iter()
            .map(|turn| event("span-create", span_body(job.id(), turn)))
            .collect();
        self.ingest(batch).await
    }

    async fn end_trace(&self, job: &Job) -> Result<()> {
        self.ingest(vec![event("trace-create", trace_end_body(job))])
            .await
    }
}

fn trace_start_body(job: &Job) -> Value {
    json!({
        "id": job.id(),
        "name": "agentcore-job",
        "input": {
            "task": job.task(),
            "profile": job.profile(),
            "repo_url": job.repo_url(),
        },
        "metadata": { "job_id": job.id(), "base_ref": job.base_ref() },
    })
}

fn trace_end_body(job: &Job) -> Value {
    json!({
        "id": job.id(),
        "output": {
            "status": job.status(),
            "exit_code": job.exit_code(),
            "pr_url": job.pr_url(),
            "error": job.error(),
        },
        "metadata": {
            "started_at": job.started_at(),
            "ended_at": job.ended_at(),
            "session_id": job.session_id(),
        },
    })
}

fn span_body(trace_id: &str, turn: &TranscriptTurn) -> Value {
    let role = turn.role.as_str();
    let (input, output) = match turn.role {
        Role::User => (Some(&turn.text), None),
        Role::Assistant => (None, Some(&turn.text)),
    };
    json!({
        "traceId": trace_id,
        "name": format!("turn-{}-{}", role, turn.index),
        "input": input,
        "output": output,
        "metadata": { "turn_index": turn.index, "role": role },
    })
}

// ── Transcripts ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptTurn {
    pub index: usize,
    pub role: Role,
    pub text: String,
}

/// Project directory name the agent uses for a working directory.
pub fn encode_cwd(cwd: &str) -> String {
    cwd.replace('/', "-")
}

/// `{projects}/{encoded cwd}/{session}.jsonl`, else the first project
/// directory holding that session.
pub fn find_transcript(projects: &Path, session_id: &str, cwd: Option<&str>) -> Option<PathBuf> {
    let file_name = format!("{}.jsonl", session_id);
    if let Some(cwd) = cwd {
        let candidate = projects.join(encode_cwd(cwd)).join(&file_name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(projects)
        .ok()?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs.into_iter()
        .map(|d| d.join(&file_name))
        .find(|candidate| candidate.is_file())
}

/// Conversation turns with readable text, in transcript order.
pub fn parse_transcript(text: &str) -> Vec<TranscriptTurn> {
    let mut turns = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        let Ok(entry) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let role = match entry.get("type").and_then(Value::as_str) {
            Some("user") => Role::User,
            Some("assistant") => Role::Assistant,
            _ => continue,
        };
        let content = entry.get("message").and_then(|m| m.get("content"));
        if let Some(text) = content.and_then(turn_text) {
            turns.push(TranscriptTurn {
                index: turns.len(),
                role,
                text,
            });
        }
    }
    turns
}

fn turn_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Array(blocks) => {
            let parts: Vec<String> = blocks.iter().filter_map(block_text).collect();
            (!parts.is_empty()).then(|| parts.join("\n"))
        }
        _ => None,
    }
}

fn block_text(block: &Value) -> Option<String> {
    match block.get("type").and_then(Value::as_str)? {
        "text" => block
            .get("text")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from),
        "tool_use" => Some(format!(
            "[tool_use: {}]",
            block.get("name").and_then(Value::as_str).unwrap_or("tool")
        )),
        _ => None,
    }
}

/// Read the job's session transcript, if any, and append its turns.
pub async fn ship_transcript(sink: &dyn TelemetrySink, projects: &Path, job: &Job) -> Result<usize> {
    let Some(session_id) = job.session_id() else {
        return Ok(0);
    };
    let Some(path) = find_transcript(projects, session_id, job.cwd()) else {
        debug!(job_id = %job.id(), session_id, "no transcript found");
        return Ok(0);
    };
    let text = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read transcript {}", path.display()))?;
    let turns = parse_transcript(&text);
    sink.append_turns(job, &turns).await?;
    Ok(turns.len())
}
