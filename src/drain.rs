//! Orderly worker shutdown.
//!
//! Draining sets `pod:{worker}:draining` in the KV store. While the flag is
//! live the orchestrator refuses new submissions; in-flight jobs keep
//! running. The coordinator then polls until no job is `running` on this
//! worker (or the timeout passes) and clears the flag.
//!
//! The flag carries its own deadline because the durable copy never expires.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::StoreError;
use crate::jobs::JobStore;
use crate::store::KvStore;

const DEFAULT_POLL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DrainFlag {
    since: DateTime<Utc>,
    until: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// True when every job finished before the timeout.
    pub idle: bool,
    /// Jobs still running on this worker when the drain ended.
    pub remaining: usize,
}

#[derive(Clone)]
pub struct DrainCoordinator {
    kv: KvStore,
    jobs: JobStore,
    worker: String,
    poll: Duration,
}

impl DrainCoordinator {
    pub fn new(jobs: JobStore, worker: impl Into<String>) -> Self {
        Self {
            kv: jobs.kv().clone(),
            jobs,
            worker: worker.into(),
            poll: DEFAULT_POLL,
        }
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    fn key(&self) -> String {
        format!("pod:{}:draining", self.worker)
    }

    /// Set the draining flag for `timeout`.
    pub async fn mark(&self, timeout: Duration) -> Result<(), StoreError> {
        let since = Utc::now();
        let until = since
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(365));
        self.kv
            .put_json(&self.key(), &DrainFlag { since, until }, Some(timeout.max(Duration::from_secs(1))))
            .await?;
        info!(worker = %self.worker, timeout_secs = timeout.as_secs(), "worker marked draining");
        Ok(())
    }

    /// Whether the flag is set and unexpired. Store errors read as not draining.
    pub async fn is_draining(&self) -> bool {
        match self.kv.get_json::<DrainFlag>(&self.key()).await {
            Ok(Some(flag)) => flag.until > Utc::now(),
            Ok(None) => false,
            Err(e) => {
                warn!(worker = %self.worker, error = %e, "could not read drain flag");
                false
            }
        }
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        self.kv.delete(&self.key()).await?;
        debug!(worker = %self.worker, "drain flag cleared");
        Ok(())
    }

    /// Poll until no job is running on this worker or `timeout` passes.
    pub async fn wait_for_idle(&self, timeout: Duration) -> Result<DrainReport, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = self.jobs.running_on(&self.worker).await?.len();
            if remaining == 0 {
                return Ok(DrainReport {
                    idle: true,
                    remaining,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(DrainReport {
                    idle: false,
                    remaining,
                });
            }
            info!(worker = %self.worker, remaining, "waiting for jobs to finish");
            tokio::time::sleep(self.poll.min(deadline - now)).await;
        }
    }

    /// Mark, wait, clear.
    pub async fn drain(&self, timeout: Duration) -> Result<DrainReport, StoreError> {
        self.mark(timeout).await?;
        let report = self.wait_for_idle(timeout).await;
        if let Err(e) = self.clear().await {
            warn!(worker = %self.worker, error = %e, "failed to clear drain flag");
        }
        report
    }
}
