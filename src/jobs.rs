//! Job records persisted through the dual-backend store.
//!
//! Records live under `job:{id}`. Lifecycle changes go through
//! [`JobStore::update`], which re-reads the current record and applies a
//! transition to it, so a terminal state written by one party (for example a
//! cancellation) is never overwritten by a stale copy held by another.

use std::sync::Arc;
use std::time::Duration;

use agentcore_common::{Job, JobStatus, NewJob, TransitionError};
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::StoreError;
use crate::store::KvStore;

const NAMESPACE: &str = "job";

#[derive(Clone)]
pub struct JobStore {
    kv: KvStore,
    /// Serializes read-modify-write cycles within this process.
    update_guard: Arc<Mutex<()>>,
}

impl JobStore {
    pub fn new(kv: KvStore) -> Self {
        Self {
            kv,
            update_guard: Arc::new(Mutex::new(())),
        }
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    fn key(id: &str) -> String {
        format!("{}:{}", NAMESPACE, id)
    }

    /// Create and persist a new `queued` record.
    pub async fn create(&self, spec: NewJob) -> Result<Job, StoreError> {
        let job = Job::new(spec);
        self.save(&job).await?;
        debug!(job_id = %job.id(), "job record created");
        Ok(job)
    }

    /// Persist `job`. A zero TTL keeps the cache copy indefinitely.
    pub async fn save(&self, job: &Job) -> Result<(), StoreError> {
        let ttl = Some(job.ttl_seconds())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        self.kv.put_json(&Self::key(job.id()), job, ttl).await
    }

    /// Read a record as clients should see it.
    ///
    /// In cache-backed deployments a non-terminal record older than its TTL is
    /// reported as `expired`; the stored copy is left untouched.
    pub async fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let mut job = self.load(id).await?;
        if let Some(job) = job.as_mut() {
            self.observe_expiry(job);
        }
        Ok(job)
    }

    /// Read a record exactly as stored.
    pub async fn load(&self, id: &str) -> Result<Option<Job>, StoreError> {
        self.kv.get_json(&Self::key(id)).await
    }

    /// Apply `transition` to the current stored record and persist the result.
    ///
    /// Nothing is written when the transition is rejected.
    pub async fn update<F, T>(&self, id: &str, transition: F) -> Result<(Job, T), StoreError>
    where
        F: FnOnce(&mut Job) -> Result<T, TransitionError>,
    {
        let _guard = self.update_guard.lock().await;
        let mut job = self
            .load(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let out = transition(&mut job)?;
        self.save(&job).await?;
        Ok((job, out))
    }

    /// Newest-first listing with optional status filter.
    pub async fn list(
        &self,
        limit: usize,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .kv
            .list(NAMESPACE)
            .await?
            .into_iter()
            .filter_map(|raw| match serde_json::from_str::<Job>(&raw) {
                Ok(job) => Some(job),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable job record");
                    None
                }
            })
            .collect();

        for job in jobs.iter_mut() {
            self.observe_expiry(job);
        }
        if let Some(status) = status {
            jobs.retain(|j| j.status() == status);
        }
        jobs.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        jobs.truncate(limit);
        Ok(jobs)
    }

    /// Jobs this worker is still executing.
    pub async fn running_on(&self, worker: &str) -> Result<Vec<Job>, StoreError> {
        Ok(self
            .list(usize::MAX, Some(JobStatus::Running))
            .await?
            .into_iter()
            .filter(|j| j.worker() == Some(worker))
            .collect())
    }

    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.kv.delete(&Self::key(id)).await
    }

    fn observe_expiry(&self, job: &mut Job) {
        if self.kv.has_cache() && job.expire_if_stale(Utc::now()) {
            debug!(job_id = %job.id(), "non-terminal record past its TTL reported as expired");
        }
    }
}
