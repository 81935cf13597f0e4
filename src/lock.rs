//! Mutual exclusion for shared on-disk resources.
//!
//! Two strategies sit behind [`DistributedLock`], chosen by
//! `locking.strategy` at deployment time:
//!
//! - [`CacheLock`]: set-if-absent lease on `lock:{resource}` in the shared fast
//!   cache, polled with exponential backoff. Safe across hosts, including ones
//!   sharing a network filesystem with unreliable advisory locks.
//! - [`FileLock`]: `flock` on `{root}/{resource}/.lock`. Single host only;
//!   released by the kernel when the handle closes, including on crash.
//!
//! A lease that expires while its holder is still working is not revoked;
//! guarded operations must tolerate running twice concurrently.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fs2::FileExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::LockError;
use crate::store::SharedCache;

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Block until `resource` is held or `wait` elapses.
    async fn acquire(
        &self,
        resource: &str,
        lease: Duration,
        wait: Duration,
    ) -> Result<LockGuard, LockError>;
}

pub type SharedLock = Arc<dyn DistributedLock>;

enum Held {
    Cache {
        cache: SharedCache,
        key: String,
        token: String,
    },
    File {
        file: File,
        path: PathBuf,
    },
    Released,
}

/// Proof of holding a lock. Release explicitly with [`LockGuard::release`];
/// dropping also releases (best effort for cache leases).
pub struct LockGuard {
    resource: String,
    held: Held,
}

impl LockGuard {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Release the lock. Releasing twice, or after the lease expired and
    /// someone else took it, is a no-op.
    pub async fn release(&mut self) -> Result<(), LockError> {
        match std::mem::replace(&mut self.held, Held::Released) {
            Held::Cache { cache, key, token } => {
                let removed = cache
                    .delete_if_equals(&key, &token)
                    .await
                    .map_err(|e| LockError::Backend(e.to_string()))?;
                if !removed {
                    debug!(resource = %self.resource, "lease already expired or taken over");
                }
                Ok(())
            }
            Held::File { file, path } => {
                let result = tokio::task::spawn_blocking(move || {
                    let unlocked = FileExt::unlock(&file);
                    drop(file);
                    unlocked
                })
                .await
                .map_err(|e| LockError::Backend(e.to_string()))?;
                result.map_err(|source| LockError::Io { path, source })
            }
            Held::Released => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Held::Cache { cache, key, token } = std::mem::replace(&mut self.held, Held::Released)
        {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = cache.delete_if_equals(&key, &token).await {
                            warn!(key = %key, error = %e, "failed to release dropped lease");
                        }
                    });
                }
                Err(_) => warn!(key = %key, "lease dropped outside a runtime, left to expire"),
            }
        }
        // File variant: closing the handle releases the flock.
    }
}

// ── Cache lease ───────────────────────────────────────────────────────

pub struct CacheLock {
    cache: SharedCache,
}

impl CacheLock {
    pub fn new(cache: SharedCache) -> Self {
        Self { cache }
    }

    pub fn key_for(resource: &str) -> String {
        format!("lock:{}", resource)
    }
}

#[async_trait]
impl DistributedLock for CacheLock {
    async fn acquire(
        &self,
        resource: &str,
        lease: Duration,
        wait: Duration,
    ) -> Result<LockGuard, LockError> {
        let key = Self::key_for(resource);
        let token = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        let deadline = started + wait;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let acquired = self
                .cache
                .set_if_absent(&key, &token, lease)
                .await
                .map_err(|e| LockError::Backend(e.to_string()))?;
            if acquired {
                debug!(resource = %resource, waited_ms = started.elapsed().as_millis() as u64, "lease acquired");
                return Ok(LockGuard {
                    resource: resource.to_string(),
                    held: Held::Cache {
                        cache: self.cache.clone(),
                        key,
                        token,
                    },
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    resource: resource.to_string(),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

// ── Advisory file lock ────────────────────────────────────────────────

pub struct FileLock {
    root: PathBuf,
}

impl FileLock {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, resource: &str) -> PathBuf {
        self.root.join(resource).join(".lock")
    }
}

fn open_and_lock(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)?;
    file.lock_exclusive()?;
    Ok(file)
}

#[async_trait]
impl DistributedLock for FileLock {
    /// `lease` does not apply: the kernel holds the lock until the handle closes.
    async fn acquire(
        &self,
        resource: &str,
        _lease: Duration,
        wait: Duration,
    ) -> Result<LockGuard, LockError> {
        let path = self.path_for(resource);
        let blocking_path = path.clone();
        // If the wait times out the blocking task still finishes; its file
        // handle is then dropped with the task output, releasing the lock.
        let task = tokio::task::spawn_blocking(move || open_and_lock(&blocking_path));

        match tokio::time::timeout(wait, task).await {
            Ok(Ok(Ok(file))) => Ok(LockGuard {
                resource: resource.to_string(),
                held: Held::File { file, path },
            }),
            Ok(Ok(Err(source))) => Err(LockError::Io { path, source }),
            Ok(Err(join)) => Err(LockError::Backend(join.to_string())),
            Err(_) => Err(LockError::Timeout {
                resource: resource.to_string(),
                waited: wait,
            }),
        }
    }
}
