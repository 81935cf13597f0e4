//! Dual-backend key-value store.
//!
//! Writes go to the fast cache (best effort) and then always to the durable
//! file backend; a durable failure is the only write failure callers see.
//! Reads try the cache first and fall back to the durable copy on a miss or
//! cache error, without backfilling the cache. TTLs apply to the cache copy
//! only.
//!
//! There is no cross-backend transaction: concurrent writers to one key race
//! and the last write wins at each backend independently.

pub mod cache;
pub mod durable;

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

pub use cache::{FastCache, MemoryCache, RedisCache, SharedCache};
pub use durable::FileBackend;

use crate::errors::StoreError;

#[derive(Clone)]
pub struct KvStore {
    cache: Option<SharedCache>,
    durable: FileBackend,
}

impl KvStore {
    pub fn new(cache: Option<SharedCache>, durable: FileBackend) -> Self {
        Self { cache, durable }
    }

    /// A store with no fast cache at all.
    pub fn durable_only(durable: FileBackend) -> Self {
        Self::new(None, durable)
    }

    pub fn cache(&self) -> Option<&SharedCache> {
        self.cache.as_ref()
    }

    pub fn has_cache(&self) -> bool {
        self.cache.is_some()
    }

    pub fn durable(&self) -> &FileBackend {
        &self.durable
    }

    pub async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.set(key, value, ttl).await {
                warn!(key = %key, error = %e, "fast cache write failed, continuing with durable store");
            }
        }
        self.durable.write(key, value).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        if let Some(cache) = &self.cache {
            match cache.get(key).await {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => debug!(key = %key, "fast cache miss"),
                Err(e) => warn!(key = %key, error = %e, "fast cache read failed, using durable store"),
            }
        }
        self.durable.read(key).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.delete(key).await {
                warn!(key = %key, error = %e, "fast cache delete failed");
            }
        }
        self.durable.delete(key).await
    }

    /// All values stored under `namespace`.
    ///
    /// Cache entries (the shared view) win over this process's durable copies
    /// of the same key; durable-only keys are included as well.
    pub async fn list(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        let mut merged: HashMap<String, String> = self
            .durable
            .list(namespace)
            .await?
            .into_iter()
            .collect();

        if let Some(cache) = &self.cache {
            match cache.keys(&format!("{}:", namespace)).await {
                Ok(keys) => {
                    for key in keys {
                        match cache.get(&key).await {
                            Ok(Some(value)) => {
                                merged.insert(key, value);
                            }
                            Ok(None) => {}
                            Err(e) => {
                                warn!(key = %key, error = %e, "fast cache read failed during listing")
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(namespace = %namespace, error = %e, "fast cache listing failed, using durable store")
                }
            }
        }

        Ok(merged.into_values().collect())
    }

    pub async fn put_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(value).map_err(|source| StoreError::Serialization {
            key: key.to_string(),
            source,
        })?;
        self.put(key, &encoded, ttl).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|source| StoreError::Serialization {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }
}
