//! Durable one-file-per-key backend.
//!
//! Key segments separated by `:` become directories, so `job:abc` is stored
//! at `{root}/job/abc.json`. Writes go to a temporary sibling first and are
//! renamed into place, so readers never observe a partial value.

use std::path::{Path, PathBuf};

use crate::errors::StoreError;

const EXTENSION: &str = "json";

#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key to its file path, rejecting anything that could escape `root`.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let segments = key_segments(key)?;
        let mut path = self.root.clone();
        let (last, dirs) = segments
            .split_last()
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;
        for dir in dirs {
            path.push(dir);
        }
        path.push(format!("{}.{}", last, EXTENSION));
        Ok(path)
    }

    pub async fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| durable(parent, source))?;

        let tmp = path.with_extension(format!("{}.{}.tmp", EXTENSION, uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, value)
            .await
            .map_err(|source| durable(&tmp, source))?;
        if let Err(source) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(durable(&path, source));
        }
        Ok(())
    }

    pub async fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(durable(&path, source)),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(durable(&path, source)),
        }
    }

    /// Every `(key, value)` directly under the `namespace` directory.
    pub async fn list(&self, namespace: &str) -> Result<Vec<(String, String)>, StoreError> {
        let segments = key_segments(namespace)?;
        let mut dir = self.root.clone();
        for segment in &segments {
            dir.push(segment);
        }

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(durable(&dir, source)),
        };

        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| durable(&dir, source))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let key = format!("{}:{}", segments.join(":"), stem);
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => out.push((key, content)),
                // Deleted between listing and reading.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(durable(&path, source)),
            }
        }
        Ok(out)
    }
}

fn key_segments(key: &str) -> Result<Vec<&str>, StoreError> {
    let segments: Vec<&str> = key.split(':').collect();
    let valid = segments.iter().all(|s| {
        !s.is_empty() && *s != "." && *s != ".." && !s.contains(['/', '\\', '\0'])
    });
    if !valid {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(segments)
}

fn durable(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Durable {
        path: path.to_path_buf(),
        source,
    }
}
