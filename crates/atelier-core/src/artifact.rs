//! Persistence for finished images.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use thiserror::Error;
use tracing::debug;

use crate::runtime::types::TaskId;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to create output directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("artifact store lock poisoned")]
    Poisoned,
}

/// Durable home for generated images.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist `image` for `task_id` and return a locator it can be found by.
    async fn save(&self, task_id: TaskId, image: &[u8]) -> Result<String, StorageError>;
}

/// Writes each artifact to `<dir>/<YYYYmmdd_HHMMSS>_<task-prefix>.<ext>`.
///
/// The extension is sniffed from the image bytes. The directory is created on
/// first use.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    dir: PathBuf,
}

impl FsArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(task_id: TaskId, image: &[u8]) -> String {
        let extension = image::guess_format(image)
            .ok()
            .and_then(|format| format.extensions_str().first().copied())
            .unwrap_or("bin");
        let id = task_id.to_string();
        format!(
            "{}_{}.{}",
            Utc::now().format("%Y%m%d_%H%M%S"),
            &id[..8],
            extension
        )
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn save(&self, task_id: TaskId, image: &[u8]) -> Result<String, StorageError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StorageError::CreateDir {
                path: self.dir.clone(),
                source,
            })?;

        let path = self.dir.join(Self::file_name(task_id, image));
        tokio::fs::write(&path, image)
            .await
            .map_err(|source| StorageError::Write {
                path: path.clone(),
                source,
            })?;

        debug!(%task_id, path = %path.display(), bytes = image.len(), "artifact written");
        Ok(path.display().to_string())
    }
}

/// Keeps artifacts in process memory. Locators look like `memory://<task-id>`.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    items: RwLock<HashMap<TaskId, Bytes>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, task_id: TaskId) -> Option<Bytes> {
        self.items.read().ok()?.get(&task_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.items.read().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn save(&self, task_id: TaskId, image: &[u8]) -> Result<String, StorageError> {
        self.items
            .write()
            .map_err(|_| StorageError::Poisoned)?
            .insert(task_id, Bytes::copy_from_slice(image));
        Ok(format!("memory://{task_id}"))
    }
}
