//! Storage abstraction for the memory store snapshot.
//!
//! The memory store persists its whole collection as one opaque blob after
//! every mutation. This module defines the contract for that blob store and
//! provides file-backed and in-memory implementations.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Formal contract for whole-snapshot persistence.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Reads the last written snapshot, or `None` if nothing was ever written.
    async fn read_all(&self) -> Result<Option<Vec<u8>>>;

    /// Atomically replaces the stored snapshot.
    async fn write_all(&self, bytes: &[u8]) -> Result<()>;

    /// Health check for the storage backend.
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Stores the snapshot as a single file, replaced via write-then-rename.
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl DurableStore for FileSnapshotStore {
    async fn read_all(&self) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                debug!("Read {} bytes from {}", bytes.len(), self.path.display());
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", self.path.display())),
        }
    }

    async fn write_all(&self, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let tmp = self.temp_path();
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        debug!("Wrote {} bytes to {}", bytes.len(), self.path.display());
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => Ok(tokio::fs::metadata(parent).await.is_ok()),
            _ => Ok(true),
        }
    }
}

/// Volatile store, useful for tests and ephemeral runs.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    bytes: Mutex<Option<Vec<u8>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store with an existing snapshot.
    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(Some(bytes)),
        }
    }
}

#[async_trait]
impl DurableStore for InMemorySnapshotStore {
    async fn read_all(&self) -> Result<Option<Vec<u8>>> {
        let guard = self
            .bytes
            .lock()
            .map_err(|_| anyhow::anyhow!("snapshot lock poisoned"))?;
        Ok(guard.clone())
    }

    async fn write_all(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self
            .bytes
            .lock()
            .map_err(|_| anyhow::anyhow!("snapshot lock poisoned"))?;
        *guard = Some(bytes.to_vec());
        Ok(())
    }
}
