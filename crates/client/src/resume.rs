//! Client-side memory of which session belongs to which file.
//!
//! Hints are keyed by `filename:size` and only ever used as a starting
//! point; the server's session state is authoritative.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tokio::sync::Mutex;
use tracing::warn;

use crate::error::UploadError;

/// `filename:size` to session id, optionally persisted as JSON.
#[derive(Debug)]
pub struct ResumeHints {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<String, String>>,
}

impl ResumeHints {
    /// Hints that live only as long as this value.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Loads hints from `path`. A missing file starts empty; an unreadable
    /// one is ignored and overwritten on the next change.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, UploadError> {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %path.display(), "ignoring unreadable resume hints: {e}");
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }

    pub fn key(filename: &str, file_size: u64) -> String {
        format!("{filename}:{file_size}")
    }

    pub async fn get(&self, filename: &str, file_size: u64) -> Option<String> {
        self.entries
            .lock()
            .await
            .get(&Self::key(filename, file_size))
            .cloned()
    }

    pub async fn set(
        &self,
        filename: &str,
        file_size: u64,
        session_id: &str,
    ) -> Result<(), UploadError> {
        let mut entries = self.entries.lock().await;
        entries.insert(Self::key(filename, file_size), session_id.to_owned());
        self.persist(&entries).await
    }

    /// Forgets the hint; returns whether one existed.
    pub async fn remove(&self, filename: &str, file_size: u64) -> Result<bool, UploadError> {
        let mut entries = self.entries.lock().await;
        if entries.remove(&Self::key(filename, file_size)).is_none() {
            return Ok(false);
        }
        self.persist(&entries).await?;
        Ok(true)
    }

    async fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), UploadError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(entries)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}
