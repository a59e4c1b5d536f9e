//! Versioned session records with single-record compare-and-swap.
//!
//! Every successful write bumps the record's version. Writers that must not
//! lose concurrent updates load a [`Versioned`] record, derive the new value
//! and call [`SessionStore::compare_and_swap`] with the version they read.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use chunkferry_transfer::validate_storage_key;

use crate::ServerError;
use crate::session::UploadSession;

/// A boxed future returned by store methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ServerError>> + Send + 'a>>;

/// A value tagged with the version it was read at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub version: u64,
    #[serde(rename = "session")]
    pub value: T,
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// Written; carries the new version.
    Swapped(u64),
    /// Someone else wrote first.
    Conflict,
    /// The record no longer exists.
    Missing,
}

/// Durable storage for session records.
pub trait SessionStore: Send + Sync + 'static {
    /// Stores a new record at version 1, replacing any previous record.
    fn insert(&self, session: UploadSession) -> StoreFuture<'_, ()>;

    fn load<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<Versioned<UploadSession>>>;

    /// Replaces the record only if it is still at `expected_version`.
    fn compare_and_swap(
        &self,
        expected_version: u64,
        session: UploadSession,
    ) -> StoreFuture<'_, CasOutcome>;

    /// Deletes the record. Returns `false` if it did not exist.
    fn remove<'a>(&'a self, id: &'a str) -> StoreFuture<'a, bool>;

    fn list_ids(&self) -> StoreFuture<'_, Vec<String>>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Session store backed by a lock-protected map.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    records: Mutex<HashMap<String, Versioned<UploadSession>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn insert(&self, session: UploadSession) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut records = self.records.lock().await;
            records.insert(
                session.id.clone(),
                Versioned {
                    version: 1,
                    value: session,
                },
            );
            Ok(())
        })
    }

    fn load<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<Versioned<UploadSession>>> {
        Box::pin(async move { Ok(self.records.lock().await.get(id).cloned()) })
    }

    fn compare_and_swap(
        &self,
        expected_version: u64,
        session: UploadSession,
    ) -> StoreFuture<'_, CasOutcome> {
        Box::pin(async move {
            let mut records = self.records.lock().await;
            let Some(current) = records.get_mut(&session.id) else {
                return Ok(CasOutcome::Missing);
            };
            if current.version != expected_version {
                return Ok(CasOutcome::Conflict);
            }
            current.version += 1;
            current.value = session;
            Ok(CasOutcome::Swapped(current.version))
        })
    }

    fn remove<'a>(&'a self, id: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { Ok(self.records.lock().await.remove(id).is_some()) })
    }

    fn list_ids(&self) -> StoreFuture<'_, Vec<String>> {
        Box::pin(async move { Ok(self.records.lock().await.keys().cloned().collect()) })
    }
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

/// Session store keeping one JSON file per session.
///
/// Writes go through a temp file and an atomic rename, so readers never see
/// a torn record. Mutations are serialised by a store-wide lock, which makes
/// the version check and the write a single step.
#[derive(Debug)]
pub struct FileSessionStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSessionStore {
    /// Opens (and creates if needed) the store directory.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, ServerError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Record path, or `None` for ids that are not safe file names.
    fn record_path(&self, id: &str) -> Option<PathBuf> {
        validate_storage_key(id).ok()?;
        Some(self.dir.join(format!("{id}.json")))
    }

    async fn read_record(&self, id: &str) -> Result<Option<Versioned<UploadSession>>, ServerError> {
        let Some(path) = self.record_path(id) else {
            return Ok(None);
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_record(&self, record: &Versioned<UploadSession>) -> Result<(), ServerError> {
        let id = &record.value.id;
        let path = self
            .record_path(id)
            .ok_or_else(|| ServerError::InvalidRequest(format!("invalid session id: {id}")))?;
        let tmp = self.dir.join(format!(".{id}.json.tmp"));
        tokio::fs::write(&tmp, serde_json::to_vec(record)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

impl SessionStore for FileSessionStore {
    fn insert(&self, session: UploadSession) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            self.write_record(&Versioned {
                version: 1,
                value: session,
            })
            .await
        })
    }

    fn load<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<Versioned<UploadSession>>> {
        Box::pin(self.read_record(id))
    }

    fn compare_and_swap(
        &self,
        expected_version: u64,
        session: UploadSession,
    ) -> StoreFuture<'_, CasOutcome> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            let Some(current) = self.read_record(&session.id).await? else {
                return Ok(CasOutcome::Missing);
            };
            if current.version != expected_version {
                return Ok(CasOutcome::Conflict);
            }
            let version = current.version + 1;
            self.write_record(&Versioned {
                version,
                value: session,
            })
            .await?;
            Ok(CasOutcome::Swapped(version))
        })
    }

    fn remove<'a>(&'a self, id: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            let Some(path) = self.record_path(id) else {
                return Ok(false);
            };
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn list_ids(&self) -> StoreFuture<'_, Vec<String>> {
        Box::pin(async move {
            let mut ids = Vec::new();
            let mut entries = tokio::fs::read_dir(&self.dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with('.') {
                    continue;
                }
                if let Some(id) = name.strip_suffix(".json") {
                    ids.push(id.to_owned());
                }
            }
            Ok(ids)
        })
    }
}
