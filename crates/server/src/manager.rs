//! Upload session lifecycle: create, query, delete, expire.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chunkferry_protocol::SessionStatus;
use chunkferry_protocol::messages::CreateSessionRequest;
use chunkferry_transfer::{DEFAULT_CHUNK_SIZE, total_chunks};

use crate::ServerError;
use crate::chunks::ChunkStore;
use crate::session::UploadSession;
use crate::store::{SessionStore, Versioned};

/// Limits applied when sessions are created.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub max_file_size: u64,
    pub ttl: Duration,
    /// Used when the client requests chunk size 0.
    pub default_chunk_size: u64,
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_file_size: 500 * 1024 * 1024,
            ttl: Duration::from_secs(24 * 60 * 60),
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            min_chunk_size: 64 * 1024,
            max_chunk_size: 16 * 1024 * 1024,
        }
    }
}

impl SessionLimits {
    /// Chunk size the server will actually use for a requested size.
    pub fn negotiate_chunk_size(&self, requested: u64) -> u64 {
        if requested == 0 {
            return self.default_chunk_size;
        }
        requested.clamp(self.min_chunk_size, self.max_chunk_size)
    }
}

/// Owns session records and the chunk storage namespaced by them.
pub struct SessionManager {
    sessions: Arc<dyn SessionStore>,
    chunks: Arc<dyn ChunkStore>,
    limits: SessionLimits,
}

impl SessionManager {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        chunks: Arc<dyn ChunkStore>,
        limits: SessionLimits,
    ) -> Self {
        Self {
            sessions,
            chunks,
            limits,
        }
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub fn chunks(&self) -> &Arc<dyn ChunkStore> {
        &self.chunks
    }

    /// Creates a new `pending` session.
    pub async fn create(&self, req: CreateSessionRequest) -> Result<UploadSession, ServerError> {
        if req.filename.trim().is_empty() {
            return Err(ServerError::InvalidRequest("filename is required".into()));
        }
        if req.file_size == 0 {
            return Err(ServerError::InvalidRequest("file is empty".into()));
        }
        if req.file_size > self.limits.max_file_size {
            return Err(ServerError::FileTooLarge {
                size: req.file_size,
                max: self.limits.max_file_size,
            });
        }

        let chunk_size = self.limits.negotiate_chunk_size(req.chunk_size);
        let total_chunks = total_chunks(req.file_size, chunk_size)?;
        let ttl = chrono::Duration::from_std(self.limits.ttl)
            .map_err(|e| ServerError::InvalidRequest(format!("invalid ttl: {e}")))?;

        let now = Utc::now();
        let session = UploadSession {
            id: uuid::Uuid::new_v4().to_string(),
            filename: req.filename,
            file_size: req.file_size,
            mime_type: req.mime_type,
            chunk_size,
            total_chunks,
            uploaded_chunks: Default::default(),
            status: SessionStatus::Pending,
            final_path: None,
            checksum: None,
            correlation_id: None,
            derived_assets: Vec::new(),
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        };

        self.sessions.insert(session.clone()).await?;
        info!(
            session = %session.id,
            filename = %session.filename,
            file_size = session.file_size,
            chunk_size,
            total_chunks,
            "upload session created"
        );
        Ok(session)
    }

    /// Returns the session, treating expired sessions as not found.
    pub async fn get(&self, id: &str) -> Result<UploadSession, ServerError> {
        Ok(self.load_live(id).await?.value)
    }

    /// Versioned load for writers; expired sessions are not found.
    pub(crate) async fn load_live(
        &self,
        id: &str,
    ) -> Result<Versioned<UploadSession>, ServerError> {
        match self.sessions.load(id).await? {
            Some(record) if !record.value.is_expired(Utc::now()) => Ok(record),
            Some(_) => {
                debug!(session = %id, "session expired");
                Err(ServerError::SessionNotFound(id.to_owned()))
            }
            None => Err(ServerError::SessionNotFound(id.to_owned())),
        }
    }

    /// Removes the session record and its chunks. Unknown ids succeed.
    pub async fn delete(&self, id: &str) -> Result<(), ServerError> {
        let existed = self.sessions.remove(id).await?;
        self.chunks.remove_session(id).await?;
        if existed {
            info!(session = %id, "upload session deleted");
        }
        Ok(())
    }

    /// Deletes every session past its expiry. Returns how many were removed.
    pub async fn sweep_expired(&self) -> Result<usize, ServerError> {
        let now = Utc::now();
        let mut removed = 0;
        for id in self.sessions.list_ids().await? {
            let Some(record) = self.sessions.load(&id).await? else {
                continue;
            };
            if record.value.is_expired(now) {
                self.delete(&id).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "expired sessions swept");
        }
        Ok(removed)
    }
}

/// Runs [`SessionManager::sweep_expired`] every `interval` until cancelled.
pub async fn run_sweeper(
    manager: Arc<SessionManager>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("sweeper stopped");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = manager.sweep_expired().await {
                    warn!("expiry sweep failed: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chunks::FsChunkStore;
    use crate::store::MemorySessionStore;

    pub(crate) async fn manager_in(dir: &std::path::Path, limits: SessionLimits) -> SessionManager {
        let chunks = FsChunkStore::open(dir).await.unwrap();
        SessionManager::new(
            Arc::new(MemorySessionStore::new()),
            Arc::new(chunks),
            limits,
        )
    }

    pub(crate) fn create_req(file_size: u64, chunk_size: u64) -> CreateSessionRequest {
        CreateSessionRequest {
            filename: "holiday video.mp4".into(),
            file_size,
            mime_type: "video/mp4".into(),
            chunk_size,
        }
    }

    #[test]
    fn chunk_size_negotiation() {
        let limits = SessionLimits::default();
        assert_eq!(limits.negotiate_chunk_size(0), DEFAULT_CHUNK_SIZE);
        assert_eq!(limits.negotiate_chunk_size(1), 64 * 1024);
        assert_eq!(limits.negotiate_chunk_size(256 * 1024), 256 * 1024);
        assert_eq!(limits.negotiate_chunk_size(u64::MAX), 16 * 1024 * 1024);
    }

    #[tokio::test]
    async fn create_computes_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), SessionLimits::default()).await;

        let session = manager
            .create(create_req(10 * 1024 * 1024, 256 * 1024))
            .await
            .unwrap();
        assert_eq!(session.total_chunks, 40);
        assert_eq!(session.status, SessionStatus::Pending);
        assert!(session.uploaded_chunks.is_empty());
        assert_eq!(
            session.expires_at - session.created_at,
            chrono::Duration::hours(24)
        );

        let fetched = manager.get(&session.id).await.unwrap();
        assert_eq!(fetched, session);
    }

    #[tokio::test]
    async fn create_with_default_chunk_size() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), SessionLimits::default()).await;
        let session = manager.create(create_req(3 * 1024 * 1024 + 1, 0)).await.unwrap();
        assert_eq!(session.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(session.total_chunks, 4);
    }

    #[tokio::test]
    async fn create_rejects_oversized_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), SessionLimits::default()).await;

        let err = manager
            .create(create_req(500 * 1024 * 1024 + 1, 0))
            .await
            .unwrap_err();
        assert_eq!(err.code(), 413);

        let err = manager.create(create_req(0, 0)).await.unwrap_err();
        assert_eq!(err.code(), 400);

        let mut req = create_req(10, 0);
        req.filename = "  ".into();
        assert_eq!(manager.create(req).await.unwrap_err().code(), 400);
    }

    #[tokio::test]
    async fn expired_session_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let limits = SessionLimits {
            ttl: Duration::ZERO,
            ..SessionLimits::default()
        };
        let manager = manager_in(dir.path(), limits).await;
        let session = manager.create(create_req(100, 0)).await.unwrap();

        let err = manager.get(&session.id).await.unwrap_err();
        assert!(matches!(err, ServerError::SessionNotFound(_)));
        // Lazy: the record is still there until swept or deleted.
        assert!(manager.sessions().load(&session.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_removes_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), SessionLimits::default()).await;
        let session = manager.create(create_req(100, 0)).await.unwrap();
        manager
            .chunks()
            .put_chunk(&session.id, 0, b"abc")
            .await
            .unwrap();

        manager.delete(&session.id).await.unwrap();
        manager.delete(&session.id).await.unwrap();
        assert!(manager.get(&session.id).await.is_err());
        assert!(!dir.path().join("chunks").join(&session.id).exists());
    }

    #[tokio::test]
    async fn sweep_removes_only_expired() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(dir.path(), SessionLimits::default()).await;
        let live = manager.create(create_req(100, 0)).await.unwrap();
        let stale = manager.create(create_req(100, 0)).await.unwrap();
        manager.chunks().put_chunk(&stale.id, 0, b"x").await.unwrap();

        // Push the second session into the past.
        let record = manager.sessions().load(&stale.id).await.unwrap().unwrap();
        let mut expired = record.value;
        expired.expires_at = Utc::now() - chrono::Duration::seconds(1);
        manager
            .sessions()
            .compare_and_swap(record.version, expired)
            .await
            .unwrap();

        assert_eq!(manager.sweep_expired().await.unwrap(), 1);
        assert!(manager.get(&live.id).await.is_ok());
        assert!(manager.sessions().load(&stale.id).await.unwrap().is_none());
        assert!(!dir.path().join("chunks").join(&stale.id).exists());
    }

    #[tokio::test]
    async fn sweeper_task_runs_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let limits = SessionLimits {
            ttl: Duration::ZERO,
            ..SessionLimits::default()
        };
        let manager = Arc::new(manager_in(dir.path(), limits).await);
        let session = manager.create(create_req(100, 0)).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_sweeper(
            Arc::clone(&manager),
            Duration::from_millis(20),
            cancel.clone(),
        ));

        let mut gone = false;
        for _ in 0..200 {
            if manager.sessions().load(&session.id).await.unwrap().is_none() {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(gone, "sweeper never removed the expired session");

        cancel.cancel();
        handle.await.unwrap();
    }
}
