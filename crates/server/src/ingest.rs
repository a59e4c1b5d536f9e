//! Chunk ingestion and final assembly.
//!
//! `uploaded_chunks` is only ever written here, through a read-union-swap
//! loop on the session store. Finalize is serialised per session by a keyed
//! lock and its `completed` transition is itself a compare-and-swap.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::Utc;
use tracing::{debug, info, warn};

use chunkferry_protocol::SessionStatus;
use chunkferry_protocol::constants::MAX_LISTED_MISSING;
use chunkferry_protocol::messages::{
    FinalizeRequest, FinalizeResponse, UploadChunkRequest, UploadChunkResponse,
};
use chunkferry_transfer::{ChunkPlan, chunk_checksum, sanitize_filename};

use crate::ServerError;
use crate::dispatch::{Dispatcher, PostProcessJob};
use crate::manager::SessionManager;
use crate::session::UploadSession;
use crate::store::CasOutcome;

/// Bound on compare-and-swap retries before reporting contention as a
/// storage failure.
const MAX_CAS_ATTEMPTS: usize = 64;

/// Per-key async mutexes, dropped once nobody holds them.
#[derive(Debug, Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| lock.strong_count() > 0);
        if let Some(lock) = locks.get(key).and_then(Weak::upgrade) {
            return lock;
        }
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(key.to_owned(), Arc::downgrade(&lock));
        lock
    }
}

/// Stores arriving chunks and assembles completed sessions.
pub struct Ingestor {
    manager: Arc<SessionManager>,
    dispatcher: Dispatcher,
    finalize_locks: KeyedLocks,
}

impl Ingestor {
    pub fn new(manager: Arc<SessionManager>, dispatcher: Dispatcher) -> Self {
        Self {
            manager,
            dispatcher,
            finalize_locks: KeyedLocks::default(),
        }
    }

    /// Validates, stores and records one chunk.
    pub async fn ingest(
        &self,
        req: &UploadChunkRequest,
        body: &[u8],
    ) -> Result<UploadChunkResponse, ServerError> {
        let session_id = req.session_id.as_str();
        let index = req.chunk_index;
        let snapshot = self.manager.load_live(session_id).await?.value;

        if !snapshot.status.accepts_chunks() {
            return Err(ServerError::SessionClosed {
                session_id: snapshot.id,
                status: snapshot.status,
            });
        }

        let plan = ChunkPlan::new(snapshot.file_size, snapshot.chunk_size)?;
        let expected_len = plan.chunk_len(index)?;
        if body.len() as u64 != expected_len {
            return Err(ServerError::ChunkSizeMismatch {
                index,
                expected: expected_len,
                actual: body.len() as u64,
            });
        }

        let actual = chunk_checksum(body);
        if !actual.eq_ignore_ascii_case(&req.checksum) {
            warn!(session = %session_id, index, "chunk checksum mismatch");
            return Err(ServerError::ChecksumMismatch {
                index,
                expected: req.checksum.clone(),
                actual,
            });
        }

        if snapshot.uploaded_chunks.contains(&index) {
            debug!(session = %session_id, index, "chunk already uploaded");
            return Ok(chunk_response(&snapshot, index, true));
        }

        let chunks = self.manager.chunks();
        chunks.put_chunk(session_id, index, body).await?;

        let merged = match self.merge_chunk(session_id, index).await {
            Ok(merged) => merged,
            Err(e @ ServerError::SessionNotFound(_)) => {
                // Deleted while the chunk was being written; the write may
                // have recreated the directory the delete removed.
                if let Err(rm) = chunks.remove_session(session_id).await {
                    warn!(session = %session_id, "failed to remove orphaned chunks: {rm}");
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        debug!(
            session = %session_id,
            index,
            uploaded = merged.uploaded_chunks.len(),
            total = merged.total_chunks,
            "chunk accepted"
        );
        Ok(chunk_response(&merged, index, false))
    }

    /// Atomically unions `index` into the freshest `uploaded_chunks`.
    async fn merge_chunk(&self, session_id: &str, index: u32) -> Result<UploadSession, ServerError> {
        let sessions = self.manager.sessions();
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(current) = sessions.load(session_id).await? else {
                return Err(ServerError::SessionNotFound(session_id.to_owned()));
            };
            if current.value.uploaded_chunks.contains(&index) {
                return Ok(current.value);
            }

            let mut next = current.value;
            next.uploaded_chunks.insert(index);
            if next.status == SessionStatus::Pending {
                next.status = SessionStatus::Uploading;
            }
            next.updated_at = Utc::now();

            match sessions.compare_and_swap(current.version, next.clone()).await? {
                CasOutcome::Swapped(_) => return Ok(next),
                CasOutcome::Conflict => {
                    debug!(session = %session_id, index, "merge conflict, retrying");
                }
                CasOutcome::Missing => {
                    return Err(ServerError::SessionNotFound(session_id.to_owned()));
                }
            }
        }
        Err(ServerError::Storage(format!(
            "gave up merging chunk {index} of session {session_id} after {MAX_CAS_ATTEMPTS} attempts"
        )))
    }

    /// Assembles, verifies and completes a fully uploaded session.
    ///
    /// Completed sessions return their stored result with
    /// `already_completed` set.
    pub async fn finalize(&self, req: &FinalizeRequest) -> Result<FinalizeResponse, ServerError> {
        let session_id = req.session_id.as_str();
        let lock = self.finalize_locks.lock_for(session_id);
        let _guard = lock.lock().await;

        let record = self.manager.load_live(session_id).await?;
        let session = &record.value;

        if let Some(done) = session.finalize_result(true) {
            debug!(session = %session_id, "finalize repeated");
            return Ok(done);
        }
        if !session.status.accepts_chunks() {
            return Err(ServerError::SessionClosed {
                session_id: session.id.clone(),
                status: session.status,
            });
        }

        let missing: Vec<u32> = session.missing_chunks().collect();
        if !missing.is_empty() {
            let count = missing.len();
            let listed = missing.into_iter().take(MAX_LISTED_MISSING).collect();
            return Err(ServerError::MissingChunks { listed, count });
        }

        let stored_name = format!(
            "{}-{}",
            uuid::Uuid::new_v4(),
            sanitize_filename(&session.filename)
        );
        let chunks = self.manager.chunks();
        let staged = chunks
            .assemble(session_id, session.total_chunks, &stored_name)
            .await?;

        if staged.size != session.file_size {
            let actual = staged.size;
            chunks.discard(staged).await?;
            return Err(ServerError::SizeMismatch {
                expected: session.file_size,
                actual,
            });
        }
        if let Some(expected) = &req.expected_file_checksum
            && !expected.eq_ignore_ascii_case(&staged.checksum)
        {
            let actual = staged.checksum.clone();
            chunks.discard(staged).await?;
            warn!(session = %session_id, "file checksum mismatch, chunks kept");
            return Err(ServerError::FileChecksumMismatch {
                expected: expected.clone(),
                actual,
            });
        }

        let checksum = staged.checksum.clone();
        let final_path = chunks.commit(staged).await?;
        let completed = self
            .mark_completed(record, final_path.clone(), checksum)
            .await;
        let completed = match completed {
            Ok(completed) => completed,
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&final_path).await {
                    warn!(path = %final_path, "failed to remove orphaned file: {rm}");
                }
                return Err(e);
            }
        };

        if let Err(e) = chunks.remove_session(session_id).await {
            warn!(session = %session_id, "failed to clean up chunks: {e}");
        }

        info!(
            session = %session_id,
            path = %final_path,
            size = completed.file_size,
            "upload finalized"
        );

        if let Some(correlation_id) = completed.correlation_id.clone() {
            self.dispatcher.notify(PostProcessJob {
                session_id: completed.id.clone(),
                final_path: final_path.clone(),
                mime_type: completed.mime_type.clone(),
                original_filename: completed.filename.clone(),
                correlation_id,
            });
        }

        completed
            .finalize_result(false)
            .ok_or_else(|| ServerError::Storage("completed session lost its result".into()))
    }

    /// Swaps the session to `completed`. Retries only while nothing but the
    /// version changed underneath.
    async fn mark_completed(
        &self,
        mut record: crate::store::Versioned<UploadSession>,
        final_path: String,
        checksum: String,
    ) -> Result<UploadSession, ServerError> {
        let sessions = self.manager.sessions();
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut next = record.value.clone();
            next.status = SessionStatus::Completed;
            next.final_path = Some(final_path.clone());
            next.checksum = Some(checksum.clone());
            next.correlation_id = Some(uuid::Uuid::new_v4().to_string());
            next.updated_at = Utc::now();

            match sessions.compare_and_swap(record.version, next.clone()).await? {
                CasOutcome::Swapped(_) => return Ok(next),
                CasOutcome::Missing => {
                    return Err(ServerError::SessionNotFound(record.value.id));
                }
                CasOutcome::Conflict => {
                    let Some(fresh) = sessions.load(&record.value.id).await? else {
                        return Err(ServerError::SessionNotFound(record.value.id));
                    };
                    if !fresh.value.status.accepts_chunks() {
                        return Err(ServerError::SessionClosed {
                            session_id: fresh.value.id,
                            status: fresh.value.status,
                        });
                    }
                    record = fresh;
                }
            }
        }
        Err(ServerError::Storage(format!(
            "gave up completing session {} after {MAX_CAS_ATTEMPTS} attempts",
            record.value.id
        )))
    }
}

fn chunk_response(session: &UploadSession, index: u32, already_uploaded: bool) -> UploadChunkResponse {
    UploadChunkResponse {
        chunk_index: index,
        uploaded_chunks: session.uploaded_list(),
        progress_percent: session.progress_percent(),
        is_complete: session.has_all_chunks(),
        already_uploaded,
    }
}
