//! Upload orchestration: resume-or-create, adaptive scheduling, finalize.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chunkferry_protocol::constants::ERR_NOT_FOUND;
use chunkferry_protocol::messages::{CreateSessionRequest, FinalizeRequest};
use chunkferry_transfer::{ChunkPlan, ChunkRange, ChunkSource, ProgressAggregator, chunk_checksum};

use crate::aimd::{AimdController, FailureKind};
use crate::connection::UploadConnection;
use crate::error::{ChunkFailure, UploadError};
use crate::resume::ResumeHints;
use crate::timeout::TimeoutEstimator;
use crate::transport::{ChunkJob, ChunkSuccess, ChunkTransport};
use crate::types::{TransportEvent, UploadEvent, UploadOutcome, UploaderConfig};

/// What to upload.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub source: ChunkSource,
    pub filename: String,
    pub mime_type: String,
}

/// Server session an upload is bound to.
#[derive(Debug, Clone)]
struct BoundSession {
    session_id: String,
    chunk_size: u64,
    total_chunks: u32,
    uploaded: Vec<u32>,
    resumed: bool,
}

#[derive(Debug, Clone)]
struct ActiveUpload {
    filename: String,
    file_size: u64,
    session_id: String,
}

/// Drives one file through a resumable upload.
///
/// An uploader is single-use once paused or cancelled: build a new one (with
/// the same [`ResumeHints`]) to continue.
pub struct Uploader {
    conn: Arc<dyn UploadConnection>,
    hints: Arc<ResumeHints>,
    config: UploaderConfig,
    cancel: CancellationToken,
    events_tx: mpsc::Sender<UploadEvent>,
    events_rx: Option<mpsc::Receiver<UploadEvent>>,
    active: Mutex<Option<ActiveUpload>>,
}

impl Uploader {
    pub fn new(
        conn: Arc<dyn UploadConnection>,
        hints: Arc<ResumeHints>,
        config: UploaderConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            conn,
            hints,
            config,
            cancel: CancellationToken::new(),
            events_tx,
            events_rx: Some(events_rx),
            active: Mutex::new(None),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<UploadEvent>> {
        self.events_rx.take()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops sending. The server session and the hint are kept, so a later
    /// upload of the same file resumes.
    pub fn pause(&self) {
        self.cancel.cancel();
    }

    /// Stops sending and abandons the server session.
    pub async fn cancel(&self) -> Result<(), UploadError> {
        self.cancel.cancel();
        let active = self.active.lock().await.take();
        if let Some(active) = active {
            self.delete_session(&active.filename, active.file_size, &active.session_id)
                .await?;
        }
        Ok(())
    }

    /// Abandons the cached session for a file, if there is one.
    pub async fn discard_cached(&self, filename: &str, file_size: u64) -> Result<bool, UploadError> {
        let Some(session_id) = self.hints.get(filename, file_size).await else {
            return Ok(false);
        };
        self.delete_session(filename, file_size, &session_id).await?;
        Ok(true)
    }

    async fn delete_session(
        &self,
        filename: &str,
        file_size: u64,
        session_id: &str,
    ) -> Result<(), UploadError> {
        match self.conn.cancel_session(session_id).await {
            Ok(()) => info!(session = %session_id, "session cancelled"),
            Err(e) if e.server_code() == Some(ERR_NOT_FOUND) => {
                debug!(session = %session_id, "session already gone");
            }
            Err(e) => return Err(e.into()),
        }
        self.hints.remove(filename, file_size).await?;
        Ok(())
    }

    /// Uploads `request`, resuming a cached session when the server still
    /// has it.
    pub async fn upload(&self, request: UploadRequest) -> Result<UploadOutcome, UploadError> {
        let UploadRequest {
            source,
            filename,
            mime_type,
        } = request;
        if self.cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        let file_size = source.len().await?;

        let session = self.bind_session(&filename, file_size, &mime_type).await?;
        *self.active.lock().await = Some(ActiveUpload {
            filename: filename.clone(),
            file_size,
            session_id: session.session_id.clone(),
        });

        let plan = ChunkPlan::new(file_size, session.chunk_size)?;
        if plan.total_chunks() != session.total_chunks {
            return Err(UploadError::Protocol(format!(
                "server expects {} chunks, local plan has {}",
                session.total_chunks,
                plan.total_chunks()
            )));
        }

        let already_bytes: u64 = session
            .uploaded
            .iter()
            .filter_map(|&i| plan.chunk(i))
            .map(|c| c.len)
            .sum();
        self.emit(UploadEvent::SessionReady {
            session_id: session.session_id.clone(),
            resumed: session.resumed,
            total_chunks: session.total_chunks,
            chunk_size: session.chunk_size,
            already_uploaded: session.uploaded.len(),
        });

        let pending: VecDeque<ChunkRange> = plan.pending(&session.uploaded).collect();
        info!(
            session = %session.session_id,
            file = %filename,
            size = file_size,
            pending = pending.len(),
            total = plan.total_chunks(),
            "uploading"
        );

        let run = self
            .send_chunks(&source, &session.session_id, &plan, pending, already_bytes)
            .await?;

        let checksum = source.checksum().await?;
        let result = self
            .conn
            .finalize(FinalizeRequest {
                session_id: session.session_id.clone(),
                expected_file_checksum: Some(checksum),
            })
            .await?;

        self.hints.remove(&filename, file_size).await?;
        *self.active.lock().await = None;
        info!(session = %session.session_id, path = %result.final_path, "upload finalized");
        self.emit(UploadEvent::Finalized {
            final_path: result.final_path.clone(),
            checksum: result.checksum.clone(),
        });

        Ok(UploadOutcome {
            session_id: session.session_id,
            resumed: session.resumed,
            chunks_sent: run.chunks_sent,
            retries: run.retries,
            result,
        })
    }

    /// Resumes the cached session if usable, otherwise creates a new one.
    async fn bind_session(
        &self,
        filename: &str,
        file_size: u64,
        mime_type: &str,
    ) -> Result<BoundSession, UploadError> {
        if let Some(session_id) = self.hints.get(filename, file_size).await {
            match self.conn.get_session(&session_id).await {
                Ok(status) if status.status.accepts_chunks() && status.file_size == file_size => {
                    info!(
                        session = %session_id,
                        uploaded = status.uploaded_chunks.len(),
                        total = status.total_chunks,
                        "resuming session"
                    );
                    return Ok(BoundSession {
                        session_id,
                        chunk_size: status.chunk_size,
                        total_chunks: status.total_chunks,
                        uploaded: status.uploaded_chunks,
                        resumed: true,
                    });
                }
                Ok(status) => {
                    debug!(session = %session_id, status = %status.status, "cached session not resumable");
                }
                Err(e) if e.server_code() == Some(ERR_NOT_FOUND) => {
                    debug!(session = %session_id, "cached session expired or deleted");
                }
                Err(e) => return Err(e.into()),
            }
            self.hints.remove(filename, file_size).await?;
        }

        let created = self
            .conn
            .create_session(CreateSessionRequest {
                filename: filename.to_owned(),
                file_size,
                mime_type: mime_type.to_owned(),
                chunk_size: self.config.chunk_size,
            })
            .await?;
        self.hints
            .set(filename, file_size, &created.session_id)
            .await?;
        info!(
            session = %created.session_id,
            chunk_size = created.chunk_size,
            total = created.total_chunks,
            "session created"
        );

        Ok(BoundSession {
            session_id: created.session_id,
            chunk_size: created.chunk_size,
            total_chunks: created.total_chunks,
            uploaded: Vec::new(),
            resumed: false,
        })
    }

    /// Sends every pending chunk, keeping at most the controller's current
    /// concurrency in flight.
    async fn send_chunks(
        &self,
        source: &ChunkSource,
        session_id: &str,
        plan: &ChunkPlan,
        mut queue: VecDeque<ChunkRange>,
        already_bytes: u64,
    ) -> Result<RunState, UploadError> {
        let (transport_tx, mut transport_rx) = mpsc::unbounded_channel();
        let transport = ChunkTransport::new(
            Arc::clone(&self.conn),
            self.config.retry.clone(),
            self.cancel.clone(),
            transport_tx,
        );

        let mut state = RunState {
            aimd: AimdController::new(self.config.aimd.clone()),
            timeouts: TimeoutEstimator::new(self.config.timeout.clone()),
            progress: ProgressAggregator::new(plan.file_size(), already_bytes),
            completed: HashSet::new(),
            failures: Vec::new(),
            chunks_sent: 0,
            retries: 0,
        };
        let mut in_flight = JoinSet::new();
        let mut ticker = tokio::time::interval(self.config.progress_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            while !self.cancel.is_cancelled() && in_flight.len() < state.aimd.current_concurrency()
            {
                let Some(range) = queue.pop_front() else {
                    break;
                };
                let data = source.read(&range).await?;
                let job = ChunkJob {
                    session_id: session_id.to_owned(),
                    range,
                    checksum: chunk_checksum(&data),
                    data,
                    timeout: state.timeouts.timeout_for(range.len),
                };
                let transport = transport.clone();
                in_flight.spawn(async move { (range, transport.upload(job).await) });
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                Some(joined) = in_flight.join_next() => {
                    // Progress sent before the task ended must land first.
                    while let Ok(event) = transport_rx.try_recv() {
                        self.on_transport_event(&mut state, event);
                    }
                    let (range, result) = joined?;
                    self.on_chunk_done(&mut state, plan, range, result);
                }
                Some(event) = transport_rx.recv() => {
                    self.on_transport_event(&mut state, event);
                }
                _ = ticker.tick() => self.emit_progress(&mut state),
            }
        }

        if self.cancel.is_cancelled() {
            info!(session = %session_id, remaining = queue.len(), "upload stopped");
            return Err(UploadError::Cancelled);
        }
        self.emit_progress(&mut state);

        if !state.failures.is_empty() {
            warn!(session = %session_id, failed = state.failures.len(), "upload incomplete");
            return Err(UploadError::ChunksFailed {
                session_id: session_id.to_owned(),
                failures: std::mem::take(&mut state.failures),
            });
        }
        Ok(state)
    }

    fn on_transport_event(&self, state: &mut RunState, event: TransportEvent) {
        match event {
            TransportEvent::Progress { index, bytes_sent } => {
                if !state.completed.contains(&index) {
                    state.progress.chunk_progress(index, bytes_sent);
                }
            }
            TransportEvent::Retry {
                index,
                attempt,
                max_retries,
                reason,
            } => {
                state.aimd.on_retry();
                state.retries += 1;
                state.progress.chunk_reset(index);
                self.emit(UploadEvent::ChunkRetry {
                    index,
                    attempt,
                    max_retries,
                    reason,
                });
            }
        }
    }

    fn on_chunk_done(
        &self,
        state: &mut RunState,
        plan: &ChunkPlan,
        range: ChunkRange,
        result: Result<ChunkSuccess, ChunkFailure>,
    ) {
        match result {
            Ok(done) => {
                state.aimd.on_success(done.elapsed, done.bytes);
                state.timeouts.record(done.bytes, done.elapsed);
                state.progress.chunk_completed(done.index, done.bytes);
                state.completed.insert(done.index);
                state.chunks_sent += 1;
                self.emit(UploadEvent::ChunkCompleted {
                    index: done.index,
                    uploaded_chunks: done.response.uploaded_chunks.len(),
                    total_chunks: plan.total_chunks(),
                });
            }
            Err(ChunkFailure::Aborted) => {
                state.aimd.on_failure(FailureKind::Abort);
                state.progress.chunk_reset(range.index);
            }
            Err(failure) => {
                state.aimd.on_failure(failure.kind());
                state.progress.chunk_reset(range.index);
                self.emit(UploadEvent::ChunkFailed {
                    index: range.index,
                    reason: failure.to_string(),
                });
                state.failures.push((range.index, failure));
            }
        }
    }

    fn emit_progress(&self, state: &mut RunState) {
        let snapshot = state.progress.snapshot();
        self.emit(UploadEvent::Progress {
            uploaded_bytes: snapshot.uploaded_bytes,
            total_bytes: snapshot.total_bytes,
            speed_bps: snapshot.speed_bps,
            eta: snapshot.eta,
            concurrency: state.aimd.current_concurrency(),
        });
    }

    fn emit(&self, event: UploadEvent) {
        // Lagging consumers lose events; the upload never waits on them.
        let _ = self.events_tx.try_send(event);
    }
}

/// Per-upload scheduler state.
struct RunState {
    aimd: AimdController,
    timeouts: TimeoutEstimator,
    progress: ProgressAggregator,
    completed: HashSet<u32>,
    failures: Vec<(u32, ChunkFailure)>,
    chunks_sent: u32,
    retries: u64,
}
