//! Sends one chunk with timeout, retry and backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use chunkferry_protocol::messages::{UploadChunkRequest, UploadChunkResponse};
use chunkferry_transfer::ChunkRange;

use crate::connection::{ChunkProgress, UploadConnection};
use crate::error::ChunkFailure;
use crate::retry::RetryPolicy;
use crate::types::TransportEvent;

/// One chunk ready to send.
#[derive(Debug, Clone)]
pub struct ChunkJob {
    pub session_id: String,
    pub range: ChunkRange,
    pub data: Vec<u8>,
    pub checksum: String,
    /// Deadline for each attempt.
    pub timeout: Duration,
}

/// A chunk the server acknowledged.
#[derive(Debug, Clone)]
pub struct ChunkSuccess {
    pub index: u32,
    pub bytes: u64,
    /// Duration of the attempt that succeeded.
    pub elapsed: Duration,
    pub attempts: u32,
    pub response: UploadChunkResponse,
}

/// Retrying chunk sender shared by all in-flight chunks of an upload.
#[derive(Clone)]
pub struct ChunkTransport {
    conn: Arc<dyn UploadConnection>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl ChunkTransport {
    pub fn new(
        conn: Arc<dyn UploadConnection>,
        retry: RetryPolicy,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            conn,
            retry,
            cancel,
            events,
        }
    }

    /// Uploads `job`, retrying timeouts and transient errors.
    ///
    /// Rejections the server will repeat (bad checksum, closed session, ...)
    /// fail immediately. Cancellation wins over everything, including a
    /// pending backoff.
    pub async fn upload(&self, job: ChunkJob) -> Result<ChunkSuccess, ChunkFailure> {
        let index = job.range.index;
        let progress = ChunkProgress::new(index, self.events.clone());
        let req = UploadChunkRequest {
            session_id: job.session_id.clone(),
            chunk_index: index,
            checksum: job.checksum.clone(),
        };

        let mut attempt: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(ChunkFailure::Aborted);
            }

            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ChunkFailure::Aborted),
                result = tokio::time::timeout(
                    job.timeout,
                    self.conn.upload_chunk(req.clone(), &job.data, &progress),
                ) => result,
            };

            let failure = match result {
                Ok(Ok(response)) => {
                    return Ok(ChunkSuccess {
                        index,
                        bytes: job.range.len,
                        elapsed: started.elapsed(),
                        attempts: attempt + 1,
                        response,
                    });
                }
                Ok(Err(e)) if !e.is_transient() => {
                    warn!(index, "chunk rejected: {e}");
                    return Err(ChunkFailure::from_connection(&e));
                }
                Ok(Err(e)) => ChunkFailure::from_connection(&e),
                Err(_) => ChunkFailure::Timeout,
            };

            if attempt >= self.retry.max_retries {
                warn!(index, attempts = attempt + 1, "chunk failed: {failure}");
                return Err(failure);
            }

            let delay = self.retry.delay_for_attempt(attempt);
            attempt += 1;
            debug!(index, attempt, ?delay, "retrying chunk after: {failure}");
            let _ = self.events.send(TransportEvent::Retry {
                index,
                attempt,
                max_retries: self.retry.max_retries,
                reason: failure.to_string(),
            });

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ChunkFailure::Aborted),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectionError;
    use crate::testing::{ScriptedConnection, Step};
    use chunkferry_transfer::chunk_checksum;

    fn job() -> ChunkJob {
        let data = b"chunk-bytes".to_vec();
        ChunkJob {
            session_id: "s-1".into(),
            range: ChunkRange {
                index: 4,
                offset: 0,
                len: data.len() as u64,
            },
            checksum: chunk_checksum(&data),
            data,
            timeout: Duration::from_secs(10),
        }
    }

    fn transport(
        conn: Arc<ScriptedConnection>,
    ) -> (
        ChunkTransport,
        mpsc::UnboundedReceiver<TransportEvent>,
        CancellationToken,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let t = ChunkTransport::new(conn, RetryPolicy::default(), cancel.clone(), tx);
        (t, rx, cancel)
    }

    fn retries(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<u32> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TransportEvent::Retry { attempt, .. } = event {
                out.push(attempt);
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_then_succeeds() {
        let conn = ScriptedConnection::new(vec![
            Step::Fail(500),
            Step::Network,
            Step::Accept,
        ]);
        let (t, mut rx, _) = transport(conn.clone());

        let ok = t.upload(job()).await.unwrap();
        assert_eq!(ok.index, 4);
        assert_eq!(ok.attempts, 3);
        assert_eq!(conn.calls(), 3);
        assert_eq!(retries(&mut rx), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_rejection_is_not_retried() {
        let conn = ScriptedConnection::new(vec![Step::Fail(400), Step::Accept]);
        let (t, mut rx, _) = transport(conn.clone());

        let err = t.upload(job()).await.unwrap_err();
        assert!(matches!(err, ChunkFailure::ServerRejected { code: 400, .. }));
        assert_eq!(conn.calls(), 1);
        assert!(retries(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let conn = ScriptedConnection::new(vec![Step::Network; 10]);
        let (t, mut rx, _) = transport(conn.clone());

        let err = t.upload(job()).await.unwrap_err();
        assert!(matches!(err, ChunkFailure::NetworkError(_)));
        assert_eq!(conn.calls(), 6);
        assert_eq!(retries(&mut rx), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_attempts_time_out() {
        let conn = ScriptedConnection::new(vec![Step::Hang, Step::Accept]);
        let (t, mut rx, _) = transport(conn.clone());

        let started = Instant::now();
        let ok = t.upload(job()).await.unwrap();
        assert_eq!(ok.attempts, 2);
        assert!(started.elapsed() >= Duration::from_secs(11));

        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        assert!(events.iter().any(|e| matches!(
            e,
            TransportEvent::Retry { reason, .. } if reason == "timed out"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_aborts() {
        let conn = ScriptedConnection::new(vec![Step::Network; 10]);
        let (t, _rx, cancel) = transport(conn.clone());

        let task = tokio::spawn(async move { t.upload(job()).await });
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();

        assert_eq!(task.await.unwrap().unwrap_err(), ChunkFailure::Aborted);
        assert_eq!(conn.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_start_sends_nothing() {
        let conn = ScriptedConnection::new(vec![Step::Accept]);
        let (t, _rx, cancel) = transport(conn.clone());
        cancel.cancel();

        assert_eq!(t.upload(job()).await.unwrap_err(), ChunkFailure::Aborted);
        assert_eq!(conn.calls(), 0);
    }

    #[test]
    fn timeout_channel_error_maps_to_timeout() {
        let err = ConnectionError::Channel(chunkferry_wire::ChannelError::Timeout);
        assert_eq!(ChunkFailure::from_connection(&err), ChunkFailure::Timeout);
    }
}
