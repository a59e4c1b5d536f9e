//! Events, configuration and results of an upload.

use std::time::Duration;

use chunkferry_protocol::messages::FinalizeResponse;

use crate::aimd::AimdConfig;
use crate::retry::RetryPolicy;
use crate::timeout::TimeoutConfig;

/// Configuration for an [`Uploader`](crate::Uploader).
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// Requested chunk size; `0` lets the server pick.
    pub chunk_size: u64,
    pub aimd: AimdConfig,
    pub retry: RetryPolicy,
    pub timeout: TimeoutConfig,
    /// How often [`UploadEvent::Progress`] is emitted.
    pub progress_interval: Duration,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: 0,
            aimd: AimdConfig::default(),
            retry: RetryPolicy::default(),
            timeout: TimeoutConfig::default(),
            progress_interval: Duration::from_millis(250),
        }
    }
}

/// Signals from running chunk transports back to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Body bytes of the current attempt handed to the network so far.
    Progress { index: u32, bytes_sent: u64 },
    /// The previous attempt failed and another one is scheduled.
    Retry {
        index: u32,
        attempt: u32,
        max_retries: u32,
        reason: String,
    },
}

/// Events emitted during an upload.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    SessionReady {
        session_id: String,
        resumed: bool,
        total_chunks: u32,
        chunk_size: u64,
        already_uploaded: usize,
    },
    Progress {
        uploaded_bytes: u64,
        total_bytes: u64,
        speed_bps: f64,
        eta: Option<Duration>,
        concurrency: usize,
    },
    ChunkCompleted {
        index: u32,
        uploaded_chunks: usize,
        total_chunks: u32,
    },
    ChunkRetry {
        index: u32,
        attempt: u32,
        max_retries: u32,
        reason: String,
    },
    ChunkFailed {
        index: u32,
        reason: String,
    },
    Finalized {
        final_path: String,
        checksum: String,
    },
}

/// Result of a finished upload.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub session_id: String,
    /// Whether an earlier session was continued.
    pub resumed: bool,
    /// Chunks sent by this run; resumed chunks are not counted.
    pub chunks_sent: u32,
    pub retries: u64,
    pub result: FinalizeResponse,
}
