//! Client error types.

use chunkferry_protocol::constants::{ERR_INTERNAL, ERR_TIMEOUT};
use chunkferry_transfer::TransferError;
use chunkferry_wire::ChannelError;

use crate::aimd::FailureKind;

/// Errors from a single request on an [`UploadConnection`](crate::UploadConnection).
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("server error {code}: {message}")]
    Server { code: i32, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ConnectionError {
    /// Returns `true` if repeating the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(_) => true,
            Self::Channel(e) => matches!(e, ChannelError::Io(_) | ChannelError::Timeout),
            Self::Server { code, .. } => matches!(*code, ERR_INTERNAL | ERR_TIMEOUT),
            Self::Json(_) | Self::Protocol(_) => false,
        }
    }

    /// Wire error code, if the server answered with one.
    pub fn server_code(&self) -> Option<i32> {
        match self {
            Self::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Terminal outcome of one chunk that did not get stored.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkFailure {
    #[error("timed out")]
    Timeout,

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("server rejected chunk ({code}): {reason}")]
    ServerRejected { code: i32, reason: String },

    #[error("aborted")]
    Aborted,
}

impl ChunkFailure {
    /// How the concurrency controller should read this failure.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Timeout => FailureKind::Timeout,
            Self::Aborted => FailureKind::Abort,
            Self::NetworkError(_) | Self::ServerRejected { .. } => FailureKind::Error,
        }
    }

    pub(crate) fn from_connection(err: &ConnectionError) -> Self {
        match err {
            ConnectionError::Server { code, message } => Self::ServerRejected {
                code: *code,
                reason: message.clone(),
            },
            ConnectionError::Channel(ChannelError::Timeout) => Self::Timeout,
            other => Self::NetworkError(other.to_string()),
        }
    }
}

/// Errors produced by an upload.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{} chunk(s) failed in session {session_id}: {:?}", .failures.len(), indices(.failures))]
    ChunksFailed {
        session_id: String,
        failures: Vec<(u32, ChunkFailure)>,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("upload task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl UploadError {
    /// Indices of failed chunks, ascending; empty for other errors.
    pub fn failed_indices(&self) -> Vec<u32> {
        match self {
            Self::ChunksFailed { failures, .. } => indices(failures),
            _ => Vec::new(),
        }
    }
}

fn indices(failures: &[(u32, ChunkFailure)]) -> Vec<u32> {
    let mut out: Vec<u32> = failures.iter().map(|(i, _)| *i).collect();
    out.sort_unstable();
    out
}
