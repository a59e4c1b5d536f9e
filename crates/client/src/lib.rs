//! Client side of chunkferry: adaptive, resumable chunked uploads.
//!
//! An [`Uploader`] binds a file to a server session (resuming one when
//! [`ResumeHints`] remember it), then streams the missing chunks through
//! [`ChunkTransport`]s. The number of chunks in flight is steered by an
//! [`AimdController`]; each attempt's deadline comes from a
//! [`TimeoutEstimator`].

pub mod aimd;
pub mod connection;
pub mod error;
pub mod orchestrator;
pub mod resume;
pub mod retry;
pub mod tcp;
pub mod timeout;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use aimd::{AimdConfig, AimdController, AimdStats, FailureKind};
pub use connection::{ChunkProgress, ConnFuture, UploadConnection};
pub use error::{ChunkFailure, ConnectionError, UploadError};
pub use orchestrator::{UploadRequest, Uploader};
pub use resume::ResumeHints;
pub use retry::RetryPolicy;
pub use tcp::TcpConnection;
pub use timeout::{TimeoutConfig, TimeoutEstimator};
pub use transport::{ChunkJob, ChunkSuccess, ChunkTransport};
pub use types::{TransportEvent, UploadEvent, UploadOutcome, UploaderConfig};
