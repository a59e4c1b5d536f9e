//! Chunk partitioning, checksums and progress aggregation shared by the
//! upload client and server.

mod chunked;
mod progress;
mod validation;

pub use chunked::{
    ChunkIter, ChunkPlan, ChunkRange, ChunkSource, StreamingChecksum,
    checksum_bytes, chunk_checksum, total_chunks,
};
pub use progress::{Ema, ProgressAggregator, ProgressSnapshot};
pub use validation::{sanitize_filename, validate_storage_key};

/// Default chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Number of hex characters kept from a chunk's SHA-256 digest.
pub const CHUNK_CHECKSUM_LEN: usize = 32;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("chunk size must be at least 1 byte")]
    InvalidChunkSize,

    #[error("file of {file_size} bytes needs more than u32::MAX chunks of {chunk_size} bytes")]
    TooManyChunks { file_size: u64, chunk_size: u64 },

    #[error("chunk index {index} out of range (total {total})")]
    IndexOutOfRange { index: u32, total: u32 },

    #[error("invalid path: {0}")]
    InvalidPath(String),
}
