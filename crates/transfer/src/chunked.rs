use std::io::SeekFrom;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::{CHUNK_CHECKSUM_LEN, TransferError};

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes the per-chunk checksum: the first 32 hex chars of SHA-256.
pub fn chunk_checksum(data: &[u8]) -> String {
    let mut full = checksum_bytes(data);
    full.truncate(CHUNK_CHECKSUM_LEN);
    full
}

/// Incremental SHA-256 over data fed piece by piece.
#[derive(Debug, Clone, Default)]
pub struct StreamingChecksum {
    hasher: Sha256,
}

impl StreamingChecksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Hex-encoded digest of everything fed so far.
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

// ---------------------------------------------------------------------------
// Partitioning
// ---------------------------------------------------------------------------

/// Returns `ceil(file_size / chunk_size)`.
pub fn total_chunks(file_size: u64, chunk_size: u64) -> Result<u32, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::InvalidChunkSize);
    }
    let count = file_size.div_ceil(chunk_size);
    u32::try_from(count).map_err(|_| TransferError::TooManyChunks {
        file_size,
        chunk_size,
    })
}

/// One byte range of a file, identified by its index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub index: u32,
    pub offset: u64,
    pub len: u64,
}

impl ChunkRange {
    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    pub fn as_range(&self) -> Range<u64> {
        self.offset..self.end()
    }
}

/// Deterministic partition of `[0, file_size)` into fixed-size chunks.
///
/// The same `(file_size, chunk_size)` always yields the same ranges, which is
/// what makes resuming by index valid. The last chunk may be shorter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    file_size: u64,
    chunk_size: u64,
    total_chunks: u32,
}

impl ChunkPlan {
    pub fn new(file_size: u64, chunk_size: u64) -> Result<Self, TransferError> {
        let total_chunks = total_chunks(file_size, chunk_size)?;
        Ok(Self {
            file_size,
            chunk_size,
            total_chunks,
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// Returns the range for `index`, or `None` past the last chunk.
    pub fn chunk(&self, index: u32) -> Option<ChunkRange> {
        if index >= self.total_chunks {
            return None;
        }
        let offset = index as u64 * self.chunk_size;
        let len = self.chunk_size.min(self.file_size - offset);
        Some(ChunkRange { index, offset, len })
    }

    /// Length of chunk `index`, or an error if it is out of range.
    pub fn chunk_len(&self, index: u32) -> Result<u64, TransferError> {
        self.chunk(index)
            .map(|c| c.len)
            .ok_or(TransferError::IndexOutOfRange {
                index,
                total: self.total_chunks,
            })
    }

    /// Lazy iterator over every chunk. Call again to restart.
    pub fn chunks(&self) -> ChunkIter {
        ChunkIter {
            plan: *self,
            next: 0,
        }
    }

    /// Chunks whose index is not reported as uploaded.
    pub fn pending(&self, uploaded: &[u32]) -> impl Iterator<Item = ChunkRange> + use<> {
        let mut done = uploaded.to_vec();
        done.sort_unstable();
        self.chunks()
            .filter(move |c| done.binary_search(&c.index).is_err())
    }
}

/// Iterator returned by [`ChunkPlan::chunks`].
#[derive(Debug, Clone)]
pub struct ChunkIter {
    plan: ChunkPlan,
    next: u32,
}

impl Iterator for ChunkIter {
    type Item = ChunkRange;

    fn next(&mut self) -> Option<ChunkRange> {
        let chunk = self.plan.chunk(self.next)?;
        self.next += 1;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.plan.total_chunks - self.next) as usize;
        (left, Some(left))
    }
}

impl ExactSizeIterator for ChunkIter {}

// ---------------------------------------------------------------------------
// ChunkSource
// ---------------------------------------------------------------------------

/// Where chunk bytes are read from on the uploading side.
#[derive(Debug, Clone)]
pub enum ChunkSource {
    /// A file on local disk, opened per read.
    File(PathBuf),
    /// An in-memory buffer.
    Memory(Arc<[u8]>),
}

impl ChunkSource {
    /// Total size of the source in bytes.
    pub async fn len(&self) -> Result<u64, TransferError> {
        match self {
            Self::File(path) => Ok(tokio::fs::metadata(path).await?.len()),
            Self::Memory(data) => Ok(data.len() as u64),
        }
    }

    /// Reads exactly the bytes covered by `range`.
    pub async fn read(&self, range: &ChunkRange) -> Result<Vec<u8>, TransferError> {
        match self {
            Self::File(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(SeekFrom::Start(range.offset)).await?;
                let mut buf = vec![0u8; range.len as usize];
                file.read_exact(&mut buf).await?;
                Ok(buf)
            }
            Self::Memory(data) => {
                let start = range.offset as usize;
                let end = range.end() as usize;
                data.get(start..end).map(<[u8]>::to_vec).ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("range {start}..{end} beyond {} bytes", data.len()),
                    )
                    .into()
                })
            }
        }
    }

    /// SHA-256 of the whole source, read in `DEFAULT_CHUNK_SIZE` slices.
    pub async fn checksum(&self) -> Result<String, TransferError> {
        let plan = ChunkPlan::new(self.len().await?, crate::DEFAULT_CHUNK_SIZE)?;
        let mut hasher = StreamingChecksum::new();
        for range in plan.chunks() {
            hasher.update(&self.read(&range).await?);
        }
        Ok(hasher.finish())
    }
}
