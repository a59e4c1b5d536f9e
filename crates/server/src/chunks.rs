//! Durable storage for chunk bytes and assembled files.

use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use tracing::debug;

use chunkferry_transfer::{StreamingChecksum, validate_storage_key};

use crate::ServerError;
use crate::store::StoreFuture;

/// An assembled file written to a staging location, not yet published.
#[derive(Debug)]
pub struct StagedFile {
    staging_path: PathBuf,
    final_path: PathBuf,
    pub size: u64,
    /// Full SHA-256 hex digest of the assembled bytes.
    pub checksum: String,
}

/// Storage for chunk bytes keyed by `(session_id, index)`.
pub trait ChunkStore: Send + Sync + 'static {
    /// Durably stores one chunk. Re-writing an index replaces it atomically.
    fn put_chunk<'a>(&'a self, session_id: &'a str, index: u32, data: &'a [u8])
    -> StoreFuture<'a, ()>;

    fn has_chunk<'a>(&'a self, session_id: &'a str, index: u32) -> StoreFuture<'a, bool>;

    fn read_chunk<'a>(&'a self, session_id: &'a str, index: u32) -> StoreFuture<'a, Vec<u8>>;

    /// Removes every chunk of a session. Missing sessions are not an error.
    fn remove_session<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, ()>;

    /// Concatenates chunks `0..total_chunks` in index order into a staging
    /// file, hashing as it goes.
    fn assemble<'a>(
        &'a self,
        session_id: &'a str,
        total_chunks: u32,
        stored_name: &'a str,
    ) -> StoreFuture<'a, StagedFile>;

    /// Publishes a staged file and returns its final path.
    fn commit(&self, staged: StagedFile) -> StoreFuture<'_, String>;

    /// Drops a staged file that failed verification.
    fn discard(&self, staged: StagedFile) -> StoreFuture<'_, ()>;
}

/// Filesystem chunk store.
///
/// Layout under `root`:
/// - `chunks/<session_id>/<index>.part`
/// - `files/<stored_name>`
#[derive(Debug, Clone)]
pub struct FsChunkStore {
    root: PathBuf,
}

impl FsChunkStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, ServerError> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("chunks")).await?;
        tokio::fs::create_dir_all(root.join("files")).await?;
        Ok(Self { root })
    }

    fn session_dir(&self, session_id: &str) -> Result<PathBuf, ServerError> {
        validate_storage_key(session_id)?;
        Ok(self.root.join("chunks").join(session_id))
    }

    fn chunk_path(&self, session_id: &str, index: u32) -> Result<PathBuf, ServerError> {
        Ok(self.session_dir(session_id)?.join(format!("{index}.part")))
    }
}

impl ChunkStore for FsChunkStore {
    fn put_chunk<'a>(
        &'a self,
        session_id: &'a str,
        index: u32,
        data: &'a [u8],
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let dir = self.session_dir(session_id)?;
            tokio::fs::create_dir_all(&dir).await?;

            // Unique temp name so concurrent writers of one index never share a file.
            let tmp = dir.join(format!(".{index}.{}.tmp", uuid::Uuid::new_v4()));
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);

            tokio::fs::rename(&tmp, dir.join(format!("{index}.part"))).await?;
            debug!(session = %session_id, index, bytes = data.len(), "chunk stored");
            Ok(())
        })
    }

    fn has_chunk<'a>(&'a self, session_id: &'a str, index: u32) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let path = self.chunk_path(session_id, index)?;
            Ok(tokio::fs::try_exists(&path).await?)
        })
    }

    fn read_chunk<'a>(&'a self, session_id: &'a str, index: u32) -> StoreFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let path = self.chunk_path(session_id, index)?;
            match tokio::fs::read(&path).await {
                Ok(data) => Ok(data),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ServerError::Storage(
                    format!("chunk {index} of session {session_id} is missing from storage"),
                )),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn remove_session<'a>(&'a self, session_id: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let dir = self.session_dir(session_id)?;
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn assemble<'a>(
        &'a self,
        session_id: &'a str,
        total_chunks: u32,
        stored_name: &'a str,
    ) -> StoreFuture<'a, StagedFile> {
        Box::pin(async move {
            validate_storage_key(stored_name)?;
            let files = self.root.join("files");
            let staging_path = files.join(format!(".{stored_name}.partial"));
            let final_path = files.join(stored_name);

            let mut out = tokio::fs::File::create(&staging_path).await?;
            let mut digest = StreamingChecksum::new();
            let mut size = 0u64;

            for index in 0..total_chunks {
                let data = match self.read_chunk(session_id, index).await {
                    Ok(data) => data,
                    Err(e) => {
                        drop(out);
                        let _ = tokio::fs::remove_file(&staging_path).await;
                        return Err(e);
                    }
                };
                digest.update(&data);
                out.write_all(&data).await?;
                size += data.len() as u64;
            }
            out.sync_all().await?;

            Ok(StagedFile {
                staging_path,
                final_path,
                size,
                checksum: digest.finish(),
            })
        })
    }

    fn commit(&self, staged: StagedFile) -> StoreFuture<'_, String> {
        Box::pin(async move {
            tokio::fs::rename(&staged.staging_path, &staged.final_path).await?;
            Ok(staged.final_path.to_string_lossy().into_owned())
        })
    }

    fn discard(&self, staged: StagedFile) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            match tokio::fs::remove_file(&staged.staging_path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }
}
