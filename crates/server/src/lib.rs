//! Server side of chunkferry: upload sessions, chunk ingestion, assembly and
//! the TCP request server.
//!
//! The pieces compose bottom-up:
//! - [`SessionStore`] and [`ChunkStore`] hold the durable state.
//! - [`SessionManager`] owns the session lifecycle.
//! - [`Ingestor`] accepts chunks and finalizes sessions, handing finished
//!   files to a [`Dispatcher`].
//! - [`UploadService`] routes wire requests; [`UploadServer`] speaks TCP.

pub mod chunks;
pub mod dispatch;
mod error;
pub mod ingest;
pub mod manager;
pub mod server;
pub mod service;
pub mod session;
pub mod store;

pub use chunks::{ChunkStore, FsChunkStore};
pub use dispatch::{Dispatcher, LoggingPostProcessor, PostProcessJob, PostProcessor};
pub use error::ServerError;
pub use ingest::Ingestor;
pub use manager::{SessionLimits, SessionManager};
pub use server::{ServerConfig, UploadServer};
pub use service::UploadService;
pub use session::UploadSession;
pub use store::{CasOutcome, FileSessionStore, MemorySessionStore, SessionStore, Versioned};
