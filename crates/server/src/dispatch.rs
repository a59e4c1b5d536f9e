//! Hand-off of assembled files to post-processing.
//!
//! Finalize only ever calls [`Dispatcher::notify`], which spawns the job and
//! returns. Whatever the processor reports back is recorded on the session
//! later; its failure never reaches the finalize caller.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::{CasOutcome, SessionStore};

/// Attempts at recording derived assets before giving up.
const MAX_RECORD_ATTEMPTS: usize = 16;

/// Everything a post-processor learns about a finished upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostProcessJob {
    pub session_id: String,
    pub final_path: String,
    pub mime_type: String,
    pub original_filename: String,
    pub correlation_id: String,
}

/// A boxed future returned by [`PostProcessor::process`].
pub type ProcessFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<String>, String>> + Send + 'a>>;

/// External post-processing (thumbnails, transcoding, ...).
///
/// Returns the URLs of any derived assets it produced.
pub trait PostProcessor: Send + Sync + 'static {
    fn process(&self, job: PostProcessJob) -> ProcessFuture<'_>;
}

/// Processor that only logs the hand-off and produces nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingPostProcessor;

impl PostProcessor for LoggingPostProcessor {
    fn process(&self, job: PostProcessJob) -> ProcessFuture<'_> {
        Box::pin(async move {
            info!(
                session = %job.session_id,
                correlation = %job.correlation_id,
                path = %job.final_path,
                mime_type = %job.mime_type,
                filename = %job.original_filename,
                "file ready for post-processing"
            );
            Ok(Vec::new())
        })
    }
}

/// Fire-and-forget bridge between finalize and a [`PostProcessor`].
#[derive(Clone)]
pub struct Dispatcher {
    processor: Arc<dyn PostProcessor>,
    sessions: Arc<dyn SessionStore>,
}

impl Dispatcher {
    pub fn new(processor: Arc<dyn PostProcessor>, sessions: Arc<dyn SessionStore>) -> Self {
        Self {
            processor,
            sessions,
        }
    }

    /// Spawns the job and returns immediately.
    pub fn notify(&self, job: PostProcessJob) -> JoinHandle<()> {
        let processor = Arc::clone(&self.processor);
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            let session_id = job.session_id.clone();
            match processor.process(job).await {
                Ok(assets) if assets.is_empty() => {
                    debug!(session = %session_id, "post-processing produced no assets");
                }
                Ok(assets) => record_assets(sessions.as_ref(), &session_id, assets).await,
                Err(e) => warn!(session = %session_id, "post-processing failed: {e}"),
            }
        })
    }
}

async fn record_assets(sessions: &dyn SessionStore, session_id: &str, assets: Vec<String>) {
    for _ in 0..MAX_RECORD_ATTEMPTS {
        let current = match sessions.load(session_id).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                debug!(session = %session_id, "session gone before assets were recorded");
                return;
            }
            Err(e) => {
                warn!(session = %session_id, "failed to load session for assets: {e}");
                return;
            }
        };

        let mut next = current.value;
        next.derived_assets.extend(assets.iter().cloned());
        next.updated_at = chrono::Utc::now();

        match sessions.compare_and_swap(current.version, next).await {
            Ok(CasOutcome::Swapped(_)) => {
                info!(session = %session_id, count = assets.len(), "derived assets recorded");
                return;
            }
            Ok(CasOutcome::Conflict) => continue,
            Ok(CasOutcome::Missing) => return,
            Err(e) => {
                warn!(session = %session_id, "failed to record derived assets: {e}");
                return;
            }
        }
    }
    warn!(session = %session_id, "gave up recording derived assets after contention");
}
