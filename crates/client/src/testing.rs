//! Connections used by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use chunkferry_protocol::messages::{
    CancelSessionRequest, CancelSessionResponse, CreateSessionRequest, CreateSessionResponse,
    FinalizeRequest, FinalizeResponse, GetSessionRequest, SessionStatusResponse,
    UploadChunkRequest, UploadChunkResponse,
};
use chunkferry_protocol::{Message, MessageType};
use chunkferry_server::{
    Dispatcher, FsChunkStore, Ingestor, LoggingPostProcessor, MemorySessionStore, SessionLimits,
    SessionManager, UploadService,
};
use chunkferry_wire::Frame;

use crate::connection::{ChunkProgress, ConnFuture, UploadConnection, decode_reply};
use crate::error::ConnectionError;

/// Scripted outcome of one `upload_chunk` call.
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Accept,
    Fail(i32),
    Network,
    Hang,
}

/// Plays back a fixed sequence of chunk outcomes; accepts once exhausted.
pub(crate) struct ScriptedConnection {
    script: Mutex<VecDeque<Step>>,
    calls: AtomicU32,
}

impl ScriptedConnection {
    pub(crate) fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into()),
            calls: AtomicU32::new(0),
        })
    }

    pub(crate) fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl UploadConnection for ScriptedConnection {
    fn create_session(&self, _req: CreateSessionRequest) -> ConnFuture<'_, CreateSessionResponse> {
        Box::pin(async { Err(ConnectionError::Protocol("scripted".into())) })
    }

    fn get_session<'a>(&'a self, _id: &'a str) -> ConnFuture<'a, SessionStatusResponse> {
        Box::pin(async { Err(ConnectionError::Protocol("scripted".into())) })
    }

    fn cancel_session<'a>(&'a self, _id: &'a str) -> ConnFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn upload_chunk<'a>(
        &'a self,
        req: UploadChunkRequest,
        body: &'a [u8],
        progress: &'a ChunkProgress,
    ) -> ConnFuture<'a, UploadChunkResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Accept);
        Box::pin(async move {
            match step {
                Step::Accept => {
                    progress.report(body.len() as u64);
                    Ok(UploadChunkResponse {
                        chunk_index: req.chunk_index,
                        uploaded_chunks: vec![req.chunk_index],
                        progress_percent: 0.0,
                        is_complete: false,
                        already_uploaded: false,
                    })
                }
                Step::Fail(code) => Err(ConnectionError::Server {
                    code,
                    message: format!("scripted {code}"),
                }),
                Step::Network => Err(ConnectionError::Io(std::io::Error::from(
                    std::io::ErrorKind::ConnectionReset,
                ))),
                Step::Hang => std::future::pending().await,
            }
        })
    }

    fn finalize(&self, _req: FinalizeRequest) -> ConnFuture<'_, FinalizeResponse> {
        Box::pin(async { Err(ConnectionError::Protocol("scripted".into())) })
    }
}

/// Builds a server stack over `dir` with small chunks allowed.
pub(crate) async fn local_service(dir: &std::path::Path) -> UploadService {
    let limits = SessionLimits {
        min_chunk_size: 1,
        ..SessionLimits::default()
    };
    let chunks = FsChunkStore::open(dir).await.unwrap();
    let manager = Arc::new(SessionManager::new(
        Arc::new(MemorySessionStore::new()),
        Arc::new(chunks),
        limits,
    ));
    let dispatcher = Dispatcher::new(
        Arc::new(LoggingPostProcessor),
        Arc::clone(manager.sessions()),
    );
    let ingestor = Arc::new(Ingestor::new(Arc::clone(&manager), dispatcher));
    UploadService::new(manager, ingestor, Duration::from_secs(30))
}

/// Calls an [`UploadService`] directly, with optional fault injection.
pub(crate) struct LocalConnection {
    service: Arc<UploadService>,
    /// Chunks at or above this index are rejected with 400.
    reject_from: Option<u32>,
    /// Remaining 500s to return per chunk index.
    flaky: Mutex<HashMap<u32, u32>>,
    delay: Duration,
    sent: Mutex<Vec<u32>>,
}

impl LocalConnection {
    pub(crate) fn new(service: Arc<UploadService>) -> Self {
        Self {
            service,
            reject_from: None,
            flaky: Mutex::new(HashMap::new()),
            delay: Duration::ZERO,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn rejecting_from(mut self, index: u32) -> Self {
        self.reject_from = Some(index);
        self
    }

    pub(crate) fn flaky(self, index: u32, failures: u32) -> Self {
        self.flaky.lock().unwrap().insert(index, failures);
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Indices that reached the service, in arrival order.
    pub(crate) fn sent(&self) -> Vec<u32> {
        self.sent.lock().unwrap().clone()
    }

    async fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        msg_type: MessageType,
        req: &Req,
        body: &[u8],
    ) -> Result<Resp, ConnectionError> {
        let message = Message::new("local", msg_type, Some(req))?;
        let reply = self
            .service
            .handle(Frame {
                message,
                body: body.to_vec(),
            })
            .await;
        decode_reply(reply, msg_type.response_type().unwrap())
    }
}

impl UploadConnection for LocalConnection {
    fn create_session(&self, req: CreateSessionRequest) -> ConnFuture<'_, CreateSessionResponse> {
        Box::pin(async move { self.call(MessageType::CreateSession, &req, &[]).await })
    }

    fn get_session<'a>(&'a self, session_id: &'a str) -> ConnFuture<'a, SessionStatusResponse> {
        Box::pin(async move {
            let req = GetSessionRequest {
                session_id: session_id.to_owned(),
            };
            self.call(MessageType::GetSession, &req, &[]).await
        })
    }

    fn cancel_session<'a>(&'a self, session_id: &'a str) -> ConnFuture<'a, ()> {
        Box::pin(async move {
            let req = CancelSessionRequest {
                session_id: session_id.to_owned(),
            };
            let _: CancelSessionResponse =
                self.call(MessageType::CancelSession, &req, &[]).await?;
            Ok(())
        })
    }

    fn upload_chunk<'a>(
        &'a self,
        req: UploadChunkRequest,
        body: &'a [u8],
        progress: &'a ChunkProgress,
    ) -> ConnFuture<'a, UploadChunkResponse> {
        Box::pin(async move {
            let index = req.chunk_index;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.reject_from.is_some_and(|from| index >= from) {
                return Err(ConnectionError::Server {
                    code: 400,
                    message: "injected rejection".into(),
                });
            }
            let flaky = {
                let mut flaky = self.flaky.lock().unwrap();
                match flaky.get_mut(&index) {
                    Some(left) if *left > 0 => {
                        *left -= 1;
                        true
                    }
                    _ => false,
                }
            };
            if flaky {
                return Err(ConnectionError::Server {
                    code: 500,
                    message: "injected failure".into(),
                });
            }

            self.sent.lock().unwrap().push(index);
            progress.report(body.len() as u64);
            self.call(MessageType::UploadChunk, &req, body).await
        })
    }

    fn finalize(&self, req: FinalizeRequest) -> ConnFuture<'_, FinalizeResponse> {
        Box::pin(async move { self.call(MessageType::Finalize, &req, &[]).await })
    }
}
