//! Routes decoded request frames to the session manager and ingestor.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use chunkferry_protocol::messages::{
    CancelSessionRequest, CancelSessionResponse, CreateSessionRequest, CreateSessionResponse,
    FinalizeRequest, GetSessionRequest, UploadChunkRequest,
};
use chunkferry_protocol::{Message, MessageType};
use chunkferry_wire::Frame;

use crate::ServerError;
use crate::ingest::Ingestor;
use crate::manager::SessionManager;

/// Request handler shared by every connection.
pub struct UploadService {
    manager: Arc<SessionManager>,
    ingestor: Arc<Ingestor>,
    request_timeout: Duration,
}

impl UploadService {
    pub fn new(
        manager: Arc<SessionManager>,
        ingestor: Arc<Ingestor>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            manager,
            ingestor,
            request_timeout,
        }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn ingestor(&self) -> &Arc<Ingestor> {
        &self.ingestor
    }

    /// Largest body a request may carry.
    pub fn max_body_len(&self) -> u64 {
        self.manager.limits().max_chunk_size
    }

    /// Handles one request and always produces a reply envelope.
    pub async fn handle(&self, frame: Frame) -> Message {
        let request = frame.message.clone();
        let result =
            match tokio::time::timeout(self.request_timeout, self.dispatch(frame)).await {
                Ok(result) => result,
                Err(_) => Err(ServerError::Timeout),
            };

        match result {
            Ok(reply) => reply,
            Err(e) => {
                let code = e.code();
                if code >= 500 {
                    warn!(id = %request.id, msg_type = ?request.msg_type, code, "request failed: {e}");
                } else {
                    debug!(id = %request.id, msg_type = ?request.msg_type, code, "request rejected: {e}");
                }
                request.reply_error(code, e.to_string())
            }
        }
    }

    async fn dispatch(&self, frame: Frame) -> Result<Message, ServerError> {
        let msg = &frame.message;
        let Some(response_type) = msg.msg_type.response_type() else {
            return Err(ServerError::InvalidRequest(format!(
                "{:?} is not a request",
                msg.msg_type
            )));
        };

        match msg.msg_type {
            MessageType::CreateSession => {
                let req: CreateSessionRequest = payload(msg)?;
                let session = self.manager.create(req).await?;
                reply(
                    msg,
                    response_type,
                    &CreateSessionResponse {
                        session_id: session.id,
                        chunk_size: session.chunk_size,
                        total_chunks: session.total_chunks,
                        expires_at: session.expires_at.to_rfc3339(),
                    },
                )
            }
            MessageType::GetSession => {
                let req: GetSessionRequest = payload(msg)?;
                let session = self.manager.get(&req.session_id).await?;
                reply(msg, response_type, &session.to_status_response())
            }
            MessageType::CancelSession => {
                let req: CancelSessionRequest = payload(msg)?;
                self.manager.delete(&req.session_id).await?;
                reply(
                    msg,
                    response_type,
                    &CancelSessionResponse {
                        session_id: req.session_id,
                    },
                )
            }
            MessageType::UploadChunk => {
                let req: UploadChunkRequest = payload(msg)?;
                let resp = self.ingestor.ingest(&req, &frame.body).await?;
                reply(msg, response_type, &resp)
            }
            MessageType::Finalize => {
                let req: FinalizeRequest = payload(msg)?;
                // Runs detached so a request timeout cannot stop assembly
                // between publishing the file and recording it.
                let ingestor = Arc::clone(&self.ingestor);
                let resp = tokio::spawn(async move { ingestor.finalize(&req).await }).await??;
                reply(msg, response_type, &resp)
            }
            other => Err(ServerError::InvalidRequest(format!(
                "unsupported message type {other:?}"
            ))),
        }
    }
}

fn payload<T: DeserializeOwned>(msg: &Message) -> Result<T, ServerError> {
    msg.parse_payload()?
        .ok_or_else(|| ServerError::InvalidRequest("missing payload".into()))
}

fn reply<T: Serialize>(
    msg: &Message,
    msg_type: MessageType,
    body: &T,
) -> Result<Message, ServerError> {
    Ok(msg.reply(msg_type, Some(body))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Dispatcher, LoggingPostProcessor};
    use crate::manager::SessionLimits;
    use crate::manager::tests::{create_req, manager_in};
    use chunkferry_protocol::SessionStatus;
    use chunkferry_protocol::messages::{
        FinalizeResponse, SessionStatusResponse, UploadChunkResponse,
    };
    use chunkferry_transfer::chunk_checksum;

    async fn service(dir: &std::path::Path) -> UploadService {
        let limits = SessionLimits {
            min_chunk_size: 1,
            ..SessionLimits::default()
        };
        let manager = Arc::new(manager_in(dir, limits).await);
        let dispatcher = Dispatcher::new(
            Arc::new(LoggingPostProcessor),
            Arc::clone(manager.sessions()),
        );
        let ingestor = Arc::new(Ingestor::new(Arc::clone(&manager), dispatcher));
        UploadService::new(manager, ingestor, Duration::from_secs(5))
    }

    fn frame<T: Serialize>(msg_type: MessageType, payload: &T, body: &[u8]) -> Frame {
        Frame {
            message: Message::new("req-1", msg_type, Some(payload)).unwrap(),
            body: body.to_vec(),
        }
    }

    #[tokio::test]
    async fn full_lifecycle_through_envelopes() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path()).await;

        let created = svc
            .handle(frame(MessageType::CreateSession, &create_req(6, 3), &[]))
            .await;
        assert_eq!(created.msg_type, MessageType::SessionCreated);
        assert_eq!(created.id, "req-1");
        let created: CreateSessionResponse = created.parse_payload().unwrap().unwrap();
        assert_eq!(created.total_chunks, 2);
        let sid = created.session_id;

        for (index, body) in [(1u32, b"DEF"), (0, b"ABC")] {
            let req = UploadChunkRequest {
                session_id: sid.clone(),
                chunk_index: index,
                checksum: chunk_checksum(body),
            };
            let reply = svc.handle(frame(MessageType::UploadChunk, &req, body)).await;
            assert_eq!(reply.msg_type, MessageType::ChunkAccepted);
            let _: UploadChunkResponse = reply.parse_payload().unwrap().unwrap();
        }

        let status = svc
            .handle(frame(
                MessageType::GetSession,
                &GetSessionRequest {
                    session_id: sid.clone(),
                },
                &[],
            ))
            .await;
        let status: SessionStatusResponse = status.parse_payload().unwrap().unwrap();
        assert_eq!(status.uploaded_chunks, vec![0, 1]);
        assert_eq!(status.status, SessionStatus::Uploading);

        let done = svc
            .handle(frame(
                MessageType::Finalize,
                &FinalizeRequest {
                    session_id: sid.clone(),
                    expected_file_checksum: None,
                },
                &[],
            ))
            .await;
        assert_eq!(done.msg_type, MessageType::Finalized);
        let done: FinalizeResponse = done.parse_payload().unwrap().unwrap();
        assert_eq!(std::fs::read(done.final_path).unwrap(), b"ABCDEF");

        let cancelled = svc
            .handle(frame(
                MessageType::CancelSession,
                &CancelSessionRequest { session_id: sid },
                &[],
            ))
            .await;
        assert_eq!(cancelled.msg_type, MessageType::SessionCancelled);
    }

    #[tokio::test]
    async fn abandoned_finalize_still_completes() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path()).await;
        let session = svc.manager().create(create_req(6, 3)).await.unwrap();
        for (index, body) in [(0u32, b"ABC"), (1, b"DEF")] {
            let req = UploadChunkRequest {
                session_id: session.id.clone(),
                chunk_index: index,
                checksum: chunk_checksum(body),
            };
            svc.ingestor().ingest(&req, body).await.unwrap();
        }

        let finalize = frame(
            MessageType::Finalize,
            &FinalizeRequest {
                session_id: session.id.clone(),
                expected_file_checksum: None,
            },
            &[],
        );
        // Poll the request once, then drop it as a timed-out caller would.
        tokio::select! {
            biased;
            _ = svc.handle(finalize) => panic!("finalize finished before it could run"),
            _ = std::future::ready(()) => {}
        }

        let mut status = SessionStatus::Pending;
        for _ in 0..200 {
            status = svc.manager().get(&session.id).await.unwrap().status;
            if status == SessionStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, SessionStatus::Completed);

        let names: Vec<String> = std::fs::read_dir(dir.path().join("files"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(!names[0].ends_with(".partial"));
    }

    #[tokio::test]
    async fn errors_become_error_envelopes() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path()).await;

        let reply = svc
            .handle(frame(
                MessageType::GetSession,
                &GetSessionRequest {
                    session_id: "missing".into(),
                },
                &[],
            ))
            .await;
        assert!(reply.is_error());
        assert_eq!(reply.id, "req-1");
        assert_eq!(reply.error.unwrap().code, 404);

        let bad = svc
            .handle(Frame::bare(
                Message::new::<()>("req-2", MessageType::CreateSession, None).unwrap(),
            ))
            .await;
        assert_eq!(bad.error.unwrap().code, 400);

        let not_request = svc
            .handle(Frame::bare(
                Message::new::<()>("req-3", MessageType::Finalized, None).unwrap(),
            ))
            .await;
        assert_eq!(not_request.error.unwrap().code, 400);
    }
}
