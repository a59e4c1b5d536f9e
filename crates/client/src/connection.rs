//! The seam between the upload client and the server it talks to.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use chunkferry_protocol::messages::{
    CreateSessionRequest, CreateSessionResponse, FinalizeRequest, FinalizeResponse,
    SessionStatusResponse, UploadChunkRequest, UploadChunkResponse,
};
use chunkferry_protocol::{Message, MessageType};

use crate::error::ConnectionError;
use crate::types::TransportEvent;

/// A boxed future returned by [`UploadConnection`] methods.
pub type ConnFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ConnectionError>> + Send + 'a>>;

/// Session and chunk operations against an upload server.
pub trait UploadConnection: Send + Sync + 'static {
    fn create_session(&self, req: CreateSessionRequest) -> ConnFuture<'_, CreateSessionResponse>;

    fn get_session<'a>(&'a self, session_id: &'a str) -> ConnFuture<'a, SessionStatusResponse>;

    fn cancel_session<'a>(&'a self, session_id: &'a str) -> ConnFuture<'a, ()>;

    /// Sends one chunk body, reporting body bytes handed to the network.
    fn upload_chunk<'a>(
        &'a self,
        req: UploadChunkRequest,
        body: &'a [u8],
        progress: &'a ChunkProgress,
    ) -> ConnFuture<'a, UploadChunkResponse>;

    fn finalize(&self, req: FinalizeRequest) -> ConnFuture<'_, FinalizeResponse>;
}

/// Reports send progress of one chunk attempt.
#[derive(Debug, Clone)]
pub struct ChunkProgress {
    index: u32,
    tx: Option<mpsc::UnboundedSender<TransportEvent>>,
}

impl ChunkProgress {
    pub fn new(index: u32, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            index,
            tx: Some(tx),
        }
    }

    /// A sink that drops every report.
    pub fn ignored(index: u32) -> Self {
        Self { index, tx: None }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn report(&self, bytes_sent: u64) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(TransportEvent::Progress {
                index: self.index,
                bytes_sent,
            });
        }
    }
}

/// Unwraps a response envelope into its typed payload.
pub fn decode_reply<T: for<'de> serde::Deserialize<'de>>(
    reply: Message,
    expected: MessageType,
) -> Result<T, ConnectionError> {
    if let Some(err) = reply.error {
        return Err(ConnectionError::Server {
            code: err.code,
            message: err.message,
        });
    }
    if reply.msg_type != expected {
        return Err(ConnectionError::Protocol(format!(
            "expected {expected:?}, got {:?}",
            reply.msg_type
        )));
    }
    reply
        .parse_payload()?
        .ok_or_else(|| ConnectionError::Protocol(format!("{expected:?} without payload")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkferry_protocol::messages::CancelSessionResponse;

    #[test]
    fn decode_reply_surfaces_server_errors() {
        let reply = Message::error("r", 409, "session completed");
        let err = decode_reply::<CancelSessionResponse>(reply, MessageType::SessionCancelled)
            .unwrap_err();
        assert_eq!(err.server_code(), Some(409));
    }

    #[test]
    fn decode_reply_checks_type_and_payload() {
        let body = CancelSessionResponse {
            session_id: "s".into(),
        };
        let reply = Message::new("r", MessageType::SessionCancelled, Some(&body)).unwrap();
        let decoded: CancelSessionResponse =
            decode_reply(reply.clone(), MessageType::SessionCancelled).unwrap();
        assert_eq!(decoded, body);

        assert!(matches!(
            decode_reply::<CancelSessionResponse>(reply, MessageType::Finalized),
            Err(ConnectionError::Protocol(_))
        ));

        let empty = Message::new::<()>("r", MessageType::SessionCancelled, None).unwrap();
        assert!(matches!(
            decode_reply::<CancelSessionResponse>(empty, MessageType::SessionCancelled),
            Err(ConnectionError::Protocol(_))
        ));
    }

    #[test]
    fn progress_reports_reach_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let progress = ChunkProgress::new(3, tx);
        progress.report(10);
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::Progress {
                index: 3,
                bytes_sent: 10
            }
        );
        ChunkProgress::ignored(3).report(10);
    }
}
