//! [`UploadConnection`] over the framed TCP protocol.
//!
//! Every request opens a fresh connection, presents the capability token and
//! exchanges exactly one frame each way.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::trace;

use chunkferry_protocol::messages::{
    CancelSessionRequest, CancelSessionResponse, CreateSessionRequest, CreateSessionResponse,
    FinalizeRequest, FinalizeResponse, GetSessionRequest, SessionStatusResponse,
    UploadChunkRequest, UploadChunkResponse,
};
use chunkferry_protocol::{Message, MessageType};
use chunkferry_wire::frame::{read_auth_response, read_frame, write_frame_header, write_token};
use chunkferry_wire::{BODY_SLICE_SIZE, ChannelError, TCP_AUTH_TIMEOUT, TCP_CONNECT_TIMEOUT};

use crate::connection::{ChunkProgress, ConnFuture, UploadConnection, decode_reply};
use crate::error::ConnectionError;

/// Default time to wait for a reply once the request is sent.
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(300);

/// Client side of the TCP upload protocol.
#[derive(Debug, Clone)]
pub struct TcpConnection {
    addr: String,
    token: String,
    response_timeout: Duration,
}

impl TcpConnection {
    /// `addr` is anything `TcpStream::connect` accepts, e.g. `"host:9800"`.
    pub fn new(addr: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            token: token.into(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    async fn open(
        &self,
    ) -> Result<(BufReader<OwnedReadHalf>, BufWriter<OwnedWriteHalf>), ConnectionError> {
        let stream = tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(self.addr.as_str()))
            .await
            .map_err(|_| ChannelError::Timeout)??;
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);

        write_token(&mut writer, &self.token).await?;
        writer.flush().await?;
        let accepted = tokio::time::timeout(TCP_AUTH_TIMEOUT, read_auth_response(&mut reader))
            .await
            .map_err(|_| ChannelError::Timeout)??;
        if !accepted {
            return Err(ChannelError::AuthFailed("server rejected token".into()).into());
        }
        Ok((reader, writer))
    }

    async fn request<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        msg_type: MessageType,
        payload: &Req,
        body: &[u8],
        progress: Option<&ChunkProgress>,
    ) -> Result<Resp, ConnectionError> {
        let expected = msg_type
            .response_type()
            .ok_or_else(|| ConnectionError::Protocol(format!("{msg_type:?} is not a request")))?;
        let message = Message::new(uuid::Uuid::new_v4().to_string(), msg_type, Some(payload))?;

        let (mut reader, mut writer) = self.open().await?;
        write_frame_header(&mut writer, &message, body.len() as u64).await?;
        writer.flush().await?;

        let mut sent = 0u64;
        for slice in body.chunks(BODY_SLICE_SIZE) {
            writer.write_all(slice).await?;
            writer.flush().await?;
            sent += slice.len() as u64;
            if let Some(progress) = progress {
                progress.report(sent);
            }
        }
        trace!(id = %message.id, ?msg_type, body = body.len(), "request sent");

        let reply = tokio::time::timeout(self.response_timeout, read_frame(&mut reader, 0))
            .await
            .map_err(|_| ChannelError::Timeout)??;
        decode_reply(reply.message, expected)
    }
}

impl UploadConnection for TcpConnection {
    fn create_session(&self, req: CreateSessionRequest) -> ConnFuture<'_, CreateSessionResponse> {
        Box::pin(async move {
            self.request(MessageType::CreateSession, &req, &[], None)
                .await
        })
    }

    fn get_session<'a>(&'a self, session_id: &'a str) -> ConnFuture<'a, SessionStatusResponse> {
        Box::pin(async move {
            let req = GetSessionRequest {
                session_id: session_id.to_owned(),
            };
            self.request(MessageType::GetSession, &req, &[], None).await
        })
    }

    fn cancel_session<'a>(&'a self, session_id: &'a str) -> ConnFuture<'a, ()> {
        Box::pin(async move {
            let req = CancelSessionRequest {
                session_id: session_id.to_owned(),
            };
            let _: CancelSessionResponse = self
                .request(MessageType::CancelSession, &req, &[], None)
                .await?;
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
            self.request(MessageType::UploadChunk, &req, body, Some(progress))
                .await
        })
    }

    fn finalize(&self, req: FinalizeRequest) -> ConnFuture<'_, FinalizeResponse> {
        Box::pin(async move { self.request(MessageType::Finalize, &req, &[], None).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resume::ResumeHints;
    use crate::testing::local_service;
    use crate::{UploadRequest, Uploader, UploaderConfig};
    use chunkferry_server::{ServerConfig, UploadServer};
    use chunkferry_transfer::ChunkSource;
    use chunkferry_wire::generate_token;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn start(dir: &std::path::Path, token: &str) -> (Arc<UploadServer>, String) {
        let config = ServerConfig {
            auth_token: token.to_owned(),
            ..ServerConfig::default()
        };
        let server = UploadServer::new(config, local_service(dir).await);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let s = Arc::clone(&server);
        tokio::spawn(async move { s.serve(listener).await.unwrap() });
        (server, addr)
    }

    #[tokio::test]
    async fn uploads_file_over_tcp() {
        let dir = tempfile::tempdir().unwrap();
        let token = generate_token();
        let (server, addr) = start(dir.path(), &token).await;

        let data: Arc<[u8]> = (0..300 * 1024).map(|i| (i % 253) as u8).collect();
        let conn = Arc::new(TcpConnection::new(addr, token));
        let config = UploaderConfig {
            chunk_size: 64 * 1024,
            ..UploaderConfig::default()
        };
        let uploader = Uploader::new(conn, Arc::new(ResumeHints::in_memory()), config);
        let outcome = uploader
            .upload(UploadRequest {
                source: ChunkSource::Memory(Arc::clone(&data)),
                filename: "report.pdf".into(),
                mime_type: "application/pdf".into(),
            })
            .await
            .unwrap();

        assert_eq!(outcome.chunks_sent, 5);
        assert_eq!(outcome.result.file_size, data.len() as u64);
        assert_eq!(outcome.result.mime_type, "application/pdf");
        assert_eq!(std::fs::read(&outcome.result.final_path).unwrap(), &data[..]);
        server.shutdown();
    }

    #[tokio::test]
    async fn chunk_progress_is_reported_per_slice() {
        let dir = tempfile::tempdir().unwrap();
        let token = generate_token();
        let (server, addr) = start(dir.path(), &token).await;
        let conn = TcpConnection::new(addr, token);

        let created = conn
            .create_session(CreateSessionRequest {
                filename: "blob.bin".into(),
                file_size: 200 * 1024,
                mime_type: "application/octet-stream".into(),
                chunk_size: 200 * 1024,
            })
            .await
            .unwrap();
        assert_eq!(created.total_chunks, 1);

        let body = vec![9u8; 200 * 1024];
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let progress = ChunkProgress::new(0, tx);
        let req = UploadChunkRequest {
            session_id: created.session_id.clone(),
            chunk_index: 0,
            checksum: chunkferry_transfer::chunk_checksum(&body),
        };
        let resp = conn.upload_chunk(req, &body, &progress).await.unwrap();
        assert!(resp.is_complete);

        let mut reports = Vec::new();
        while let Ok(crate::types::TransportEvent::Progress { bytes_sent, .. }) = rx.try_recv() {
            reports.push(bytes_sent);
        }
        assert_eq!(reports, vec![65536, 131072, 196608, 204800]);

        let status = conn.get_session(&created.session_id).await.unwrap();
        assert_eq!(status.uploaded_chunks, vec![0]);
        conn.cancel_session(&created.session_id).await.unwrap();
        let gone = conn.get_session(&created.session_id).await.unwrap_err();
        assert_eq!(gone.server_code(), Some(404));
        server.shutdown();
    }

    #[tokio::test]
    async fn wrong_token_is_an_auth_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (server, addr) = start(dir.path(), &generate_token()).await;
        let conn = TcpConnection::new(addr, generate_token());

        let err = conn.get_session("anything").await.unwrap_err();
        assert!(matches!(
            err,
            ConnectionError::Channel(ChannelError::AuthFailed(_))
        ));
        assert!(!err.is_transient());
        server.shutdown();
    }
}
