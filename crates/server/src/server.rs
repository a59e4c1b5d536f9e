//! TCP upload server.
//!
//! Accepts connections, checks the capability token, then reads one request
//! frame and writes one response frame per connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use chunkferry_wire::frame::{read_frame, read_token, write_auth_response, write_frame};
use chunkferry_wire::{TCP_AUTH_TIMEOUT, TCP_BUFFER_SIZE, validate_token};

use crate::ServerError;
use crate::manager::run_sweeper;
use crate::service::UploadService;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Capability token every connection must present.
    pub auth_token: String,
    /// Time allowed for reading a request frame.
    pub read_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([127, 0, 0, 1], 0).into(),
            auth_token: String::new(),
            read_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

/// The upload server.
pub struct UploadServer {
    config: ServerConfig,
    service: Arc<UploadService>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl UploadServer {
    pub fn new(config: ServerConfig, service: UploadService) -> Arc<Self> {
        Arc::new(Self {
            config,
            service: Arc::new(service),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) or [`serve`](Self::serve)
    /// starts.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Gracefully shuts down the server and its sweeper.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.serve(listener).await
    }

    /// Serves on an already bound listener until shutdown.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        info!("upload server listening on {local_addr}");

        let sweeper = tokio::spawn(run_sweeper(
            Arc::clone(self.service.manager()),
            self.config.sweep_interval,
            self.cancel.child_token(),
        ));

        let result = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("server shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    debug!(%peer_addr, "connection ended: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        };

        let _ = sweeper.await;
        result
    }

    /// Authenticates the peer and answers a single request.
    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::with_capacity(TCP_BUFFER_SIZE, reader);
        let mut writer = BufWriter::new(writer);

        let token = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(()),
            result = tokio::time::timeout(TCP_AUTH_TIMEOUT, read_token(&mut reader)) => {
                result.map_err(|_| ServerError::Timeout)??
            }
        };

        if !validate_token(&token, &self.config.auth_token) {
            warn!(%peer_addr, "invalid capability token");
            write_auth_response(&mut writer, false).await?;
            return Err(ServerError::Unauthorized);
        }
        write_auth_response(&mut writer, true).await?;

        let max_body = self.service.max_body_len();
        let frame = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(()),
            result = tokio::time::timeout(self.config.read_timeout, read_frame(&mut reader, max_body)) => {
                result.map_err(|_| ServerError::Timeout)??
            }
        };
        debug!(%peer_addr, id = %frame.message.id, msg_type = ?frame.message.msg_type, body = frame.body.len(), "request");

        let reply = self.service.handle(frame).await;
        write_frame(&mut writer, &reply, &[]).await?;
        Ok(())
    }
}
