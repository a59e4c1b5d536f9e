//! Wires stores, ingestion and the TCP server together.

use std::sync::Arc;

use chunkferry_server::{
    Dispatcher, FileSessionStore, FsChunkStore, Ingestor, LoggingPostProcessor, SessionManager,
    UploadServer, UploadService,
};

use crate::config::Config;

/// Runs the server until Ctrl-C.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let sessions = Arc::new(FileSessionStore::open(config.data_dir.join("sessions")).await?);
    let chunks = Arc::new(FsChunkStore::open(config.data_dir.join("storage")).await?);

    let manager = Arc::new(SessionManager::new(sessions, chunks, config.limits()));
    let dispatcher = Dispatcher::new(
        Arc::new(LoggingPostProcessor),
        Arc::clone(manager.sessions()),
    );
    let ingestor = Arc::new(Ingestor::new(Arc::clone(&manager), dispatcher));
    let service = UploadService::new(manager, ingestor, config.request_timeout());

    let server = UploadServer::new(config.server_config(), service);
    let server_run = Arc::clone(&server);
    let mut handle = tokio::spawn(async move { server_run.run().await });

    tokio::select! {
        result = &mut handle => {
            result??;
            return Ok(());
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("SIGINT received, shutting down");
            server.shutdown();
        }
    }

    handle.await??;
    Ok(())
}
