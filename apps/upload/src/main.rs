//! chunkferry upload client.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chunkferry_client::{
    AimdConfig, ResumeHints, TcpConnection, UploadError, UploadEvent, UploadRequest, Uploader,
    UploaderConfig,
};
use chunkferry_transfer::{ChunkSource, sanitize_filename};

/// Upload a file in resumable chunks
#[derive(Parser, Debug)]
#[command(name = "chunkferry")]
#[command(version, about, long_about = None)]
struct Args {
    /// File to upload
    file: PathBuf,

    /// Server address (host:port)
    #[arg(short, long, env = "CHUNKFERRY_SERVER")]
    server: String,

    /// Capability token printed in the server configuration
    #[arg(short, long, env = "CHUNKFERRY_TOKEN", hide_env_values = true)]
    token: String,

    /// MIME type recorded with the upload
    #[arg(long, default_value = "application/octet-stream")]
    mime: String,

    /// Name to upload as (defaults to the file name)
    #[arg(long)]
    name: Option<String>,

    /// Requested chunk size in bytes (0 = server default)
    #[arg(long, default_value_t = 0)]
    chunk_size: u64,

    /// Upper bound on chunks in flight
    #[arg(long, default_value_t = 6)]
    max_concurrency: usize,

    /// Where resume hints are kept
    #[arg(long, env = "CHUNKFERRY_HINTS")]
    hints: Option<PathBuf>,

    /// Abandon the cached session for this file instead of uploading
    #[arg(long)]
    cancel: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let filename = match &args.name {
        Some(name) => name.clone(),
        None => args
            .file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .map(|n| sanitize_filename(&n))
            .context("file path has no file name")?,
    };

    let hints_path = args.hints.clone().unwrap_or_else(default_hints_path);
    let hints = Arc::new(ResumeHints::open(&hints_path).await?);
    let conn = Arc::new(TcpConnection::new(args.server.clone(), args.token.clone()));
    let config = UploaderConfig {
        chunk_size: args.chunk_size,
        aimd: AimdConfig::with_max(args.max_concurrency),
        ..UploaderConfig::default()
    };
    info!(server = %args.server, hints = %hints_path.display(), max_concurrency = args.max_concurrency, "starting");
    let mut uploader = Uploader::new(conn, hints, config);

    let source = ChunkSource::File(args.file.clone());
    let file_size = source
        .len()
        .await
        .with_context(|| format!("cannot read {}", args.file.display()))?;

    if args.cancel {
        if uploader.discard_cached(&filename, file_size).await? {
            println!("cancelled cached session for {filename}");
        } else {
            println!("no cached session for {filename}");
        }
        return Ok(());
    }

    let mut events = uploader
        .take_events()
        .context("event receiver already taken")?;
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    let pause = uploader.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\npausing; run the same command again to resume");
            pause.cancel();
        }
    });

    let result = uploader
        .upload(UploadRequest {
            source,
            filename,
            mime_type: args.mime.clone(),
        })
        .await;
    drop(uploader);
    let _ = printer.await;

    match result {
        Ok(outcome) => {
            println!(
                "uploaded {} bytes to {} (sha256 {}){}",
                outcome.result.file_size,
                outcome.result.final_path,
                outcome.result.checksum,
                if outcome.resumed { ", resumed" } else { "" }
            );
            Ok(())
        }
        Err(UploadError::Cancelled) => {
            println!("upload paused");
            Ok(())
        }
        Err(e @ UploadError::ChunksFailed { .. }) => {
            warn!(failed = ?e.failed_indices(), "chunks failed");
            Err(anyhow::Error::new(e).context("upload incomplete; rerun to retry the failed chunks"))
        }
        Err(e) => Err(e.into()),
    }
}

fn print_event(event: &UploadEvent) {
    match event {
        UploadEvent::SessionReady {
            session_id,
            resumed,
            total_chunks,
            already_uploaded,
            ..
        } => {
            if *resumed {
                eprintln!("resuming {session_id}: {already_uploaded}/{total_chunks} chunks on server");
            } else {
                eprintln!("session {session_id}: {total_chunks} chunks");
            }
        }
        UploadEvent::Progress {
            uploaded_bytes,
            total_bytes,
            speed_bps,
            eta,
            concurrency,
        } => {
            let pct = if *total_bytes == 0 {
                100.0
            } else {
                *uploaded_bytes as f64 / *total_bytes as f64 * 100.0
            };
            eprint!(
                "\r{pct:5.1}%  {:>10}/s  eta {:>8}  x{concurrency}   ",
                human_bytes(*speed_bps),
                eta.map(human_duration).unwrap_or_else(|| "--".into()),
            );
        }
        UploadEvent::ChunkRetry {
            index,
            attempt,
            max_retries,
            reason,
        } => {
            eprintln!("\rchunk {index}: retry {attempt}/{max_retries} ({reason})");
        }
        UploadEvent::ChunkFailed { index, reason } => {
            eprintln!("\rchunk {index} failed: {reason}");
        }
        UploadEvent::Finalized { .. } => eprintln!(),
        UploadEvent::ChunkCompleted { .. } => {}
    }
}

fn human_bytes(bytes: f64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

fn human_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}

fn default_hints_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home)
        .join(".config")
        .join("chunkferry")
        .join("resume.json")
}
