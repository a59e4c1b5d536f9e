//! chunkferry upload server entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Resumable chunked upload server
#[derive(Parser, Debug)]
#[command(name = "chunkferryd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "CHUNKFERRY_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen address from the configuration
    #[arg(long)]
    listen: Option<std::net::SocketAddr>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting chunkferry server"
    );

    let path = args.config.unwrap_or_else(config::config_path);
    let mut config = config::Config::load(&path)?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    tracing::info!(
        path = %path.display(),
        data_dir = %config.data_dir.display(),
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("server shut down cleanly");
    Ok(())
}
