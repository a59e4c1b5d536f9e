//! Server configuration management.
//!
//! Configuration is stored as TOML, by default at
//! `~/.config/chunkferry/server.toml`. A missing file is created with
//! defaults and a freshly generated capability token.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use chunkferry_server::{ServerConfig, SessionLimits};

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Root of session records, chunks and assembled files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Capability token clients must present. Generated when empty.
    #[serde(default)]
    pub auth_token: String,

    /// Largest accepted file, in bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,

    #[serde(default = "default_chunk_size")]
    pub default_chunk_size: u64,

    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: u64,

    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,

    /// Upper bound on handling one request.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// How often expired sessions are swept.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_listen_addr() -> SocketAddr {
    ([0, 0, 0, 0], 9800).into()
}

fn default_data_dir() -> PathBuf {
    config_dir().join("data")
}

fn default_max_file_size() -> u64 {
    SessionLimits::default().max_file_size
}

fn default_session_ttl_secs() -> u64 {
    SessionLimits::default().ttl.as_secs()
}

fn default_chunk_size() -> u64 {
    SessionLimits::default().default_chunk_size
}

fn default_min_chunk_size() -> u64 {
    SessionLimits::default().min_chunk_size
}

fn default_max_chunk_size() -> u64 {
    SessionLimits::default().max_chunk_size
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    ServerConfig::default().sweep_interval.as_secs()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            data_dir: default_data_dir(),
            auth_token: String::new(),
            max_file_size: default_max_file_size(),
            session_ttl_secs: default_session_ttl_secs(),
            default_chunk_size: default_chunk_size(),
            min_chunk_size: default_min_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
            request_timeout_secs: default_request_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Config {
    /// Loads configuration from `path`, or creates a default if not found.
    ///
    /// An empty token is replaced by a generated one and written back.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let existed = path.exists();
        let mut config = if existed {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };

        let mut dirty = !existed;
        if config.auth_token.is_empty() {
            config.auth_token = chunkferry_wire::generate_token();
            tracing::info!("generated new capability token");
            dirty = true;
        }
        if dirty {
            config.save(path)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Saves the configuration to `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // The file holds the capability token.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.min_chunk_size > 0 && self.min_chunk_size <= self.max_chunk_size,
            "min_chunk_size must be in 1..=max_chunk_size"
        );
        anyhow::ensure!(
            (self.min_chunk_size..=self.max_chunk_size).contains(&self.default_chunk_size),
            "default_chunk_size must lie between min_chunk_size and max_chunk_size"
        );
        anyhow::ensure!(self.max_file_size > 0, "max_file_size must be positive");
        anyhow::ensure!(
            chunkferry_wire::token::is_well_formed(&self.auth_token),
            "auth_token must be 32 hex characters"
        );
        Ok(())
    }

    pub fn limits(&self) -> SessionLimits {
        SessionLimits {
            max_file_size: self.max_file_size,
            ttl: Duration::from_secs(self.session_ttl_secs),
            default_chunk_size: self.default_chunk_size,
            min_chunk_size: self.min_chunk_size,
            max_chunk_size: self.max_chunk_size,
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            listen_addr: self.listen_addr,
            auth_token: self.auth_token.clone(),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            ..ServerConfig::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn config_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".config").join("chunkferry")
}

/// Default location of the configuration file.
pub fn config_path() -> PathBuf {
    config_dir().join("server.toml")
}
