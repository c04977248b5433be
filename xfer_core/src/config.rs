use crate::error::{Result, TransferError};
use crate::transfer::constants::{
    CHUNK_SIZE, IO_TIMEOUT_SECS, MAX_CHUNK_SIZE, MAX_CONNECTIONS, TRANSFER_ADDRESS, TRANSFER_PORT,
};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "xfer";
const APP_NAME: &str = "xfer";
const SERVER_CONFIG_FILE: &str = "server.json";
const CLIENT_CONFIG_FILE: &str = "client.json";

/// Overrides the config directory (used by tests and packaging)
pub const CONFIG_DIR_ENV: &str = "XFER_CONFIG_DIR";

/// Settings for the transfer server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: IpAddr,
    pub port: u16,
    pub chunk_size: usize,
    /// Root of the flat storage directory
    pub storage_dir: PathBuf,
    /// Sessions served at once; further connections wait to be accepted
    pub max_connections: usize,
    /// Deadline for each network read/write inside an exchange
    pub io_timeout_secs: Option<u64>,
    /// Deadline for a client to send its next command
    pub idle_timeout_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: TRANSFER_PORT,
            chunk_size: CHUNK_SIZE,
            storage_dir: PathBuf::from("storage"),
            max_connections: MAX_CONNECTIONS,
            io_timeout_secs: Some(IO_TIMEOUT_SECS),
            idle_timeout_secs: None,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout_secs.map(Duration::from_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<()> {
        validate_chunk_size(self.chunk_size)?;
        if self.max_connections == 0 {
            return Err(TransferError::Config(
                "max_connections must be at least 1".to_string(),
            ));
        }
        validate_timeout("io_timeout_secs", self.io_timeout_secs)?;
        validate_timeout("idle_timeout_secs", self.idle_timeout_secs)
    }

    /// Load from an explicit file, or the default location, or defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Self = load_json(path, SERVER_CONFIG_FILE)?;
        config.validate()?;
        Ok(config)
    }
}

/// Settings for the transfer client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub address: IpAddr,
    pub port: u16,
    pub chunk_size: usize,
    /// Where downloaded files are written
    pub download_dir: PathBuf,
    pub io_timeout_secs: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: TRANSFER_PORT,
            chunk_size: CHUNK_SIZE,
            download_dir: PathBuf::from("."),
            io_timeout_secs: Some(IO_TIMEOUT_SECS),
        }
    }
}

impl ClientConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<()> {
        validate_chunk_size(self.chunk_size)?;
        validate_timeout("io_timeout_secs", self.io_timeout_secs)
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Self = load_json(path, CLIENT_CONFIG_FILE)?;
        config.validate()?;
        Ok(config)
    }
}

fn default_address() -> IpAddr {
    // Constant literal, always parses
    TRANSFER_ADDRESS
        .parse()
        .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST))
}

fn validate_chunk_size(chunk_size: usize) -> Result<()> {
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        return Err(TransferError::Config(format!(
            "chunk_size must be between 1 and {} (got {})",
            MAX_CHUNK_SIZE, chunk_size
        )));
    }
    Ok(())
}

fn validate_timeout(name: &str, secs: Option<u64>) -> Result<()> {
    if secs == Some(0) {
        return Err(TransferError::Config(format!(
            "{} must be positive; omit it to disable",
            name
        )));
    }
    Ok(())
}

/// Get the config directory path for this app
pub fn get_config_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        return Some(PathBuf::from(dir));
    }

    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
        .map(|dirs| dirs.config_dir().to_path_buf())
}

/// An explicit path must exist; the default location is optional
fn load_json<T>(path: Option<&Path>, default_file: &str) -> Result<T>
where
    T: Default + for<'de> Deserialize<'de>,
{
    let (path, required) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => match get_config_dir() {
            Some(dir) => (dir.join(default_file), false),
            None => return Ok(T::default()),
        },
    };

    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No config at {:?}, using defaults", path);
            return Ok(T::default());
        }
        Err(e) => {
            return Err(TransferError::Config(format!(
                "cannot read {}: {}",
                path.display(),
                e
            )));
        }
    };

    debug!("Loaded config from {:?}", path);
    serde_json::from_str(&content)
        .map_err(|e| TransferError::Config(format!("cannot parse {}: {}", path.display(), e)))
}
