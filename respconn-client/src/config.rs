//! Connection configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via RESPCONN_CONFIG or passed explicitly)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Maximum encoded bytes drained into a single write.
pub const DEFAULT_WRITE_BATCH_CAP: usize = 50_000;

/// Retries after the first failed write (3 attempts total).
pub const DEFAULT_WRITE_RETRY_LIMIT: u32 = 2;

/// Default connect timeout (2 s).
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2_000;

/// Default abort watchdog (3 s).
pub const DEFAULT_ABORT_TIMEOUT_MS: u64 = 3_000;

/// Default number of decoder workers.
pub const DEFAULT_DECODER_WORKERS: usize = 3;

/// Default read buffer size for socket reads (64 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (4 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    IoError(PathBuf, std::io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    ParseError(PathBuf, String),

    #[error("invalid configuration: {0}")]
    ValidationError(String),
}

/// Socket options applied before connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketOptions {
    pub keepalive: bool,
    pub nodelay: bool,
    pub reuse_address: bool,
    /// SO_SNDBUF in bytes.
    pub send_buffer_size: usize,
    /// SO_RCVBUF in bytes.
    pub recv_buffer_size: usize,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            keepalive: true,
            nodelay: true,
            reuse_address: true,
            send_buffer_size: 5_000_000,
            recv_buffer_size: 500_000,
        }
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Server address (`host:port`).
    pub addr: String,
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Abort watchdog in milliseconds.
    pub abort_timeout_ms: u64,
    /// Write acknowledgment timeout in milliseconds (disabled when unset).
    pub write_timeout_ms: Option<u64>,
    /// Maximum encoded bytes per write.
    pub write_batch_cap: usize,
    /// Retries after a failed write.
    pub write_retry_limit: u32,
    /// Number of concurrent reply decoders.
    pub decoder_workers: usize,
    /// Number of write buffers kept for reuse.
    pub buffer_pool_size: usize,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Socket options.
    pub socket: SocketOptions,
    /// Username for ACL authentication.
    pub username: Option<String>,
    /// Password sent with AUTH on connect.
    pub password: Option<String>,
    /// Database selected on connect.
    pub database: u32,
    /// Name registered with CLIENT SETNAME on connect.
    pub client_name: Option<String>,
    /// Whether the client reopens the connection after it stops.
    pub reconnect: bool,
    /// Delay before reconnecting, in milliseconds.
    pub reconnect_delay_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            addr: format!("127.0.0.1:{}", respconn_protocol::DEFAULT_PORT),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            abort_timeout_ms: DEFAULT_ABORT_TIMEOUT_MS,
            write_timeout_ms: None,
            write_batch_cap: DEFAULT_WRITE_BATCH_CAP,
            write_retry_limit: DEFAULT_WRITE_RETRY_LIMIT,
            decoder_workers: DEFAULT_DECODER_WORKERS,
            buffer_pool_size: 1,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            socket: SocketOptions::default(),
            username: None,
            password: None,
            database: 0,
            client_name: None,
            reconnect: true,
            reconnect_delay_ms: 1_000,
        }
    }
}

impl ConnectionConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Default::default()
        }
    }

    /// Loads configuration from `RESPCONN_CONFIG` (if set), then applies
    /// environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var_os("RESPCONN_CONFIG").map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Loads defaults, then `path` (if given), then environment variable
    /// overrides, and validates the result.
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: ConnectionConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("RESPCONN_ADDR") {
            if !addr.is_empty() {
                self.addr = addr;
            }
        }

        if let Ok(password) = std::env::var("RESPCONN_PASSWORD") {
            if !password.is_empty() {
                self.password = Some(password);
            }
        }

        if let Ok(db) = std::env::var("RESPCONN_DATABASE") {
            if let Ok(n) = db.parse() {
                self.database = n;
            }
        }

        if let Ok(timeout) = std::env::var("RESPCONN_CONNECT_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.connect_timeout_ms = ms;
            }
        }

        if let Ok(workers) = std::env::var("RESPCONN_DECODER_WORKERS") {
            if let Ok(n) = workers.parse() {
                self.decoder_workers = n;
            }
        }
    }

    /// Checks values that would otherwise stall the connection.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.addr.is_empty() {
            return Err(ConfigError::ValidationError("addr must not be empty".into()));
        }
        if self.decoder_workers == 0 {
            return Err(ConfigError::ValidationError(
                "decoder_workers must be at least 1".into(),
            ));
        }
        if self.write_batch_cap == 0 {
            return Err(ConfigError::ValidationError(
                "write_batch_cap must be positive".into(),
            ));
        }
        if self.username.is_some() && self.password.is_none() {
            return Err(ConfigError::ValidationError(
                "username requires a password".into(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_abort_timeout(mut self, timeout: Duration) -> Self {
        self.abort_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_write_batch_cap(mut self, cap: usize) -> Self {
        self.write_batch_cap = cap.max(1);
        self
    }

    pub fn with_decoder_workers(mut self, workers: usize) -> Self {
        self.decoder_workers = workers.max(1);
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_database(mut self, database: u32) -> Self {
        self.database = database;
        self
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn with_reconnect(mut self, enabled: bool) -> Self {
        self.reconnect = enabled;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn abort_timeout(&self) -> Duration {
        Duration::from_millis(self.abort_timeout_ms)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout_ms.map(Duration::from_millis)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}
