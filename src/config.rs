use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("worker count must be at least 1")]
    NoWorkers,
    #[error("worker queue capacity must be at least 1")]
    NoQueueCapacity,
    #[error("max_connections must be at least 1")]
    NoConnections,
    #[error("accept ratio must be between 0 and 100 (got {0})")]
    AcceptRatio(u8),
    #[error("max message size {0} is smaller than a message header")]
    MessageSize(usize),
    #[error("write chunk size must be non-zero")]
    WriteChunk,
    #[error("cannot resolve listen address {0}")]
    ListenAddress(String),
}

/// Gateway settings. Read once at startup and shared immutably afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub listen_host: String,
    pub listen_port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub workers: usize,
    pub worker_queue_capacity: usize,
    /// How long a write may keep retrying on contention. Zero retries forever.
    pub busy_timeout: Duration,
    pub busy_retry_interval: Duration,
    /// Internal lock wait handed to the storage engine; kept short so workers stay responsive.
    pub engine_lock_wait: Duration,
    pub connect_timeout: Duration,
    pub max_message_size: usize,
    /// Share of each loop iteration given to admitting queued connections, in percent.
    pub accept_ratio: u8,
    pub write_chunk_size: usize,
    pub users_file: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: DEFAULT_PORT,
            data_dir: PathBuf::from("./data"),
            max_connections: 100,
            workers: num_cpus::get().max(1),
            worker_queue_capacity: 128,
            busy_timeout: Duration::from_secs(50),
            busy_retry_interval: Duration::from_millis(10),
            engine_lock_wait: Duration::from_millis(1),
            connect_timeout: Duration::from_secs(10),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            accept_ratio: 50,
            write_chunk_size: 64 * 1024,
            users_file: None,
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.worker_queue_capacity == 0 {
            return Err(ConfigError::NoQueueCapacity);
        }
        if self.max_connections == 0 {
            return Err(ConfigError::NoConnections);
        }
        if self.accept_ratio > 100 {
            return Err(ConfigError::AcceptRatio(self.accept_ratio));
        }
        if self.max_message_size < 5 {
            return Err(ConfigError::MessageSize(self.max_message_size));
        }
        if self.write_chunk_size == 0 {
            return Err(ConfigError::WriteChunk);
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let raw = format!("{}:{}", self.listen_host, self.listen_port);
        raw.to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or(ConfigError::ListenAddress(raw))
    }

    /// `None` means contention is retried until the client cancels.
    pub fn busy_deadline(&self) -> Option<Duration> {
        (!self.busy_timeout.is_zero()).then_some(self.busy_timeout)
    }
}
