//! Explicit configuration for the client and server.
//!
//! Retry and timeout knobs are plain values handed to the constructor; nothing
//! here is process-global.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants;
use crate::error::ConfigError;

/// Settings for an [`IpcClient`](crate::client::IpcClient).
#[derive(Debug, Clone)]
pub struct IpcClientConfig {
    /// Socket the server listens on.
    pub socket_path: PathBuf,

    /// Consecutive failed attempts before the client emits a terminal
    /// `Disconnect` and stops retrying. Default: 10.
    pub max_retries: u32,

    /// Reconnect delay is `retry_base_delay * attempt`. Default: 1s.
    pub retry_base_delay: Duration,

    /// Bound on a single connection attempt. Default: 10s.
    pub connect_timeout: Duration,

    /// Per-subscriber event buffer. Default: 256.
    pub event_capacity: usize,
}

impl IpcClientConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            max_retries: constants::DEFAULT_MAX_RETRIES,
            retry_base_delay: constants::DEFAULT_RETRY_BASE_DELAY,
            connect_timeout: constants::DEFAULT_CONNECT_TIMEOUT,
            event_capacity: constants::DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Read the socket path from `TASKBRIDGE_IPC_SOCKET_PATH`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var_os(constants::SOCKET_PATH_ENV)
            .ok_or(ConfigError::MissingEnvironmentVariable(constants::SOCKET_PATH_ENV))?;
        Ok(Self::new(path))
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::ZeroValue {
                field: "max_retries",
            });
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::ZeroValue {
                field: "event_capacity",
            });
        }
        Ok(())
    }
}

impl Default for IpcClientConfig {
    fn default() -> Self {
        Self::new(constants::default_socket_path())
    }
}

/// Settings for an [`IpcServer`](crate::server::IpcServer).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
}

impl ServerConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(constants::default_socket_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IpcClientConfig::new("/tmp/x.sock");
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.retry_base_delay, Duration::from_secs(1));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders_and_validation() {
        let config = IpcClientConfig::default()
            .with_max_retries(0)
            .with_retry_base_delay(Duration::from_millis(5));
        assert_eq!(config.retry_base_delay, Duration::from_millis(5));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroValue {
                field: "max_retries"
            })
        ));

        let config = IpcClientConfig::default().with_event_capacity(0);
        assert!(config.validate().is_err());
    }
}
