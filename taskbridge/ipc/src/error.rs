//! Error types for the IPC layer

use thiserror::Error;

/// Errors that can occur while setting up or running the IPC channel
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("Failed to bind socket at {path}: {source}")]
    BindFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("Another server already owns the socket at {0}")]
    AddressInUse(String),

    #[error("Timed out after {0:?} waiting for the handshake")]
    Timeout(std::time::Duration),

    #[error("Client session has shut down")]
    SessionClosed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] taskbridge_protocol::ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IpcError>;

/// Errors building configuration from the environment
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable {0} not set")]
    MissingEnvironmentVariable(&'static str),

    #[error("{field} must be greater than zero")]
    ZeroValue { field: &'static str },
}
