//! Taskbridge IPC
//!
//! A Unix-socket channel between an editor host running coding-assistant
//! tasks and external controllers that drive them, plus the streaming
//! pipeline that turns raw model output into transcript blocks and at most
//! one tool execution per turn.

pub mod actor;
pub mod assistant_message;
pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod present;
pub mod relay;
pub mod replay;
pub mod server;
pub mod structured_logging;
pub mod turn;

pub use actor::StdoutHandle;
pub use client::{ClientEvent, ConnectionState, DisconnectReason, IpcClient, SessionSnapshot};
pub use config::{IpcClientConfig, ServerConfig};
pub use error::{ConfigError, IpcError, Result};
pub use relay::{CommandRelay, NewTask, TaskHost};
pub use server::{IpcServer, ServerEvent, ServerHandle};
pub use turn::run_turn;
