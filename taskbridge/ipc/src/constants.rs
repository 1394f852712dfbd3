//! Constants and configuration values used throughout taskbridge

use std::time::Duration;

/// Directory for temporary files (sockets, logs, etc.)
pub const TEMP_DIR: &str = "/tmp";

/// Default socket file name for the IPC server
pub const DEFAULT_SOCKET_NAME: &str = "taskbridge-ipc.sock";

/// Environment variable naming the socket a controller should connect to
pub const SOCKET_PATH_ENV: &str = "TASKBRIDGE_IPC_SOCKET_PATH";

/// Default log file name for development mode
pub const DEV_LOG_FILENAME: &str = "taskbridge.log";

/// Consecutive failed connection attempts before the client gives up
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Base of the linear reconnect delay (`base * attempt`)
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// How long a single connection attempt may take before it counts as failed
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffered client events per subscriber before a slow subscriber starts lagging
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Frames longer than this are discarded by the line channel
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Default server socket path
pub fn default_socket_path() -> String {
    format!("{}/{}", TEMP_DIR, DEFAULT_SOCKET_NAME)
}

/// Development log file path
pub fn dev_log_path() -> String {
    format!("{}/{}", TEMP_DIR, DEV_LOG_FILENAME)
}
