// Actors for the IPC layer
//
// Each actor owns its state and is driven by messages over tokio channels:
// - transport: socket connector and newline-delimited framing
// - client: controller-side session (handshake, retries, readiness)
// - registry: server-side table of connected clients
// - stdout: prints task events for the CLI

pub mod client;
pub mod registry;
pub mod stdout;
pub mod transport;

pub use registry::RegistryHandle;
pub use stdout::StdoutHandle;
pub use transport::{Connector, LineChannel, RetryPolicy, UnixConnector};

use std::future::Future;

/// A [Tokio actor](https://ryhl.io/blog/actors-with-tokio/): owns its state and
/// runs until its input channels close.
pub trait Actor: Sized + Send + 'static {
    fn run(self) -> impl Future<Output = ()> + Send;

    fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
