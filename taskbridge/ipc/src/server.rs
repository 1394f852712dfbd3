//! Host-side IPC server
//!
//! Claims the socket, assigns every connection a client id, acknowledges it,
//! and then relays frames: validated task commands go up to the host as
//! [`ServerEvent`]s, task events come down through a [`ServerHandle`].

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::pin;

use taskbridge_protocol::{Ack, Envelope, Message, TaskCommand, TaskEvent};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::actor::{LineChannel, RegistryHandle};
use crate::config::ServerConfig;
use crate::error::{IpcError, Result};

/// What the server reports to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Connect { client_id: String },
    Disconnect { client_id: String },
    TaskCommand { client_id: String, command: TaskCommand },
}

/// Sends task events to connected clients. Cheap to clone.
#[derive(Clone, Debug)]
pub struct ServerHandle {
    registry: RegistryHandle,
}

impl ServerHandle {
    /// Deliver `event` to every connected client.
    pub fn broadcast(&self, event: TaskEvent) {
        match Envelope::task_event(None, event).encode() {
            Ok(frame) => self.registry.broadcast(frame),
            Err(e) => error!("Failed to encode task event: {}", e),
        }
    }

    /// Deliver `event` to one client only.
    pub fn send_to(&self, client_id: &str, event: TaskEvent) {
        match Envelope::task_event(Some(client_id.to_string()), event).encode() {
            Ok(frame) => self.registry.send_to(client_id.to_string(), frame),
            Err(e) => error!("Failed to encode task event: {}", e),
        }
    }

    pub async fn connected_clients(&self) -> Vec<String> {
        self.registry.connected_clients().await
    }

    /// A handle with no socket behind it and one registered client whose
    /// frames arrive on the returned receiver.
    #[cfg(test)]
    pub(crate) fn detached(client_id: &str) -> (Self, mpsc::UnboundedReceiver<String>) {
        let registry = RegistryHandle::spawn();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        registry.register(client_id.to_string(), frames_tx);
        (Self { registry }, frames_rx)
    }
}

pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
    registry: RegistryHandle,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
}

impl IpcServer {
    /// Claim the socket at `config.socket_path`.
    ///
    /// A leftover socket file nobody is listening on is removed and reclaimed;
    /// a live one yields [`IpcError::AddressInUse`]. Must be called inside a
    /// tokio runtime.
    pub fn bind(
        config: &ServerConfig,
    ) -> Result<(Self, ServerHandle, mpsc::UnboundedReceiver<ServerEvent>)> {
        let socket_path = config.socket_path().to_path_buf();
        info!("Attempting to claim socket: {}", socket_path.display());

        let listener = claim_socket(&socket_path)?;
        listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(listener)?;
        info!("Listening on socket: {}", socket_path.display());

        let registry = RegistryHandle::spawn();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = ServerHandle {
            registry: registry.clone(),
        };
        let server = Self {
            listener,
            socket_path,
            registry,
            events_tx,
        };
        Ok((server, handle, events_rx))
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until `shutdown` resolves, then drop every client
    /// and remove the socket file.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let mut clients = tokio::task::JoinSet::new();
        let mut shutdown = pin!(shutdown);

        loop {
            tokio::select! {
                result = self.listener.accept() => match result {
                    Ok((stream, _addr)) => {
                        let client_id = Uuid::new_v4().to_string();
                        info!("Client {} connected", client_id);
                        clients.spawn(handle_connection(
                            client_id,
                            stream,
                            self.registry.clone(),
                            self.events_tx.clone(),
                        ));
                    }
                    Err(e) => error!("Failed to accept client connection: {}", e),
                },

                Some(finished) = clients.join_next() => {
                    if let Err(e) = finished {
                        warn!("Client connection task failed: {}", e);
                    }
                }

                () = &mut shutdown => {
                    info!("Shutdown requested, closing {} connections", clients.len());
                    break;
                }
            }
        }

        clients.shutdown().await;
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
            info!("Cleaned up socket file: {}", self.socket_path.display());
        }
        info!("IPC server shutdown complete");
        Ok(())
    }
}

fn claim_socket(socket_path: &Path) -> Result<std::os::unix::net::UnixListener> {
    use std::os::unix::net::{UnixListener, UnixStream};

    let bind_failed = |source: io::Error| IpcError::BindFailed {
        path: socket_path.display().to_string(),
        source,
    };

    match UnixListener::bind(socket_path) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            if UnixStream::connect(socket_path).is_ok() {
                error!("Another server is already listening on {}", socket_path.display());
                return Err(IpcError::AddressInUse(socket_path.display().to_string()));
            }
            info!("Removing stale socket file {}", socket_path.display());
            std::fs::remove_file(socket_path).map_err(bind_failed)?;
            UnixListener::bind(socket_path).map_err(bind_failed)
        }
        Err(e) => Err(bind_failed(e)),
    }
}

async fn handle_connection(
    client_id: String,
    stream: UnixStream,
    registry: RegistryHandle,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
) {
    let mut channel = LineChannel::new(stream);
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
    registry.register(client_id.clone(), outgoing_tx);

    if let Err(e) = send_ack(&mut channel, &client_id).await {
        warn!("Failed to acknowledge client {}: {}", client_id, e);
        registry.unregister(client_id);
        return;
    }
    let _ = events_tx.send(ServerEvent::Connect {
        client_id: client_id.clone(),
    });

    loop {
        tokio::select! {
            frame = channel.read_frame() => match frame {
                Ok(Some(frame)) => handle_frame(&client_id, &frame, &events_tx),
                Ok(None) => {
                    info!("Client {} disconnected", client_id);
                    break;
                }
                Err(e) => {
                    error!("Error reading from client {}: {}", client_id, e);
                    break;
                }
            },

            frame = outgoing_rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = channel.write_frame(&frame).await {
                    error!("Error writing to client {}: {}", client_id, e);
                    break;
                }
            }
        }
    }

    registry.unregister(client_id.clone());
    let _ = events_tx.send(ServerEvent::Disconnect { client_id });
}

async fn send_ack(channel: &mut LineChannel<UnixStream>, client_id: &str) -> Result<()> {
    let ack = Ack {
        client_id: client_id.to_string(),
        pid: std::process::id(),
        ppid: nix::unistd::getppid().as_raw() as u32,
    };
    let frame = Envelope::ack(ack).encode()?;
    channel.write_frame(&frame).await?;
    Ok(())
}

fn handle_frame(client_id: &str, frame: &str, events_tx: &mpsc::UnboundedSender<ServerEvent>) {
    let envelope = match Envelope::decode(frame) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Dropping invalid frame from client {}: {}", client_id, e);
            return;
        }
    };

    match envelope.message {
        Message::TaskCommand(command) => {
            if envelope.client_id.as_deref() != Some(client_id) {
                warn!(
                    "Rejecting {} from client {}: envelope carries client id {:?}",
                    command.name(),
                    client_id,
                    envelope.client_id
                );
                return;
            }
            debug!("Client {} sent {}", client_id, command.name());
            let _ = events_tx.send(ServerEvent::TaskCommand {
                client_id: client_id.to_string(),
                command,
            });
        }
        other => warn!("Ignoring {} from client {}", other.kind(), client_id),
    }
}

/// Resolves on the first SIGINT, SIGTERM or SIGHUP.
pub async fn shutdown_signal() {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate()).ok();
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup()).ok();

    tokio::select! {
        _ = signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down gracefully..."),
        Some(_) = recv_signal(&mut sigterm) => info!("Received SIGTERM, shutting down gracefully..."),
        Some(_) = recv_signal(&mut sighup) => info!("Received SIGHUP, shutting down gracefully..."),
    }
}

async fn recv_signal(stream: &mut Option<signal::unix::Signal>) -> Option<()> {
    match stream {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::UnixConnector;
    use crate::actor::transport::Connector;
    use std::time::Duration;

    const DEADLINE: Duration = Duration::from_secs(10);

    async fn read_envelope(channel: &mut LineChannel<UnixStream>) -> Envelope {
        let frame = tokio::time::timeout(DEADLINE, channel.read_frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        Envelope::decode(&frame).unwrap()
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(DEADLINE, events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_handshake_and_command_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::new(dir.path().join("ipc.sock"));
        let (server, _handle, mut events) = IpcServer::bind(&config).unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let running = tokio::spawn(server.run(async {
            let _ = stop_rx.await;
        }));

        let stream = UnixConnector.connect(config.socket_path()).await.unwrap();
        let mut channel = LineChannel::new(stream);
        let envelope = read_envelope(&mut channel).await;
        let Message::Ack(ack) = envelope.message.clone() else {
            panic!("expected ack, got {envelope:?}");
        };
        assert_eq!(ack.pid, std::process::id());
        assert_eq!(
            next_event(&mut events).await,
            ServerEvent::Connect {
                client_id: ack.client_id.clone()
            }
        );

        // Wrong client id is dropped; the matching one goes through
        let cancel = |task_id: &str| TaskCommand::CancelTask {
            task_id: task_id.to_string(),
        };
        let forged = Envelope::task_command("someone-else", cancel("forged"));
        channel.write_frame(&forged.encode().unwrap()).await.unwrap();
        channel.write_frame("{ not json").await.unwrap();
        let genuine = Envelope::task_command(ack.client_id.clone(), cancel("t1"));
        channel.write_frame(&genuine.encode().unwrap()).await.unwrap();

        assert_eq!(
            next_event(&mut events).await,
            ServerEvent::TaskCommand {
                client_id: ack.client_id.clone(),
                command: cancel("t1"),
            }
        );

        drop(channel);
        assert_eq!(
            next_event(&mut events).await,
            ServerEvent::Disconnect {
                client_id: ack.client_id
            }
        );

        stop_tx.send(()).unwrap();
        running.await.unwrap().unwrap();
        assert!(!config.socket_path().exists());
    }

    #[tokio::test]
    async fn test_broadcast_and_targeted_events() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::new(dir.path().join("ipc.sock"));
        let (server, handle, mut events) = IpcServer::bind(&config).unwrap();
        tokio::spawn(server.run(std::future::pending()));

        let mut first = LineChannel::new(UnixConnector.connect(config.socket_path()).await.unwrap());
        let first_id = read_envelope(&mut first).await.client_id.unwrap();
        let mut second = LineChannel::new(UnixConnector.connect(config.socket_path()).await.unwrap());
        let second_id = read_envelope(&mut second).await.client_id.unwrap();
        assert_ne!(first_id, second_id);
        next_event(&mut events).await;
        next_event(&mut events).await;

        let started = TaskEvent::TaskStarted {
            task_id: "t1".to_string(),
        };
        handle.broadcast(started.clone());
        for channel in [&mut first, &mut second] {
            let envelope = read_envelope(channel).await;
            assert_eq!(envelope.client_id, None);
            assert_eq!(envelope.message, Message::TaskEvent(started.clone()));
        }

        let rejected = TaskEvent::CommandRejected {
            command: "resume_task".to_string(),
            reason: "unknown task".to_string(),
        };
        handle.send_to(&second_id, rejected.clone());
        handle.broadcast(started.clone());

        let envelope = read_envelope(&mut second).await;
        assert_eq!(envelope.client_id.as_deref(), Some(second_id.as_str()));
        assert_eq!(envelope.message, Message::TaskEvent(rejected));
        // The first client only sees the later broadcast
        let envelope = read_envelope(&mut first).await;
        assert_eq!(envelope.message, Message::TaskEvent(started));
    }

    #[tokio::test]
    async fn test_bind_reclaims_stale_socket_but_not_live_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipc.sock");

        // A socket file with no listener behind it
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let config = ServerConfig::new(&path);
        let (live, _handle, _events) = IpcServer::bind(&config).unwrap();

        let err = IpcServer::bind(&config).err().unwrap();
        assert!(matches!(err, IpcError::AddressInUse(_)), "{err:?}");
        drop(live);
    }
}
