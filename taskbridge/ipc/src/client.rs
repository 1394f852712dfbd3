//! Controller-side IPC client
//!
//! [`IpcClient`] is a cheap, cloneable handle onto a background
//! [`ClientActor`]. The actor owns the socket; the handle reads the published
//! session snapshot and queues outgoing envelopes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use taskbridge_protocol::{Ack, Envelope, TaskCommand, TaskEvent};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::actor::Actor;
use crate::actor::client::{ClientActor, Control};
use crate::actor::transport::{Connector, UnixConnector};
use crate::config::IpcClientConfig;
use crate::error::{IpcError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Socket open, handshake not yet acknowledged.
    Connected,
    /// Handshake acknowledged; commands may be sent.
    Ready,
    ShuttingDown,
}

/// Why a [`ClientEvent::Disconnect`] was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// An established connection dropped; the client will retry.
    ConnectionLost,
    /// The retry budget is spent; the client will not reconnect on its own.
    RetriesExhausted,
}

/// Lifecycle notifications delivered to every subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connect,
    Disconnect { reason: DisconnectReason },
    Ack(Ack),
    TaskEvent(TaskEvent),
}

/// Point-in-time view of the client session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    /// Local identifier of this session, fixed at construction.
    pub id: String,
    /// Server-assigned id from the last handshake; cleared on disconnect.
    pub client_id: Option<String>,
    pub state: ConnectionState,
    /// Consecutive failed attempts since the last successful connection.
    pub reconnect_attempts: u32,
    pub shutdown_in_progress: bool,
    /// The background actor has stopped and will not reconnect.
    pub terminated: bool,
}

impl SessionSnapshot {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            client_id: None,
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            shutdown_in_progress: false,
            terminated: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Ready
        )
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready && self.client_id.is_some()
    }
}

/// Handle to a controller session. Clones share the same session.
///
/// Construction spawns the session actor, so it must happen inside a tokio
/// runtime.
#[derive(Clone)]
pub struct IpcClient {
    outgoing_tx: mpsc::UnboundedSender<Envelope>,
    control_tx: Arc<watch::Sender<Control>>,
    session: Arc<watch::Sender<SessionSnapshot>>,
    events_tx: broadcast::Sender<ClientEvent>,
    actor: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl IpcClient {
    /// Connect over the Unix socket named in `config`.
    pub fn new(config: IpcClientConfig) -> Self {
        Self::with_connector(config, UnixConnector)
    }

    pub fn with_connector<C: Connector>(config: IpcClientConfig, connector: C) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = watch::channel(Control::Run);
        let (session_tx, _) = watch::channel(SessionSnapshot::new());
        let session = Arc::new(session_tx);
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));

        info!(
            "Starting IPC client session {} for {}",
            session.borrow().id,
            config.socket_path.display()
        );

        let actor = ClientActor::new(
            connector,
            config,
            outgoing_rx,
            control_rx,
            session.clone(),
            events_tx.clone(),
        );
        let handle = actor.spawn();

        Self {
            outgoing_tx,
            control_tx: Arc::new(control_tx),
            session,
            events_tx,
            actor: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events_tx.subscribe()
    }

    pub fn session(&self) -> SessionSnapshot {
        self.session.borrow().clone()
    }

    pub fn id(&self) -> String {
        self.session.borrow().id.clone()
    }

    /// Server-assigned id, present only while the session is ready.
    pub fn client_id(&self) -> Option<String> {
        let session = self.session.borrow();
        if session.is_ready() {
            session.client_id.clone()
        } else {
            None
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.borrow().is_connected()
    }

    pub fn is_ready(&self) -> bool {
        self.session.borrow().is_ready()
    }

    /// Wrap `command` in an envelope stamped with the current client id and
    /// queue it. Never waits: if the session is not ready the command is
    /// dropped with a warning.
    pub fn send_command(&self, command: TaskCommand) {
        let Some(client_id) = self.client_id() else {
            warn!("IPC client not ready; dropping {} command", command.name());
            return;
        };
        self.send_message(Envelope::task_command(client_id, command));
    }

    /// Queue an already-built envelope. Dropped with a warning when not ready.
    pub fn send_message(&self, envelope: Envelope) {
        if !self.is_ready() {
            warn!("IPC client not ready; dropping {}", envelope.kind());
            return;
        }
        if self.outgoing_tx.send(envelope).is_err() {
            warn!("IPC client session has stopped; message dropped");
        }
    }

    /// Wait for the handshake to complete. Returns the server-assigned id.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<String> {
        let mut session = self.session.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            session.wait_for(|s| s.is_ready() || s.terminated || s.shutdown_in_progress),
        )
        .await;

        let snapshot = match waited {
            Ok(Ok(snapshot)) => (*snapshot).clone(),
            Ok(Err(_)) => return Err(IpcError::SessionClosed),
            Err(_) => return Err(IpcError::Timeout(timeout)),
        };
        if !snapshot.is_ready() {
            return Err(IpcError::SessionClosed);
        }
        snapshot.client_id.ok_or(IpcError::SessionClosed)
    }

    /// Stop the session without marking it shut down.
    pub fn disconnect(&self) {
        self.control_tx.send_if_modified(|control| {
            if *control == Control::Run {
                *control = Control::Disconnect;
                true
            } else {
                false
            }
        });
    }

    /// Stop retries and close the connection. Only the first call does any
    /// work; later calls return immediately.
    pub async fn shutdown(&self) {
        let first = self.session.send_if_modified(|session| {
            if session.shutdown_in_progress {
                return false;
            }
            session.shutdown_in_progress = true;
            session.state = ConnectionState::ShuttingDown;
            true
        });
        if !first {
            return;
        }

        info!("Shutting down IPC client session {}", self.id());
        self.control_tx.send_replace(Control::Shutdown);

        let handle = self.actor.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("IPC client actor ended abnormally: {}", e);
            }
        }
    }
}

/// Shut `client` down on SIGINT, SIGTERM or SIGHUP. Each signal is observed once.
pub fn install_signal_handlers(client: IpcClient) -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let signals = [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
        (SignalKind::hangup(), "SIGHUP"),
    ];
    for (kind, name) in signals {
        let mut stream = signal(kind)?;
        tokio::spawn(shutdown_on(
            client.clone(),
            async move { stream.recv().await },
            name,
        ));
    }
    Ok(())
}

/// Wait for one delivery of `signal`, then shut `client` down. A signal
/// source that closes without delivering leaves the client alone.
async fn shutdown_on(
    client: IpcClient,
    signal: impl Future<Output = Option<()>>,
    name: &str,
) {
    if signal.await.is_some() {
        info!("Received {}, shutting down IPC client", name);
        client.shutdown().await;
    }
}
