//! Client actor - owns the controller side of one IPC session
//!
//! Drives the connect / handshake / retry state machine. Published state lives
//! in a watch channel shared with [`IpcClient`](crate::client::IpcClient) and
//! lifecycle notifications go out on a broadcast channel.

use std::sync::Arc;

use taskbridge_protocol::{Envelope, Message};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use super::Actor;
use super::transport::{Connector, LineChannel, RetryPolicy};
use crate::client::{ClientEvent, ConnectionState, DisconnectReason, SessionSnapshot};
use crate::config::IpcClientConfig;

/// Lifecycle requests from the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    Run,
    Disconnect,
    Shutdown,
}

enum Attempt<S> {
    Connected(S),
    Failed(String),
    Stopped,
}

enum Served {
    Lost,
    Stopped,
}

pub(crate) struct ClientActor<C: Connector> {
    connector: C,
    config: IpcClientConfig,
    retry: RetryPolicy,
    outgoing_rx: mpsc::UnboundedReceiver<Envelope>,
    control_rx: watch::Receiver<Control>,
    session: Arc<watch::Sender<SessionSnapshot>>,
    events_tx: broadcast::Sender<ClientEvent>,
}

impl<C: Connector> ClientActor<C> {
    pub(crate) fn new(
        connector: C,
        config: IpcClientConfig,
        outgoing_rx: mpsc::UnboundedReceiver<Envelope>,
        control_rx: watch::Receiver<Control>,
        session: Arc<watch::Sender<SessionSnapshot>>,
        events_tx: broadcast::Sender<ClientEvent>,
    ) -> Self {
        let retry = RetryPolicy::new(config.max_retries, config.retry_base_delay);
        Self {
            connector,
            config,
            retry,
            outgoing_rx,
            control_rx,
            session,
            events_tx,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.session.send_modify(|session| {
            if !session.shutdown_in_progress {
                session.state = state;
            }
        });
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }

    async fn establish(&mut self) -> Attempt<C::Stream> {
        let path = self.config.socket_path.clone();
        let timeout = self.config.connect_timeout;
        let connect = tokio::time::timeout(timeout, self.connector.connect(&path));
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok(Ok(stream)) => Attempt::Connected(stream),
                        Ok(Err(e)) => Attempt::Failed(format!("{}: {e}", path.display())),
                        Err(_) => Attempt::Failed(format!(
                            "{}: no connection within {timeout:?}",
                            path.display()
                        )),
                    };
                }

                _ = stop_requested(&mut self.control_rx) => return Attempt::Stopped,

                Some(envelope) = self.outgoing_rx.recv() => log_dropped(&envelope, "not connected"),
            }
        }
    }

    fn on_connected(&self) {
        self.session.send_modify(|session| {
            session.reconnect_attempts = 0;
            if !session.shutdown_in_progress {
                session.state = ConnectionState::Connected;
            }
        });
        info!("Connected to {}", self.config.socket_path.display());
        self.emit(ClientEvent::Connect);
    }

    async fn serve(&mut self, mut channel: LineChannel<C::Stream>) -> Served {
        loop {
            tokio::select! {
                frame = channel.read_frame() => match frame {
                    Ok(Some(frame)) => self.handle_frame(&frame),
                    Ok(None) => {
                        info!("Server closed the connection");
                        return Served::Lost;
                    }
                    Err(e) => {
                        warn!("Error reading from server: {}", e);
                        return Served::Lost;
                    }
                },

                envelope = self.outgoing_rx.recv() => {
                    let Some(envelope) = envelope else {
                        debug!("All client handles dropped");
                        return Served::Stopped;
                    };
                    // Readiness may have been lost since the handle checked it
                    if !self.session.borrow().is_ready() {
                        log_dropped(&envelope, "session not ready");
                        continue;
                    }
                    let frame = match envelope.encode() {
                        Ok(frame) => frame,
                        Err(e) => {
                            error!("Failed to encode outgoing {}: {}", envelope.kind(), e);
                            continue;
                        }
                    };
                    if let Err(e) = channel.write_frame(&frame).await {
                        warn!("Error writing to server: {}", e);
                        return Served::Lost;
                    }
                    debug!("Sent {} to server", envelope.kind());
                }

                _ = stop_requested(&mut self.control_rx) => return Served::Stopped,
            }
        }
    }

    fn handle_frame(&self, frame: &str) {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping invalid frame from server: {} (frame: {})", e, frame);
                return;
            }
        };

        match envelope.message {
            Message::Ack(ack) => {
                self.session.send_modify(|session| {
                    if !session.shutdown_in_progress {
                        session.client_id = Some(ack.client_id.clone());
                        session.state = ConnectionState::Ready;
                    }
                });
                info!(
                    "Handshake complete: client id {} (server pid {})",
                    ack.client_id, ack.pid
                );
                self.emit(ClientEvent::Ack(ack));
            }
            Message::TaskEvent(event) => {
                debug!("Received task event {}", event.name());
                self.emit(ClientEvent::TaskEvent(event));
            }
            Message::TaskCommand(command) => {
                warn!("Ignoring task command {} sent by server", command.name());
            }
        }
    }

    fn on_connection_closed(&self) {
        self.session.send_modify(|session| {
            session.client_id = None;
            if !session.shutdown_in_progress {
                session.state = ConnectionState::Disconnected;
            }
        });
    }

    /// Count a failure and wait out the retry delay.
    ///
    /// Returns false when the actor should stop: budget exhausted or a stop
    /// was requested while waiting.
    async fn back_off(&mut self) -> bool {
        let mut attempts = 0;
        self.session.send_modify(|session| {
            session.reconnect_attempts += 1;
            attempts = session.reconnect_attempts;
        });

        if self.retry.is_exhausted(attempts) {
            error!(
                "Giving up on {} after {} failed attempts",
                self.config.socket_path.display(),
                attempts
            );
            self.emit(ClientEvent::Disconnect {
                reason: DisconnectReason::RetriesExhausted,
            });
            return false;
        }

        let delay = self.retry.delay_for(attempts);
        info!(
            "Retrying in {:?} (attempt {}/{})",
            delay, attempts, self.retry.max_retries
        );

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                _ = stop_requested(&mut self.control_rx) => return false,
                Some(envelope) = self.outgoing_rx.recv() => log_dropped(&envelope, "reconnecting"),
            }
        }
    }

    fn finish(&self) {
        self.session.send_modify(|session| {
            session.client_id = None;
            session.terminated = true;
            if !session.shutdown_in_progress {
                session.state = ConnectionState::Disconnected;
            }
        });
        info!("Client session {} stopped", self.session.borrow().id);
    }
}

impl<C: Connector> Actor for ClientActor<C> {
    async fn run(mut self) {
        loop {
            if *self.control_rx.borrow() != Control::Run {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            match self.establish().await {
                Attempt::Connected(stream) => {
                    self.on_connected();
                    let served = self.serve(LineChannel::new(stream)).await;
                    self.on_connection_closed();
                    match served {
                        Served::Stopped => break,
                        Served::Lost => self.emit(ClientEvent::Disconnect {
                            reason: DisconnectReason::ConnectionLost,
                        }),
                    }
                }
                Attempt::Failed(reason) => {
                    warn!("Connection attempt failed: {}", reason);
                    self.set_state(ConnectionState::Disconnected);
                }
                Attempt::Stopped => break,
            }

            if !self.back_off().await {
                break;
            }
        }

        self.finish();
    }
}

/// Resolves once the handle asks the actor to stop, or every handle is gone.
async fn stop_requested(control: &mut watch::Receiver<Control>) {
    loop {
        if *control.borrow_and_update() != Control::Run {
            return;
        }
        if control.changed().await.is_err() {
            return;
        }
    }
}

fn log_dropped(envelope: &Envelope, why: &str) {
    warn!("Dropping outgoing {} ({})", envelope.kind(), why);
}
