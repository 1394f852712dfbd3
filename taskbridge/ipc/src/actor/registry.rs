//! Registry actor - the server's table of connected clients
//!
//! Connection handlers register an outbound frame channel under the client id
//! they assigned. Broadcasts and targeted sends are fanned out from here, and
//! channels whose connection has gone away are pruned on the next send.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::Actor;

/// Messages sent to the registry actor
#[derive(Debug)]
pub enum RegistryMessage {
    Register {
        client_id: String,
        sender: mpsc::UnboundedSender<String>,
    },
    Unregister {
        client_id: String,
    },
    /// Deliver an encoded frame to every connected client
    Broadcast { frame: String },
    /// Deliver an encoded frame to one client
    SendTo { client_id: String, frame: String },
    ConnectedClients(oneshot::Sender<Vec<String>>),
}

struct RegistryActor {
    receiver: mpsc::UnboundedReceiver<RegistryMessage>,
    clients: HashMap<String, mpsc::UnboundedSender<String>>,
}

impl RegistryActor {
    fn broadcast(&mut self, frame: String) {
        self.clients.retain(|client_id, sender| {
            let delivered = sender.send(frame.clone()).is_ok();
            if !delivered {
                debug!("Pruning closed client {}", client_id);
            }
            delivered
        });
        debug!("Broadcast frame to {} clients", self.clients.len());
    }

    fn send_to(&mut self, client_id: String, frame: String) {
        let Some(sender) = self.clients.get(&client_id) else {
            warn!("No connected client {}; frame dropped", client_id);
            return;
        };
        if sender.send(frame).is_err() {
            debug!("Pruning closed client {}", client_id);
            self.clients.remove(&client_id);
        }
    }
}

impl Actor for RegistryActor {
    async fn run(mut self) {
        info!("Registry actor started");

        while let Some(message) = self.receiver.recv().await {
            match message {
                RegistryMessage::Register { client_id, sender } => {
                    self.clients.insert(client_id.clone(), sender);
                    info!(
                        "Client {} registered, total: {}",
                        client_id,
                        self.clients.len()
                    );
                }
                RegistryMessage::Unregister { client_id } => {
                    if self.clients.remove(&client_id).is_some() {
                        info!(
                            "Client {} unregistered, total: {}",
                            client_id,
                            self.clients.len()
                        );
                    }
                }
                RegistryMessage::Broadcast { frame } => self.broadcast(frame),
                RegistryMessage::SendTo { client_id, frame } => self.send_to(client_id, frame),
                RegistryMessage::ConnectedClients(reply) => {
                    let mut ids: Vec<String> = self.clients.keys().cloned().collect();
                    ids.sort();
                    let _ = reply.send(ids);
                }
            }
        }

        info!("Registry actor stopped");
    }
}

/// Handle for talking to the registry actor
#[derive(Clone, Debug)]
pub struct RegistryHandle {
    sender: mpsc::UnboundedSender<RegistryMessage>,
}

impl RegistryHandle {
    pub fn spawn() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        RegistryActor {
            receiver,
            clients: HashMap::new(),
        }
        .spawn();
        Self { sender }
    }

    fn send(&self, message: RegistryMessage) {
        if self.sender.send(message).is_err() {
            warn!("Registry actor has stopped");
        }
    }

    pub fn register(&self, client_id: String, sender: mpsc::UnboundedSender<String>) {
        self.send(RegistryMessage::Register { client_id, sender });
    }

    pub fn unregister(&self, client_id: String) {
        self.send(RegistryMessage::Unregister { client_id });
    }

    pub fn broadcast(&self, frame: String) {
        self.send(RegistryMessage::Broadcast { frame });
    }

    pub fn send_to(&self, client_id: String, frame: String) {
        self.send(RegistryMessage::SendTo { client_id, frame });
    }

    /// Ids of the currently registered clients, sorted.
    pub async fn connected_clients(&self) -> Vec<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(RegistryMessage::ConnectedClients(reply_tx));
        reply_rx.await.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_and_targeted_delivery() {
        let registry = RegistryHandle::spawn();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        registry.register("a".to_string(), a_tx);
        registry.register("b".to_string(), b_tx);

        registry.broadcast("hello".to_string());
        registry.send_to("b".to_string(), "just b".to_string());

        assert_eq!(a_rx.recv().await.as_deref(), Some("hello"));
        assert_eq!(b_rx.recv().await.as_deref(), Some("hello"));
        assert_eq!(b_rx.recv().await.as_deref(), Some("just b"));
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_clients_are_pruned() {
        let registry = RegistryHandle::spawn();
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, _b_rx) = mpsc::unbounded_channel();
        registry.register("a".to_string(), a_tx);
        registry.register("b".to_string(), b_tx);
        assert_eq!(registry.connected_clients().await, vec!["a", "b"]);

        drop(a_rx);
        registry.broadcast("ping".to_string());
        assert_eq!(registry.connected_clients().await, vec!["b"]);

        registry.unregister("b".to_string());
        assert!(registry.connected_clients().await.is_empty());
    }
}
