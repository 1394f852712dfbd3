//! Relays validated task commands from the server to the task host.
//!
//! The host is whatever actually runs tasks. Results the host wants clients to
//! see go back out as task events through the [`ServerHandle`]; a failed
//! command is reported to the issuing client as `command_rejected`.

use std::future::Future;
use std::sync::Arc;

use serde_json::{Map, Value};
use taskbridge_protocol::{TaskCommand, TaskEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::{ServerEvent, ServerHandle};

/// A new task as requested by `start_new_task`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub text: String,
    pub images: Vec<String>,
    pub new_tab: bool,
}

/// The task runner behind the server.
///
/// Methods should return promptly; long-running work belongs in a spawned
/// task, since the relay handles commands one at a time.
pub trait TaskHost: Send + Sync + 'static {
    /// Start a task and return its id.
    fn start_new_task(&self, task: NewTask) -> impl Future<Output = anyhow::Result<String>> + Send;

    fn resume_task(&self, task_id: &str) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn cancel_task(&self, task_id: &str) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn close_task(&self, task_id: &str) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Answer the task currently waiting on the user.
    fn send_message(
        &self,
        text: Option<String>,
        images: Vec<String>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn get_configuration(&self) -> impl Future<Output = anyhow::Result<Map<String, Value>>> + Send;

    fn set_configuration(
        &self,
        values: Map<String, Value>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

pub struct CommandRelay<H> {
    host: Arc<H>,
    server: ServerHandle,
}

impl<H: TaskHost> CommandRelay<H> {
    pub fn new(host: Arc<H>, server: ServerHandle) -> Self {
        Self { host, server }
    }

    /// Handle server events until the server goes away.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<ServerEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ServerEvent::Connect { client_id } => info!("Controller {} connected", client_id),
                ServerEvent::Disconnect { client_id } => {
                    info!("Controller {} disconnected", client_id)
                }
                ServerEvent::TaskCommand { client_id, command } => {
                    self.dispatch(&client_id, command).await
                }
            }
        }
        debug!("Command relay stopped");
    }

    pub async fn dispatch(&self, client_id: &str, command: TaskCommand) {
        let name = command.name();
        debug!("Dispatching {} from {}", name, client_id);

        if let Err(e) = self.apply(client_id, command).await {
            warn!("{} from {} failed: {:#}", name, client_id, e);
            self.server.send_to(
                client_id,
                TaskEvent::CommandRejected {
                    command: name.to_string(),
                    reason: format!("{e:#}"),
                },
            );
        }
    }

    async fn apply(&self, client_id: &str, command: TaskCommand) -> anyhow::Result<()> {
        match command {
            TaskCommand::StartNewTask {
                text,
                images,
                configuration,
                new_tab,
            } => {
                if let Some(values) = configuration {
                    self.host.set_configuration(values).await?;
                }
                let task_id = self
                    .host
                    .start_new_task(NewTask {
                        text,
                        images,
                        new_tab,
                    })
                    .await?;
                info!("Started task {} for {}", task_id, client_id);
            }
            TaskCommand::ResumeTask { task_id } => self.host.resume_task(&task_id).await?,
            TaskCommand::CancelTask { task_id } => self.host.cancel_task(&task_id).await?,
            TaskCommand::CloseTask { task_id } => self.host.close_task(&task_id).await?,
            TaskCommand::SendMessage { text, images } => {
                self.host.send_message(text, images).await?
            }
            TaskCommand::GetConfiguration => {
                let values = self.host.get_configuration().await?;
                self.server
                    .send_to(client_id, TaskEvent::Configuration { values });
            }
            TaskCommand::SetConfiguration { values } => {
                self.host.set_configuration(values).await?
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use taskbridge_protocol::{Envelope, Message};

    /// Records every call; fails the ones named in `failing`.
    #[derive(Default)]
    struct RecordingHost {
        calls: Mutex<Vec<String>>,
        failing: Vec<&'static str>,
    }

    impl RecordingHost {
        fn record(&self, call: String, method: &str) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(call);
            if self.failing.iter().any(|failing| *failing == method) {
                anyhow::bail!("{method} is unavailable");
            }
            Ok(())
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl TaskHost for RecordingHost {
        async fn start_new_task(&self, task: NewTask) -> anyhow::Result<String> {
            self.record(format!("start {}", task.text), "start_new_task")?;
            Ok("task-1".to_string())
        }

        async fn resume_task(&self, task_id: &str) -> anyhow::Result<()> {
            self.record(format!("resume {task_id}"), "resume_task")
        }

        async fn cancel_task(&self, task_id: &str) -> anyhow::Result<()> {
            self.record(format!("cancel {task_id}"), "cancel_task")
        }

        async fn close_task(&self, task_id: &str) -> anyhow::Result<()> {
            self.record(format!("close {task_id}"), "close_task")
        }

        async fn send_message(&self, text: Option<String>, _images: Vec<String>) -> anyhow::Result<()> {
            self.record(format!("message {}", text.unwrap_or_default()), "send_message")
        }

        async fn get_configuration(&self) -> anyhow::Result<Map<String, Value>> {
            self.record("get configuration".to_string(), "get_configuration")?;
            let mut values = Map::new();
            values.insert("mode".to_string(), Value::from("code"));
            Ok(values)
        }

        async fn set_configuration(&self, values: Map<String, Value>) -> anyhow::Result<()> {
            let keys: Vec<_> = values.keys().cloned().collect();
            self.record(format!("set {}", keys.join(",")), "set_configuration")
        }
    }

    struct Fixture {
        relay: CommandRelay<RecordingHost>,
        host: Arc<RecordingHost>,
        frames: mpsc::UnboundedReceiver<String>,
    }

    fn fixture(host: RecordingHost) -> Fixture {
        let host = Arc::new(host);
        let (server, frames) = ServerHandle::detached("c1");
        Fixture {
            relay: CommandRelay::new(host.clone(), server),
            host,
            frames,
        }
    }

    async fn next_event(frames: &mut mpsc::UnboundedReceiver<String>) -> Envelope {
        let frame = frames.recv().await.unwrap();
        Envelope::decode(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_start_applies_configuration_first() {
        let Fixture { relay, host, .. } = fixture(RecordingHost::default());
        let mut configuration = Map::new();
        configuration.insert("mode".to_string(), Value::from("architect"));

        relay
            .dispatch(
                "c1",
                TaskCommand::StartNewTask {
                    text: "hello".to_string(),
                    images: vec![],
                    configuration: Some(configuration),
                    new_tab: false,
                },
            )
            .await;
        relay
            .dispatch(
                "c1",
                TaskCommand::CancelTask {
                    task_id: "task-1".to_string(),
                },
            )
            .await;

        assert_eq!(host.calls(), vec!["set mode", "start hello", "cancel task-1"]);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_relay() {
        let Fixture {
            relay,
            host,
            mut frames,
        } = fixture(RecordingHost {
            failing: vec!["resume_task"],
            ..Default::default()
        });

        relay
            .dispatch(
                "c1",
                TaskCommand::ResumeTask {
                    task_id: "gone".to_string(),
                },
            )
            .await;
        relay
            .dispatch(
                "c1",
                TaskCommand::SendMessage {
                    text: Some("yes".to_string()),
                    images: vec![],
                },
            )
            .await;
        relay.dispatch("c1", TaskCommand::GetConfiguration).await;

        assert_eq!(
            host.calls(),
            vec!["resume gone", "message yes", "get configuration"]
        );

        // Only the requester hears about the failure and the configuration
        let rejected = next_event(&mut frames).await;
        assert_eq!(rejected.client_id.as_deref(), Some("c1"));
        assert_eq!(
            rejected.message,
            Message::TaskEvent(TaskEvent::CommandRejected {
                command: "resume_task".to_string(),
                reason: "resume_task is unavailable".to_string(),
            })
        );
        let Message::TaskEvent(TaskEvent::Configuration { values }) =
            next_event(&mut frames).await.message
        else {
            panic!("expected configuration event");
        };
        assert_eq!(values.get("mode"), Some(&Value::from("code")));
    }
}
