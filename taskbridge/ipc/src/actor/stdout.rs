//! Stdout Actor - Prints task events to stdout for CLI mode
//!
//! Receives task events from the client CLI loop and prints each one as a
//! single JSON line, so the output can be piped into other tools.

use taskbridge_protocol::TaskEvent;
use tokio::io::{self, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::Actor;

/// Actor that prints task events as JSON lines
struct StdoutActor<W> {
    event_rx: mpsc::Receiver<TaskEvent>,
    out: W,
}

impl<W: AsyncWrite + Send + Unpin + 'static> Actor for StdoutActor<W> {
    async fn run(mut self) {
        while let Some(event) = self.event_rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize {} to JSON: {}", event.name(), e);
                    continue;
                }
            };
            let line = format!("{}\n", json);
            if let Err(e) = self.out.write_all(line.as_bytes()).await {
                error!("Failed to write to stdout: {}", e);
                break;
            }
            if let Err(e) = self.out.flush().await {
                error!("Failed to flush stdout: {}", e);
                break;
            }
        }

        info!("StdoutActor shutting down");
    }
}

/// Handle for communicating with the stdout actor
pub struct StdoutHandle {
    sender: mpsc::Sender<TaskEvent>,
    actor: JoinHandle<()>,
}

impl StdoutHandle {
    pub fn spawn() -> Self {
        Self::with_writer(io::stdout())
    }

    pub fn with_writer<W: AsyncWrite + Send + Unpin + 'static>(out: W) -> Self {
        let (sender, event_rx) = mpsc::channel(32);
        let actor = StdoutActor { event_rx, out }.spawn();
        Self { sender, actor }
    }

    pub async fn print(&self, event: TaskEvent) {
        if self.sender.send(event).await.is_err() {
            error!("StdoutActor has stopped; event not printed");
        }
    }

    /// Wait until every queued event has been written.
    pub async fn shutdown(self) {
        drop(self.sender);
        if let Err(e) = self.actor.await {
            error!("StdoutActor ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;

    #[tokio::test]
    async fn test_prints_one_json_line_per_event() {
        let (writer, mut reader) = tokio::io::duplex(1024);
        let stdout = StdoutHandle::with_writer(writer);
        stdout
            .print(TaskEvent::TaskCompleted {
                task_id: "t1".to_string(),
            })
            .await;
        stdout.shutdown().await;

        let mut printed = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut reader, &mut printed)
            .await
            .unwrap();
        expect![[r#"
            {"eventName":"task_completed","payload":{"taskId":"t1"}}
        "#]]
        .assert_eq(&printed);
    }
}
