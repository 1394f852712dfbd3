//! A task host that replays text as if a model had streamed it.
//!
//! Each started task feeds its text (or a scripted response) through
//! [`run_turn`] in small chunks, publishing the transcript and lifecycle as
//! task events. Tools are acknowledged, not run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, bail};
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use taskbridge_protocol::{MessageAction, MessageType, TaskEvent, TaskMessage};
use tracing::info;
use uuid::Uuid;

use crate::assistant_message::{ToolUse, ToolVocabulary};
use crate::present::{AbortFlag, ToolExecutor, ToolOutcome, Transcript};
use crate::relay::{NewTask, TaskHost};
use crate::server::ServerHandle;
use crate::turn::run_turn;

/// Characters per replayed chunk unless configured otherwise.
pub const DEFAULT_CHUNK_CHARS: usize = 16;

/// Answers every tool call with an acknowledgment and remembers it.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<ToolUse>>,
}

impl RecordingExecutor {
    pub fn calls(&self) -> Vec<ToolUse> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }
}

impl ToolExecutor for RecordingExecutor {
    fn execute(&self, tool: ToolUse) -> BoxFuture<'static, Result<String, String>> {
        let reply = format!(
            "{} acknowledged with {} parameter(s)",
            tool.name,
            tool.params.len()
        );
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(tool);
        }
        Box::pin(async move { Ok(reply) })
    }
}

/// Publishes one task's transcript as `message` events.
struct EventTranscript {
    task_id: String,
    server: ServerHandle,
    /// Timestamp of each block already shown, so later renders update it.
    shown: HashMap<usize, u64>,
    last_ts: u64,
}

impl EventTranscript {
    fn new(task_id: String, server: ServerHandle) -> Self {
        Self {
            task_id,
            server,
            shown: HashMap::new(),
            last_ts: 0,
        }
    }

    fn next_ts(&mut self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.last_ts = now.max(self.last_ts + 1);
        self.last_ts
    }

    fn publish(&mut self, ts: u64, action: MessageAction, text: String, partial: bool) {
        self.server.broadcast(TaskEvent::Message {
            task_id: self.task_id.clone(),
            action,
            message: TaskMessage {
                ts,
                kind: MessageType::Say,
                text: Some(text),
                partial,
            },
        });
    }

    fn say(&mut self, text: String) {
        let ts = self.next_ts();
        self.publish(ts, MessageAction::Created, text, false);
    }
}

impl Transcript for EventTranscript {
    fn say_text(&mut self, index: usize, text: &str, partial: bool) {
        let (ts, action) = match self.shown.get(&index) {
            Some(&ts) => (ts, MessageAction::Updated),
            None => {
                let ts = self.next_ts();
                self.shown.insert(index, ts);
                (ts, MessageAction::Created)
            }
        };
        self.publish(ts, action, text.to_string(), partial);
    }

    fn tool_started(&mut self, tool: &ToolUse) {
        let params = serde_json::to_string(&tool.params).unwrap_or_default();
        self.say(format!("[{}] {}", tool.name, params));
    }

    fn tool_result(&mut self, outcome: &ToolOutcome) {
        match &outcome.result {
            Ok(output) => self.say(format!("[{} result] {}", outcome.tool.name, output)),
            Err(e) => self.server.broadcast(TaskEvent::TaskToolFailed {
                task_id: self.task_id.clone(),
                tool_name: outcome.tool.name.clone(),
                error: e.clone(),
            }),
        }
    }

    fn error(&mut self, message: &str) {
        self.say(format!("Error: {message}"));
    }
}

struct Task {
    text: String,
    abort: AbortFlag,
}

/// [`TaskHost`] that replays task text through the turn pipeline.
pub struct ReplayHost {
    server: ServerHandle,
    /// Replayed for every task instead of the task's own text when set.
    script: Option<String>,
    chunk_chars: usize,
    vocabulary: ToolVocabulary,
    executor: Arc<RecordingExecutor>,
    tasks: Mutex<HashMap<String, Task>>,
    /// Most recently started task; `send_message` answers it.
    current: Mutex<Option<String>>,
    configuration: Mutex<Map<String, Value>>,
}

impl ReplayHost {
    pub fn new(server: ServerHandle) -> Self {
        Self {
            server,
            script: None,
            chunk_chars: DEFAULT_CHUNK_CHARS,
            vocabulary: ToolVocabulary::default(),
            executor: Arc::new(RecordingExecutor::default()),
            tasks: Mutex::new(HashMap::new()),
            current: Mutex::new(None),
            configuration: Mutex::new(Map::new()),
        }
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self
    }

    pub fn with_chunk_chars(mut self, chunk_chars: usize) -> Self {
        self.chunk_chars = chunk_chars.max(1);
        self
    }

    pub fn executor(&self) -> Arc<RecordingExecutor> {
        self.executor.clone()
    }

    fn lock<T>(mutex: &Mutex<T>) -> anyhow::Result<std::sync::MutexGuard<'_, T>> {
        mutex
            .lock()
            .map_err(|_| anyhow::anyhow!("replay host state is poisoned"))
    }

    fn abort_flag(&self, task_id: &str) -> anyhow::Result<AbortFlag> {
        let tasks = Self::lock(&self.tasks)?;
        let task = tasks
            .get(task_id)
            .with_context(|| format!("unknown task `{task_id}`"))?;
        Ok(task.abort.clone())
    }

    /// Replay `text` as task `task_id` on a background task.
    fn spawn_turn(&self, task_id: String, text: String, abort: AbortFlag) {
        let server = self.server.clone();
        let vocabulary = self.vocabulary.clone();
        let executor = self.executor.clone();
        let stream = futures::stream::iter(
            chunk_text(&text, self.chunk_chars)
                .into_iter()
                .map(Ok::<_, anyhow::Error>),
        );

        tokio::spawn(async move {
            server.broadcast(TaskEvent::TaskStarted {
                task_id: task_id.clone(),
            });
            let transcript = EventTranscript::new(task_id.clone(), server.clone());
            let outcome = run_turn(stream, vocabulary, transcript, executor, abort).await;

            let event = if outcome.aborted {
                TaskEvent::TaskAborted { task_id }
            } else {
                TaskEvent::TaskCompleted { task_id }
            };
            info!("Replay finished with {}", event.name());
            server.broadcast(event);
        });
    }
}

impl TaskHost for ReplayHost {
    async fn start_new_task(&self, task: NewTask) -> anyhow::Result<String> {
        let task_id = Uuid::new_v4().to_string();
        let text = self.script.clone().unwrap_or(task.text);
        let abort = AbortFlag::new();

        Self::lock(&self.tasks)?.insert(
            task_id.clone(),
            Task {
                text: text.clone(),
                abort: abort.clone(),
            },
        );
        *Self::lock(&self.current)? = Some(task_id.clone());

        info!("Created replay task {}", task_id);
        self.server.broadcast(TaskEvent::TaskCreated {
            task_id: task_id.clone(),
        });
        self.spawn_turn(task_id.clone(), text, abort);
        Ok(task_id)
    }

    async fn resume_task(&self, task_id: &str) -> anyhow::Result<()> {
        let text = {
            let mut tasks = Self::lock(&self.tasks)?;
            let task = tasks
                .get_mut(task_id)
                .with_context(|| format!("unknown task `{task_id}`"))?;
            task.abort = AbortFlag::new();
            task.text.clone()
        };
        let abort = self.abort_flag(task_id)?;
        *Self::lock(&self.current)? = Some(task_id.to_string());
        self.spawn_turn(task_id.to_string(), text, abort);
        Ok(())
    }

    async fn cancel_task(&self, task_id: &str) -> anyhow::Result<()> {
        self.abort_flag(task_id)?.abort();
        info!("Cancelled replay task {}", task_id);
        Ok(())
    }

    async fn close_task(&self, task_id: &str) -> anyhow::Result<()> {
        let task = Self::lock(&self.tasks)?
            .remove(task_id)
            .with_context(|| format!("unknown task `{task_id}`"))?;
        task.abort.abort();

        let mut current = Self::lock(&self.current)?;
        if current.as_deref() == Some(task_id) {
            *current = None;
        }
        Ok(())
    }

    async fn send_message(&self, text: Option<String>, images: Vec<String>) -> anyhow::Result<()> {
        let Some(task_id) = Self::lock(&self.current)?.clone() else {
            bail!("no task is waiting for a reply");
        };
        info!(
            "Reply to {}: {:?} ({} images)",
            task_id,
            text.unwrap_or_default(),
            images.len()
        );
        self.server
            .broadcast(TaskEvent::TaskAskResponded { task_id });
        Ok(())
    }

    async fn get_configuration(&self) -> anyhow::Result<Map<String, Value>> {
        Ok(Self::lock(&self.configuration)?.clone())
    }

    async fn set_configuration(&self, values: Map<String, Value>) -> anyhow::Result<()> {
        Self::lock(&self.configuration)?.extend(values);
        Ok(())
    }
}

/// Split `text` into pieces of at most `chunk_chars` characters.
pub fn chunk_text(text: &str, chunk_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(chunk_chars.max(1))
        .map(|chunk| chunk.iter().collect())
        .collect()
}
