//! Task-scoped payloads carried inside `task_command` and `task_event` envelopes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A command issued by a controller to drive a task in the editor host.
///
/// Serialized adjacently tagged: `{"commandName": "cancel_task", "data": {"taskId": "..."}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "commandName",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum TaskCommand {
    /// Start a fresh task with an initial user message.
    StartNewTask {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        images: Vec<String>,
        /// Settings applied to the host before the task starts.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        configuration: Option<Map<String, Value>>,
        #[serde(default)]
        new_tab: bool,
    },
    ResumeTask {
        task_id: String,
    },
    CancelTask {
        task_id: String,
    },
    CloseTask {
        task_id: String,
    },
    /// Answer the task currently waiting on user input.
    SendMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        images: Vec<String>,
    },
    GetConfiguration,
    SetConfiguration {
        values: Map<String, Value>,
    },
}

impl TaskCommand {
    /// Wire name of the command, as it appears in `commandName`.
    pub fn name(&self) -> &'static str {
        match self {
            TaskCommand::StartNewTask { .. } => "start_new_task",
            TaskCommand::ResumeTask { .. } => "resume_task",
            TaskCommand::CancelTask { .. } => "cancel_task",
            TaskCommand::CloseTask { .. } => "close_task",
            TaskCommand::SendMessage { .. } => "send_message",
            TaskCommand::GetConfiguration => "get_configuration",
            TaskCommand::SetConfiguration { .. } => "set_configuration",
        }
    }
}

/// Whether a transcript message was newly created or replaces the previous partial one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageAction {
    Created,
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Output from the assistant.
    Say,
    /// A question waiting on the user.
    Ask,
}

/// One entry of the user-visible task transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    /// Milliseconds since the unix epoch; also identifies the message for updates.
    pub ts: u64,

    #[serde(rename = "type")]
    pub kind: MessageType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// True while the message is still streaming.
    #[serde(default)]
    pub partial: bool,
}

/// A task lifecycle notification or streamed transcript update sent by the server.
///
/// Serialized adjacently tagged: `{"eventName": "task_started", "payload": {"taskId": "..."}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "eventName",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum TaskEvent {
    TaskCreated {
        task_id: String,
    },
    TaskStarted {
        task_id: String,
    },
    Message {
        task_id: String,
        action: MessageAction,
        message: TaskMessage,
    },
    TaskModeSwitched {
        task_id: String,
        mode: String,
    },
    TaskAskResponded {
        task_id: String,
    },
    TaskPaused {
        task_id: String,
    },
    TaskUnpaused {
        task_id: String,
    },
    TaskSpawned {
        task_id: String,
        child_task_id: String,
    },
    TaskAborted {
        task_id: String,
    },
    TaskCompleted {
        task_id: String,
    },
    TaskToolFailed {
        task_id: String,
        tool_name: String,
        error: String,
    },
    /// Reply to [`TaskCommand::GetConfiguration`], sent only to the requesting client.
    Configuration {
        values: Map<String, Value>,
    },
    /// The host refused or failed to carry out a command.
    CommandRejected {
        command: String,
        reason: String,
    },
}

impl TaskEvent {
    /// Wire name of the event, as it appears in `eventName`.
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::TaskCreated { .. } => "task_created",
            TaskEvent::TaskStarted { .. } => "task_started",
            TaskEvent::Message { .. } => "message",
            TaskEvent::TaskModeSwitched { .. } => "task_mode_switched",
            TaskEvent::TaskAskResponded { .. } => "task_ask_responded",
            TaskEvent::TaskPaused { .. } => "task_paused",
            TaskEvent::TaskUnpaused { .. } => "task_unpaused",
            TaskEvent::TaskSpawned { .. } => "task_spawned",
            TaskEvent::TaskAborted { .. } => "task_aborted",
            TaskEvent::TaskCompleted { .. } => "task_completed",
            TaskEvent::TaskToolFailed { .. } => "task_tool_failed",
            TaskEvent::Configuration { .. } => "configuration",
            TaskEvent::CommandRejected { .. } => "command_rejected",
        }
    }

    /// The task this event concerns, if it is task-scoped.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            TaskEvent::TaskCreated { task_id }
            | TaskEvent::TaskStarted { task_id }
            | TaskEvent::Message { task_id, .. }
            | TaskEvent::TaskModeSwitched { task_id, .. }
            | TaskEvent::TaskAskResponded { task_id }
            | TaskEvent::TaskPaused { task_id }
            | TaskEvent::TaskUnpaused { task_id }
            | TaskEvent::TaskSpawned { task_id, .. }
            | TaskEvent::TaskAborted { task_id }
            | TaskEvent::TaskCompleted { task_id }
            | TaskEvent::TaskToolFailed { task_id, .. } => Some(task_id),
            TaskEvent::Configuration { .. } | TaskEvent::CommandRejected { .. } => None,
        }
    }
}
