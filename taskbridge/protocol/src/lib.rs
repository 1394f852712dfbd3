//! Taskbridge wire protocol
//!
//! Defines the envelope exchanged between the IPC server embedded in the editor
//! host and the controller processes that drive tasks through it. Every frame is
//! validated here before any other layer looks at it.

mod envelope;
mod task;

pub use envelope::{Ack, Envelope, Message, MessageKind, Origin};
pub use task::{MessageAction, MessageType, TaskCommand, TaskEvent, TaskMessage};

use thiserror::Error;

/// Reasons a frame is rejected. Callers log these and drop the frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    MalformedJson(#[source] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("unknown message type `{0}`")]
    UnknownMessageType(String),

    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("{kind} message cannot originate from the {origin:?} side")]
    UnexpectedOrigin { kind: MessageKind, origin: Origin },

    #[error("task_command without a clientId")]
    MissingClientId,

    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}
