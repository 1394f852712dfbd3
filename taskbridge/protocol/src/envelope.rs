//! The outer envelope wrapping every message on the IPC channel.
//!
//! On the wire an envelope is a single JSON object:
//!
//! ```json
//! { "origin": "client", "type": "task_command", "clientId": "...", "data": { ... } }
//! ```
//!
//! Decoding validates every field before anything is trusted. Failures come back
//! as [`ProtocolError`] values, never as panics.

use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::ProtocolError;
use crate::task::{TaskCommand, TaskEvent};

/// Which side of the channel produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Client,
    Server,
}

/// The `type` tag of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Ack,
    TaskCommand,
    TaskEvent,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Ack => "ack",
            MessageKind::TaskCommand => "task_command",
            MessageKind::TaskEvent => "task_event",
        }
    }

    fn from_wire(tag: &str) -> Option<Self> {
        match tag {
            "ack" => Some(MessageKind::Ack),
            "task_command" => Some(MessageKind::TaskCommand),
            "task_event" => Some(MessageKind::TaskEvent),
            _ => None,
        }
    }

    /// Acks and events only flow server→client, commands only client→server.
    pub fn expected_origin(self) -> Origin {
        match self {
            MessageKind::Ack | MessageKind::TaskEvent => Origin::Server,
            MessageKind::TaskCommand => Origin::Client,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handshake acknowledgment, sent once by the server right after a client connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    /// Identifier the server assigned to this connection.
    pub client_id: String,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub ppid: u32,
}

/// Kind-specific payload of an envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Ack(Ack),
    TaskCommand(TaskCommand),
    TaskEvent(TaskEvent),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Ack(_) => MessageKind::Ack,
            Message::TaskCommand(_) => MessageKind::TaskCommand,
            Message::TaskEvent(_) => MessageKind::TaskEvent,
        }
    }
}

/// A validated wire message. Built once per send and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub origin: Origin,
    pub client_id: Option<String>,
    pub message: Message,
}

impl Envelope {
    pub fn ack(ack: Ack) -> Self {
        Self {
            origin: Origin::Server,
            client_id: Some(ack.client_id.clone()),
            message: Message::Ack(ack),
        }
    }

    pub fn task_command(client_id: impl Into<String>, command: TaskCommand) -> Self {
        Self {
            origin: Origin::Client,
            client_id: Some(client_id.into()),
            message: Message::TaskCommand(command),
        }
    }

    /// A server event; `client_id` names the recipient when the event is not a broadcast.
    pub fn task_event(client_id: Option<String>, event: TaskEvent) -> Self {
        Self {
            origin: Origin::Server,
            client_id,
            message: Message::TaskEvent(event),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    /// Serialize to a single-line JSON object. Framing is left to the transport.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Parse and validate one frame.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(frame).map_err(ProtocolError::MalformedJson)?;
        Self::from_value(value)
    }

    /// Validate an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut object) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        // Every required field must be present before any of them is judged
        let tag = take_field(&mut object, "type")?;
        let origin = take_field(&mut object, "origin")?;
        let data = take_field(&mut object, "data")?;

        let tag = match tag {
            Value::String(tag) => tag,
            other => {
                return Err(ProtocolError::InvalidField {
                    field: "type",
                    reason: format!("expected a string, got {other}"),
                });
            }
        };
        let kind = MessageKind::from_wire(&tag).ok_or(ProtocolError::UnknownMessageType(tag))?;

        let origin: Origin =
            serde_json::from_value(origin).map_err(|e| ProtocolError::InvalidField {
                field: "origin",
                reason: e.to_string(),
            })?;

        let client_id = match object.remove("clientId") {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) => Some(id),
            Some(other) => {
                return Err(ProtocolError::InvalidField {
                    field: "clientId",
                    reason: format!("expected a string, got {other}"),
                });
            }
        };

        let invalid = |source| ProtocolError::InvalidPayload { kind, source };
        let message = match kind {
            MessageKind::Ack => Message::Ack(serde_json::from_value(data).map_err(invalid)?),
            MessageKind::TaskCommand => {
                Message::TaskCommand(serde_json::from_value(data).map_err(invalid)?)
            }
            MessageKind::TaskEvent => {
                Message::TaskEvent(serde_json::from_value(data).map_err(invalid)?)
            }
        };

        if origin != kind.expected_origin() {
            return Err(ProtocolError::UnexpectedOrigin { kind, origin });
        }

        if kind == MessageKind::TaskCommand && client_id.is_none() {
            return Err(ProtocolError::MissingClientId);
        }

        Ok(Self {
            origin,
            client_id,
            message,
        })
    }
}

fn take_field(object: &mut Map<String, Value>, field: &'static str) -> Result<Value, ProtocolError> {
    object.remove(field).ok_or(ProtocolError::MissingField(field))
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = if self.client_id.is_some() { 4 } else { 3 };
        let mut state = serializer.serialize_struct("Envelope", len)?;
        state.serialize_field("origin", &self.origin)?;
        state.serialize_field("type", &self.kind())?;
        if let Some(client_id) = &self.client_id {
            state.serialize_field("clientId", client_id)?;
        }
        match &self.message {
            Message::Ack(ack) => state.serialize_field("data", ack)?,
            Message::TaskCommand(command) => state.serialize_field("data", command)?,
            Message::TaskEvent(event) => state.serialize_field("data", event)?,
        }
        state.end()
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Envelope::from_value(value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{MessageAction, MessageType, TaskMessage};
    use expect_test::expect;

    fn sample_envelopes() -> Vec<Envelope> {
        vec![
            Envelope::ack(Ack {
                client_id: "abc".to_string(),
                pid: 10,
                ppid: 1,
            }),
            Envelope::task_command(
                "abc",
                TaskCommand::StartNewTask {
                    text: "write a test".to_string(),
                    images: vec!["data:image/png;base64,AAAA".to_string()],
                    configuration: Some(
                        serde_json::json!({"mode": "code"})
                            .as_object()
                            .cloned()
                            .unwrap(),
                    ),
                    new_tab: true,
                },
            ),
            Envelope::task_command("abc", TaskCommand::GetConfiguration),
            Envelope::task_event(
                None,
                TaskEvent::Message {
                    task_id: "t1".to_string(),
                    action: MessageAction::Updated,
                    message: TaskMessage {
                        ts: 1,
                        kind: MessageType::Ask,
                        text: None,
                        partial: false,
                    },
                },
            ),
            Envelope::task_event(
                Some("abc".to_string()),
                TaskEvent::CommandRejected {
                    command: "resume_task".to_string(),
                    reason: "unknown task".to_string(),
                },
            ),
        ]
    }

    #[test]
    fn test_encode_then_decode_preserves_payload() {
        for envelope in sample_envelopes() {
            let frame = envelope.encode().unwrap();
            assert_eq!(Envelope::decode(&frame).unwrap(), envelope, "frame: {frame}");
        }
    }

    #[test]
    fn test_wire_shape() {
        let envelope = Envelope::task_command(
            "abc",
            TaskCommand::CancelTask {
                task_id: "t1".to_string(),
            },
        );
        expect![[r#"{"origin":"client","type":"task_command","clientId":"abc","data":{"commandName":"cancel_task","data":{"taskId":"t1"}}}"#]]
            .assert_eq(&envelope.encode().unwrap());

        let ack = Envelope::ack(Ack {
            client_id: "abc".to_string(),
            pid: 42,
            ppid: 7,
        });
        expect![[r#"{"origin":"server","type":"ack","clientId":"abc","data":{"clientId":"abc","pid":42,"ppid":7}}"#]]
            .assert_eq(&ack.encode().unwrap());
    }

    #[test]
    fn test_malformed_json_is_rejected() {
        let err = Envelope::decode("{\"origin\": \"client\",").unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedJson(_)), "{err:?}");
    }

    #[test]
    fn test_non_object_is_rejected() {
        let err = Envelope::decode("[1, 2, 3]").unwrap_err();
        assert!(matches!(err, ProtocolError::NotAnObject), "{err:?}");
    }

    #[test]
    fn test_unknown_type_is_a_distinct_error() {
        let err =
            Envelope::decode(r#"{"origin":"server","type":"telemetry","data":{}}"#).unwrap_err();
        match err {
            ProtocolError::UnknownMessageType(tag) => assert_eq!(tag, "telemetry"),
            other => panic!("expected UnknownMessageType, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_fields_are_rejected() {
        let err = Envelope::decode(r#"{"origin":"server","data":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField("type")), "{err:?}");

        let err = Envelope::decode(r#"{"type":"ack","data":{"clientId":"x"}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField("origin")), "{err:?}");

        let err = Envelope::decode(r#"{"origin":"server","type":"ack"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField("data")), "{err:?}");
    }

    #[test]
    fn test_missing_field_wins_over_unknown_type() {
        let err = Envelope::decode(r#"{"type":"bogus","data":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField("origin")), "{err:?}");

        let err = Envelope::decode(r#"{"type":"bogus","origin":"nobody"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField("data")), "{err:?}");

        // With everything present the tag is judged before the origin
        let err = Envelope::decode(r#"{"type":"bogus","origin":"nobody","data":{}}"#).unwrap_err();
        assert!(
            matches!(err, ProtocolError::UnknownMessageType(ref tag) if tag == "bogus"),
            "{err:?}"
        );
    }

    #[test]
    fn test_bad_payload_is_rejected() {
        let err = Envelope::decode(
            r#"{"origin":"client","type":"task_command","clientId":"abc","data":{"commandName":"format_disk"}}"#,
        )
        .unwrap_err();
        assert!(
            matches!(
                err,
                ProtocolError::InvalidPayload {
                    kind: MessageKind::TaskCommand,
                    ..
                }
            ),
            "{err:?}"
        );

        let err = Envelope::decode(r#"{"origin":"server","type":"ack","data":{"pid":1}}"#)
            .unwrap_err();
        assert!(
            matches!(
                err,
                ProtocolError::InvalidPayload {
                    kind: MessageKind::Ack,
                    ..
                }
            ),
            "{err:?}"
        );
    }

    #[test]
    fn test_origin_must_match_kind() {
        let err = Envelope::decode(
            r#"{"origin":"client","type":"ack","data":{"clientId":"abc"}}"#,
        )
        .unwrap_err();
        assert!(
            matches!(
                err,
                ProtocolError::UnexpectedOrigin {
                    kind: MessageKind::Ack,
                    origin: Origin::Client
                }
            ),
            "{err:?}"
        );

        let err =
            Envelope::decode(r#"{"origin":"robot","type":"ack","data":{"clientId":"abc"}}"#)
                .unwrap_err();
        assert!(
            matches!(err, ProtocolError::InvalidField { field: "origin", .. }),
            "{err:?}"
        );
    }

    #[test]
    fn test_task_command_requires_client_id() {
        let err = Envelope::decode(
            r#"{"origin":"client","type":"task_command","data":{"commandName":"get_configuration"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::MissingClientId), "{err:?}");

        let err = Envelope::decode(
            r#"{"origin":"client","type":"task_command","clientId":5,"data":{"commandName":"get_configuration"}}"#,
        )
        .unwrap_err();
        assert!(
            matches!(err, ProtocolError::InvalidField { field: "clientId", .. }),
            "{err:?}"
        );
    }

    #[test]
    fn test_garbage_never_panics() {
        let frames = [
            "",
            "null",
            "42",
            "\"ack\"",
            "{}",
            r#"{"type":null}"#,
            r#"{"type":"ack","origin":"server","data":null}"#,
            r#"{"type":"task_event","origin":"server","data":{"eventName":"message"}}"#,
            "{\"type\":\"task_event\"\u{0}}",
        ];
        for frame in frames {
            assert!(Envelope::decode(frame).is_err(), "accepted {frame:?}");
        }
    }

    #[test]
    fn test_serde_deserialize_delegates_to_validation() {
        let result: Result<Envelope, _> =
            serde_json::from_str(r#"{"origin":"server","type":"bogus","data":{}}"#);
        let err = result.unwrap_err();
        assert!(
            err.to_string().contains("unknown message type `bogus`"),
            "{err}"
        );
    }
}
