//! `graphql-ws` message envelope and client message decoding.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::ProtocolError;

/// WebSocket subprotocol negotiated on upgrade.
pub const PROTOCOL: &str = "graphql-ws";

/// Close code: normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code: unsupported data / protocol violation.
pub const CLOSE_PROTOCOL_VIOLATION: u16 = 1003;
/// Close code: abnormal closure without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Close code: internal server error.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Discriminator for protocol messages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Client → Server: open the session, optionally with credentials.
    ConnectionInit,
    /// Server → Client: session accepted.
    ConnectionAck,
    /// Server → Client: session rejected or frame undecodable.
    ConnectionError,
    /// Client → Server: end the session.
    ConnectionTerminate,
    /// Client → Server: start an operation.
    Start,
    /// Server → Client: one operation result.
    Data,
    /// Server → Client: operation-scoped error.
    Error,
    /// Server → Client: operation finished.
    Complete,
    /// Client → Server: stop an operation.
    Stop,
    /// Server → Client: keep-alive.
    #[serde(rename = "ka")]
    KeepAlive,
}

/// Top-level protocol message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationMessage {
    /// Message type discriminator.
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    /// Operation id, for operation-scoped messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Variant-specific payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl OperationMessage {
    /// Builds a message without id or payload.
    #[must_use]
    pub const fn bare(msg_type: MessageType) -> Self {
        Self {
            msg_type,
            id: None,
            payload: None,
        }
    }

    /// `connection_ack`.
    #[must_use]
    pub const fn connection_ack() -> Self {
        Self::bare(MessageType::ConnectionAck)
    }

    /// `ka`.
    #[must_use]
    pub const fn keep_alive() -> Self {
        Self::bare(MessageType::KeepAlive)
    }

    /// `connection_error` carrying `{message}`.
    #[must_use]
    pub fn connection_error(message: impl Into<String>) -> Self {
        Self {
            msg_type: MessageType::ConnectionError,
            id: None,
            payload: Some(json!({ "message": message.into() })),
        }
    }

    /// `data` for operation `id`.
    #[must_use]
    pub fn data(id: impl Into<String>, payload: Value) -> Self {
        Self {
            msg_type: MessageType::Data,
            id: Some(id.into()),
            payload: Some(payload),
        }
    }

    /// `error` for operation `id` (or for the connection when `id` is
    /// absent).
    #[must_use]
    pub fn error(id: Option<String>, payload: Value) -> Self {
        Self {
            msg_type: MessageType::Error,
            id,
            payload: Some(payload),
        }
    }

    /// `complete` for operation `id`.
    #[must_use]
    pub fn complete(id: impl Into<String>) -> Self {
        Self {
            msg_type: MessageType::Complete,
            id: Some(id.into()),
            payload: None,
        }
    }
}

/// Payload of a `start` message.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StartPayload {
    /// Query document source.
    pub query: String,
    /// Variable values.
    #[serde(default)]
    pub variables: Option<Map<String, Value>>,
    /// Operation to run when the document holds several.
    #[serde(default, rename = "operationName")]
    pub operation_name: Option<String>,
}

/// A decoded client → server message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `connection_init`.
    ConnectionInit {
        /// Credentials or other connection parameters.
        payload: Option<Value>,
    },
    /// `start`.
    Start {
        /// Operation id.
        id: String,
        /// Query, variables and operation name.
        payload: StartPayload,
    },
    /// `stop`.
    Stop {
        /// Operation id.
        id: String,
    },
    /// `connection_terminate`.
    ConnectionTerminate,
    /// A well-formed envelope that cannot be acted on: unknown or
    /// server-only type, missing id, or invalid `start` payload.
    Invalid {
        /// Operation id, when the envelope carried one.
        id: Option<String>,
        /// Reason reported back to the client.
        reason: String,
    },
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    payload: Option<Value>,
}

impl ClientMessage {
    /// Decodes one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] if the text is not a JSON object
    /// with a string `type`.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawMessage =
            serde_json::from_str(text).map_err(|err| ProtocolError::Malformed(err.to_string()))?;
        // Clients commonly send numeric ids.
        let id = match raw.id {
            Some(Value::String(id)) => Some(id),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        let message = match raw.msg_type.as_str() {
            "connection_init" => Self::ConnectionInit {
                payload: raw.payload,
            },
            "connection_terminate" => Self::ConnectionTerminate,
            "start" => {
                let Some(id) = id else {
                    return Ok(Self::invalid(None, "start requires an operation id"));
                };
                let payload = raw.payload.unwrap_or(Value::Null);
                match serde_json::from_value::<StartPayload>(payload) {
                    Ok(payload) => Self::Start { id, payload },
                    Err(err) => Self::invalid(Some(id), format!("invalid start payload: {err}")),
                }
            }
            "stop" => match id {
                Some(id) => Self::Stop { id },
                None => Self::invalid(None, "stop requires an operation id"),
            },
            _ => Self::invalid(id, "Invalid message type!"),
        };
        Ok(message)
    }

    fn invalid(id: Option<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            id,
            reason: reason.into(),
        }
    }
}
