//! WebSocket protocol types for client-server communication.
//!
//! Every frame in either direction is a JSON envelope:
//! `{type, data?, session_id?, timestamp}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::engine::ResponseChunk;

/// Envelope `type` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    ChatMessage,
    Ping,
    Pong,
    SessionInfo,
    ChatResponseChunk,
    ChatResponse,
    ChatResponseComplete,
    ConnectionEstablished,
    Error,
}

/// Stable `error_type` values carried by error envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// The frame has no `type` field.
    MissingType,
    /// A chat message names no session.
    MissingSession,
    /// A chat message has no content.
    EmptyMessage,
    /// The `type` is not one the server accepts.
    UnknownType,
    /// The frame is not a JSON object.
    InvalidJson,
    /// The frame could not be read as text.
    InvalidMessage,
    /// Too many chat messages.
    RateLimited,
    /// The conversation engine failed.
    AgentError,
    /// The server failed.
    InternalError,
    /// The connection was idle too long.
    IdleTimeout,
}

impl ErrorType {
    /// Wire name of this error type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::MissingType => "missing_type",
            ErrorType::MissingSession => "missing_session",
            ErrorType::EmptyMessage => "empty_message",
            ErrorType::UnknownType => "unknown_type",
            ErrorType::InvalidJson => "invalid_json",
            ErrorType::InvalidMessage => "invalid_message",
            ErrorType::RateLimited => "rate_limited",
            ErrorType::AgentError => "agent_error",
            ErrorType::InternalError => "internal_error",
            ErrorType::IdleTimeout => "idle_timeout",
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Create an envelope stamped with the current time.
    pub fn new(kind: MessageType, data: Option<Value>, session_id: Option<String>) -> Self {
        Self {
            kind,
            data,
            session_id,
            timestamp: Utc::now(),
        }
    }

    /// Reply to a ping.
    pub fn pong() -> Self {
        Self::new(MessageType::Pong, None, None)
    }

    /// First frame sent on every new connection.
    pub fn connection_established(connection_id: impl std::fmt::Display, session_id: &str) -> Self {
        Self::new(
            MessageType::ConnectionEstablished,
            Some(json!({
                "connection_id": connection_id.to_string(),
                "session_id": session_id,
            })),
            Some(session_id.to_string()),
        )
    }

    /// Create an error frame.
    pub fn error(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self::new(
            MessageType::Error,
            Some(json!({
                "error_type": error_type,
                "error_message": message.into(),
            })),
            None,
        )
    }

    /// Session metadata reply.
    pub fn session_info(session_id: &str, data: Value) -> Self {
        Self::new(
            MessageType::SessionInfo,
            Some(data),
            Some(session_id.to_string()),
        )
    }

    /// One streamed piece of a reply.
    pub fn chat_response_chunk(session_id: &str, chunk: &ResponseChunk) -> Self {
        Self::new(
            MessageType::ChatResponseChunk,
            Some(json!({
                "content": chunk.response_text,
                "agent_type": chunk.agent_type,
                "confidence": chunk.confidence,
                "processing_time": chunk.processing_time,
                "metadata": chunk.metadata,
            })),
            Some(session_id.to_string()),
        )
    }

    /// The assembled reply.
    pub fn chat_response(session_id: &str, content: &str, metadata: &Map<String, Value>) -> Self {
        Self::new(
            MessageType::ChatResponse,
            Some(json!({
                "content": content,
                "metadata": metadata,
            })),
            Some(session_id.to_string()),
        )
    }

    /// Marks the end of a reply.
    pub fn chat_response_complete(session_id: &str) -> Self {
        Self::new(
            MessageType::ChatResponseComplete,
            None,
            Some(session_id.to_string()),
        )
    }

    /// The `error_type` of an error frame.
    pub fn error_type(&self) -> Option<ErrorType> {
        if self.kind != MessageType::Error {
            return None;
        }
        self.data
            .as_ref()
            .and_then(|data| data.get("error_type"))
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }
}

/// A chat message that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub session_id: String,
    pub content: String,
    pub user_id: Option<String>,
}

/// A validated inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    Ping,
    SessionInfo { session_id: String },
    Chat(ChatRequest),
}

/// An inbound frame that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error_type}: {message}")]
pub struct ValidationError {
    pub error_type: ErrorType,
    pub message: String,
}

impl ValidationError {
    fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }

    /// The error frame reporting this failure.
    pub fn to_envelope(&self) -> Envelope {
        Envelope::error(self.error_type, self.message.clone())
    }
}

/// Non-blank string field.
fn text_field<'a>(object: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    object
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

/// Read a field from `data`, falling back to the top level of the frame.
fn data_or_top<'a>(
    frame: &'a Map<String, Value>,
    data: Option<&'a Map<String, Value>>,
    name: &str,
) -> Option<&'a str> {
    data.and_then(|d| text_field(d, name))
        .or_else(|| text_field(frame, name))
}

/// Validate a raw inbound frame.
///
/// `session_id` is taken from the top level, then `data.session_id`. Only
/// `session_info` falls back to `default_session` (the connection's own
/// session); a chat message must name its session.
pub fn parse_request(
    raw: &str,
    default_session: Option<&str>,
) -> Result<ClientRequest, ValidationError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|_| ValidationError::new(ErrorType::InvalidJson, "Message is not valid JSON"))?;
    let Value::Object(frame) = value else {
        return Err(ValidationError::new(
            ErrorType::InvalidJson,
            "Message must be a JSON object",
        ));
    };

    let Some(kind) = frame.get("type").and_then(Value::as_str) else {
        return Err(ValidationError::new(
            ErrorType::MissingType,
            "Message type is required",
        ));
    };

    let data = frame.get("data").and_then(Value::as_object);
    let session_id = text_field(&frame, "session_id")
        .or_else(|| data.and_then(|d| text_field(d, "session_id")))
        .map(str::to_string);

    match kind {
        "ping" => Ok(ClientRequest::Ping),
        "session_info" => match session_id.or_else(|| {
            default_session
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string)
        }) {
            Some(session_id) => Ok(ClientRequest::SessionInfo { session_id }),
            None => Err(ValidationError::new(
                ErrorType::MissingSession,
                "Session ID is required",
            )),
        },
        "chat_message" => {
            let Some(session_id) = session_id else {
                return Err(ValidationError::new(
                    ErrorType::MissingSession,
                    "Session ID is required",
                ));
            };
            let Some(content) = data_or_top(&frame, data, "content") else {
                return Err(ValidationError::new(
                    ErrorType::EmptyMessage,
                    "Message content cannot be empty",
                ));
            };
            Ok(ClientRequest::Chat(ChatRequest {
                session_id,
                content: content.to_string(),
                user_id: data_or_top(&frame, data, "user_id").map(str::to_string),
            }))
        }
        other => Err(ValidationError::new(
            ErrorType::UnknownType,
            format!("Unknown message type: {other}"),
        )),
    }
}
