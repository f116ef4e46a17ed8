/// Wire definitions shared by the connection and history layers
use crate::error::{ChatError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a chat room; stable for the room's lifetime
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Message identity. Two messages with the same id are the same message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Text,
    Image,
}

/// A chat message, whether pushed live or loaded from history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub session_id: SessionId,
    #[serde(alias = "userId")]
    pub author_id: String,
    #[serde(default, alias = "type")]
    pub content_type: ContentType,
    pub content: String,
    #[serde(alias = "createdAt")]
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// Total order used by the transcript: timestamp first, id breaks ties
    pub fn order_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.timestamp, self.id.clone())
    }
}

fn default_true() -> bool {
    true
}

/// A decoded server-to-client frame
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEnvelope {
    #[serde(alias = "auth_success")]
    AuthAck {
        #[serde(default = "default_true")]
        success: bool,
        #[serde(default)]
        reason: Option<String>,
    },
    Message(ChatMessage),
    Error {
        #[serde(default, alias = "error", alias = "message")]
        reason: String,
    },
    #[serde(alias = "history")]
    HistoryBatch {
        messages: Vec<ChatMessage>,
        #[serde(default, alias = "hasMore")]
        has_more: Option<bool>,
    },
}

/// Untagged error frame some servers send in place of an auth ack
#[derive(Deserialize)]
struct BareError {
    error: String,
}

impl InboundEnvelope {
    /// Decode a raw text frame
    pub fn decode(text: &str) -> Result<Self> {
        match serde_json::from_str::<InboundEnvelope>(text) {
            Ok(envelope) => Ok(envelope),
            Err(e) => match serde_json::from_str::<BareError>(text) {
                Ok(bare) => Ok(InboundEnvelope::Error { reason: bare.error }),
                Err(_) => Err(ChatError::MalformedFrame(e.to_string())),
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundEnvelope::AuthAck { .. } => "auth_ack",
            InboundEnvelope::Message(_) => "message",
            InboundEnvelope::Error { .. } => "error",
            InboundEnvelope::HistoryBatch { .. } => "history_batch",
        }
    }
}

impl fmt::Display for InboundEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Envelope({})", self.kind())
    }
}

/// Content a caller wants to post into a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub content_type: ContentType,
    pub content: String,
}

impl OutgoingMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content_type: ContentType::Text,
            content: content.into(),
        }
    }

    pub fn image(url: impl Into<String>) -> Self {
        Self {
            content_type: ContentType::Image,
            content: url.into(),
        }
    }
}

/// A client-to-server frame. The session id is implied by the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth {
        token: String,
    },
    Message {
        #[serde(rename = "contentType")]
        content_type: ContentType,
        content: String,
    },
}

impl ClientFrame {
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(ChatError::Serialization)
    }
}

impl From<OutgoingMessage> for ClientFrame {
    fn from(msg: OutgoingMessage) -> Self {
        ClientFrame::Message {
            content_type: msg.content_type,
            content: msg.content,
        }
    }
}
