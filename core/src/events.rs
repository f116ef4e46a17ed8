/// Events fanned out to per-session handlers
use crate::connection::ConnectionState;
use crate::protocol::ChatMessage;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Why a session stopped trying to connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Server refused the credential; a fresh token and an explicit reconnect are required
    AuthRejected { reason: String },
    /// Reconnect cap reached
    RetriesExhausted { attempts: u32 },
    /// Connecting failed in a way retrying cannot fix (bad url, unusable token answer)
    Unrecoverable { reason: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::AuthRejected { reason } => write!(f, "authentication rejected: {}", reason),
            FailureReason::RetriesExhausted { attempts } => {
                write!(f, "disconnected after {} reconnect attempts", attempts)
            }
            FailureReason::Unrecoverable { reason } => write!(f, "cannot connect: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A live message arrived
    Message { message: ChatMessage },
    /// The server pushed a batch of history
    History {
        messages: Vec<ChatMessage>,
        has_more: Option<bool>,
    },
    /// The socket moved to a new lifecycle state
    StateChanged { state: ConnectionState },
    /// Terminal: the session will not reconnect on its own
    Failed { reason: FailureReason },
}

pub type EventHandler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;
