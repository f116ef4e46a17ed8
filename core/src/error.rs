/// Error types for the chat client layer
use crate::protocol::SessionId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    /// Network-level failure; always retryable per the backoff policy
    #[error("Transport error: {0}")]
    Transport(String),

    /// Server refused the credential; a fresh token is required
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Rate limited: history request inside cooldown window")]
    RateLimited,

    #[error("Session {0} is not connected")]
    NotConnected(SessionId),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("History error: {0}")]
    History(String),

    #[error("Token error: {0}")]
    Token(String),
}

impl ChatError {
    /// Whether the socket driver may retry after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChatError::Transport(_) | ChatError::Timeout(_))
    }
}

/// Variants wrapping foreign errors are rebuilt from their kind and message
impl Clone for ChatError {
    fn clone(&self) -> Self {
        match self {
            ChatError::Transport(s) => ChatError::Transport(s.clone()),
            ChatError::AuthRejected(s) => ChatError::AuthRejected(s.clone()),
            ChatError::RateLimited => ChatError::RateLimited,
            ChatError::NotConnected(session) => ChatError::NotConnected(session.clone()),
            ChatError::MalformedFrame(s) => ChatError::MalformedFrame(s.clone()),
            ChatError::Io(e) => ChatError::Io(std::io::Error::new(e.kind(), e.to_string())),
            ChatError::Serialization(e) => {
                ChatError::Serialization(serde::de::Error::custom(e.to_string()))
            }
            ChatError::Config(s) => ChatError::Config(s.clone()),
            ChatError::Timeout(s) => ChatError::Timeout(s.clone()),
            ChatError::History(s) => ChatError::History(s.clone()),
            ChatError::Token(s) => ChatError::Token(s.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
