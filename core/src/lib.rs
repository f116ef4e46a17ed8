/// ChatLink - real-time chat client core
///
/// Per-session authenticated connections with automatic recovery, and a
/// history engine that pages older messages in while keeping the reader's
/// place.

pub mod auth;
pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod history;
pub mod http;
pub mod protocol;

pub use client::ChatClient;
pub use config::Config;
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{ChatError, Result};
pub use events::{FailureReason, SessionEvent};
pub use protocol::{ChatMessage, MessageId, OutgoingMessage, SessionId};
