//! Core types for the chat relay.

use serde::{Deserialize, Serialize};

/// Maximum number of messages held in the history cache.
pub const HISTORY_CAPACITY: usize = 100;

/// Maximum accepted message length, in characters.
pub const MAX_TEXT_LEN: usize = 500;

/// Durable retention window in seconds (one week).
pub const RETENTION_SECONDS: u64 = 604_800;

/// A chat message accepted by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Server-assigned sequence number, strictly increasing for the
    /// lifetime of the relay. Doubles as the dedup key for consumers.
    pub seq: u64,
    /// Sender-supplied display name. Untrusted.
    pub username: String,
    /// Message body, trimmed, at most [`MAX_TEXT_LEN`] characters.
    pub text: String,
    /// Milliseconds since epoch, assigned once at ingestion. Never
    /// decreases in `seq` order.
    pub timestamp: i64,
}

/// One submission attempt from a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub username: String,
    pub text: String,
}

/// Events sent from the server to a connected client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Full history snapshot, sent once immediately after connect.
    LoadMessages(Vec<ChatMessage>),
    /// One broadcast message, delivered to every subscriber including
    /// the sender.
    ChatMessage(ChatMessage),
    /// Validation failure, delivered only to the submitting client.
    Rejected { reason: String },
}

/// Events sent from a client to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    ChatMessage(Submission),
}

/// Relay configuration options.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on (0 for auto-assign).
    pub port: u16,
    /// SQLite database URL. `None` runs memory-only.
    pub database_url: Option<String>,
    /// History cache capacity.
    pub history_capacity: usize,
    /// Maximum message length in characters.
    pub max_text_len: usize,
    /// Durable retention window in seconds.
    pub retention_seconds: u64,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            database_url: None,
            history_capacity: HISTORY_CAPACITY,
            max_text_len: MAX_TEXT_LEN,
            retention_seconds: RETENTION_SECONDS,
        }
    }
}
