//! Wire protocol.
//!
//! Every frame is a JSON object `{"type": <TYPE>, "payload": {...}}`, with the
//! payload omitted for messages that carry none. Frames are size-checked
//! before they are parsed, and every `relativePath` that arrives over the
//! wire is validated before it reaches the filesystem.

pub mod message;
pub mod path;

pub use message::{ConnectedPayload, ErrorPayload, FilePayload, Message, PathPayload};
pub use path::normalize_relative_path;

use thiserror::Error;

/// Origin id recorded for content that arrived from the relay.
pub const RELAY_ORIGIN: &str = "relay";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Message too large: {size} bytes (limit {limit})")]
    Oversized { size: usize, limit: usize },

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Missing payload for {0}")]
    MissingPayload(String),

    #[error("Invalid relative path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },
}

/// Parse one inbound frame, rejecting it unread if it exceeds `max_size`.
pub fn decode(bytes: &[u8], max_size: usize) -> Result<Message, ProtocolError> {
    if bytes.len() > max_size {
        return Err(ProtocolError::Oversized {
            size: bytes.len(),
            limit: max_size,
        });
    }
    Message::from_json(bytes)
}
