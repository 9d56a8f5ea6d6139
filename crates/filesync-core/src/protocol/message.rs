//! Typed protocol messages.

use super::ProtocolError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Full content of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePayload {
    pub relative_path: String,
    pub file_content: String,
    /// Relay-side version, present on relay broadcasts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathPayload {
    pub relative_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedPayload {
    pub client_id: String,
    pub file_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Every message either side can send.
///
/// Wire format: `{"type":"SYNC_FILE","payload":{"relativePath":"a.txt","fileContent":"x"}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    // peer -> relay
    SyncFile(FilePayload),
    DeleteFile(PathPayload),
    ClearFolder,

    // relay -> sender
    FileSynced(PathPayload),
    FileDeletedConfirmed(PathPayload),
    FolderClearedConfirmed,
    Connected(ConnectedPayload),

    // relay -> other peers
    FileUpdated(FilePayload),
    FileCreated(FilePayload),
    FileChanged(FilePayload),
    FileDeleted(PathPayload),
    FolderCleared,

    // either direction
    Ping,
    Pong,
    Error(ErrorPayload),
}

/// Untyped frame, validated into a [`Message`] by [`Message::from_json`].
#[derive(Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Option<serde_json::Value>,
}

impl Message {
    pub fn sync_file(relative_path: impl Into<String>, file_content: impl Into<String>) -> Self {
        Message::SyncFile(FilePayload {
            relative_path: relative_path.into(),
            file_content: file_content.into(),
            version: None,
        })
    }

    pub fn delete_file(relative_path: impl Into<String>) -> Self {
        Message::DeleteFile(PathPayload {
            relative_path: relative_path.into(),
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Message::Error(ErrorPayload {
            message: message.into(),
        })
    }

    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::SyncFile(_) => "SYNC_FILE",
            Message::DeleteFile(_) => "DELETE_FILE",
            Message::ClearFolder => "CLEAR_FOLDER",
            Message::FileSynced(_) => "FILE_SYNCED",
            Message::FileDeletedConfirmed(_) => "FILE_DELETED_CONFIRMED",
            Message::FolderClearedConfirmed => "FOLDER_CLEARED_CONFIRMED",
            Message::Connected(_) => "CONNECTED",
            Message::FileUpdated(_) => "FILE_UPDATED",
            Message::FileCreated(_) => "FILE_CREATED",
            Message::FileChanged(_) => "FILE_CHANGED",
            Message::FileDeleted(_) => "FILE_DELETED",
            Message::FolderCleared => "FOLDER_CLEARED",
            Message::Ping => "PING",
            Message::Pong => "PONG",
            Message::Error(_) => "ERROR",
        }
    }

    /// Path the message refers to, if any.
    pub fn relative_path(&self) -> Option<&str> {
        match self {
            Message::SyncFile(p)
            | Message::FileUpdated(p)
            | Message::FileCreated(p)
            | Message::FileChanged(p) => Some(&p.relative_path),
            Message::DeleteFile(p)
            | Message::FileSynced(p)
            | Message::FileDeletedConfirmed(p)
            | Message::FileDeleted(p) => Some(&p.relative_path),
            _ => None,
        }
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("Message serialization should not fail")
    }

    /// Parse and validate a JSON frame. No size check; see [`super::decode`].
    pub fn from_json(data: &[u8]) -> Result<Self, ProtocolError> {
        let frame: Frame =
            serde_json::from_slice(data).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let Frame { kind, payload } = frame;

        let message = match kind.as_str() {
            "SYNC_FILE" => Message::SyncFile(parse_payload(&kind, payload)?),
            "DELETE_FILE" => Message::DeleteFile(parse_payload(&kind, payload)?),
            "CLEAR_FOLDER" => Message::ClearFolder,
            "FILE_SYNCED" => Message::FileSynced(parse_payload(&kind, payload)?),
            "FILE_DELETED_CONFIRMED" => Message::FileDeletedConfirmed(parse_payload(&kind, payload)?),
            "FOLDER_CLEARED_CONFIRMED" => Message::FolderClearedConfirmed,
            "CONNECTED" => Message::Connected(parse_payload(&kind, payload)?),
            "FILE_UPDATED" => Message::FileUpdated(parse_payload(&kind, payload)?),
            "FILE_CREATED" => Message::FileCreated(parse_payload(&kind, payload)?),
            "FILE_CHANGED" => Message::FileChanged(parse_payload(&kind, payload)?),
            "FILE_DELETED" => Message::FileDeleted(parse_payload(&kind, payload)?),
            "FOLDER_CLEARED" => Message::FolderCleared,
            "PING" => Message::Ping,
            "PONG" => Message::Pong,
            "ERROR" => Message::Error(parse_payload(&kind, payload)?),
            _ => return Err(ProtocolError::UnknownType(kind)),
        };
        Ok(message)
    }
}

fn parse_payload<T: DeserializeOwned>(
    kind: &str,
    payload: Option<serde_json::Value>,
) -> Result<T, ProtocolError> {
    let value = payload.ok_or_else(|| ProtocolError::MissingPayload(kind.to_string()))?;
    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(format!("{kind}: {e}")))
}
