//! Error taxonomy for the sync engines.

use crate::fs::FsError;
use crate::protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Sync is already active")]
    AlreadyActive,

    #[error("Sync is not active")]
    NotActive,

    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("File too large: {path} ({size} bytes, limit {limit})")]
    FileTooLarge { path: String, size: u64, limit: u64 },

    #[error("Not a UTF-8 text file: {0}")]
    NotText(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
