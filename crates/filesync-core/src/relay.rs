//! Relay-side sync engine and broadcast routing.
//!
//! `RelayEngine` never talks to sockets. Each handler returns a list of
//! [`Envelope`]s and the server delivers them, resolving [`Target`]s against
//! the connections that are open at delivery time.

use crate::error::SyncError;
use crate::fs::FileSystem;
use crate::logging::Logger;
use crate::protocol::{
    self, ConnectedPayload, FilePayload, Message, PathPayload, ProtocolError,
    normalize_relative_path,
};
use crate::replica::{LocalEvent, LocalIntent, Replica};

/// Recipients of one outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Only this connection
    Peer(String),
    /// Every open connection except the origin
    AllExcept(String),
    /// Every open connection
    All,
}

impl Target {
    pub fn includes(&self, conn_id: &str) -> bool {
        match self {
            Target::Peer(id) => id == conn_id,
            Target::AllExcept(id) => id != conn_id,
            Target::All => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub target: Target,
    pub message: Message,
}

impl Envelope {
    pub fn to_peer(conn_id: &str, message: Message) -> Self {
        Self {
            target: Target::Peer(conn_id.to_string()),
            message,
        }
    }

    pub fn to_others(origin: &str, message: Message) -> Self {
        Self {
            target: Target::AllExcept(origin.to_string()),
            message,
        }
    }

    pub fn to_all(message: Message) -> Self {
        Self {
            target: Target::All,
            message,
        }
    }
}

pub struct RelayEngine<F> {
    replica: Replica<F>,
    log: Logger,
}

impl<F: FileSystem> RelayEngine<F> {
    pub fn new(replica: Replica<F>, log: Logger) -> Self {
        Self { replica, log }
    }

    pub fn replica(&self) -> &Replica<F> {
        &self.replica
    }

    pub fn file_count(&self) -> usize {
        self.replica.index().len()
    }

    pub fn conflict_count(&self) -> u64 {
        self.replica.conflict_count()
    }

    /// Welcome message for a freshly accepted connection.
    pub fn on_connect(&self, conn_id: &str) -> Envelope {
        self.log.connection(format!("Client connected: {}", conn_id));
        Envelope::to_peer(
            conn_id,
            Message::Connected(ConnectedPayload {
                client_id: conn_id.to_string(),
                file_count: self.file_count(),
            }),
        )
    }

    pub fn on_disconnect(&self, conn_id: &str) {
        self.log
            .connection(format!("Client disconnected: {}", conn_id));
    }

    /// Handle one raw frame from `from`.
    pub async fn handle_frame(&mut self, from: &str, bytes: &[u8]) -> Vec<Envelope> {
        match protocol::decode(bytes, self.replica.limits().max_payload_size) {
            Ok(message) => self.handle_message(from, message).await,
            Err(e) => vec![self.reject_frame(from, e)],
        }
    }

    /// Reply for a frame that could not be accepted.
    pub fn reject_frame(&self, from: &str, error: ProtocolError) -> Envelope {
        self.log
            .warn(format!("Rejected message from {}: {}", from, error));
        let reply = match error {
            ProtocolError::Oversized { .. } => "Message too large".to_string(),
            other => format!("Invalid message: {}", other),
        };
        Envelope::to_peer(from, Message::error(reply))
    }

    pub async fn handle_message(&mut self, from: &str, message: Message) -> Vec<Envelope> {
        self.log
            .debug(format!("Received {} from {}", message.kind(), from));

        match message {
            Message::SyncFile(file) => self.sync_file(from, file).await,
            Message::DeleteFile(target) => self.delete_file(from, target).await,
            Message::ClearFolder => self.clear_folder(from).await,
            Message::Ping => vec![Envelope::to_peer(from, Message::Pong)],
            Message::Pong => Vec::new(),
            other => {
                self.log
                    .warn(format!("Unexpected {} from {}", other.kind(), from));
                vec![Envelope::to_peer(
                    from,
                    Message::error(format!("Unexpected message type: {}", other.kind())),
                )]
            }
        }
    }

    async fn sync_file(&mut self, from: &str, file: FilePayload) -> Vec<Envelope> {
        let path = match normalize_relative_path(&file.relative_path) {
            Ok(path) => path,
            Err(e) => return vec![self.reject_frame(from, e)],
        };

        match self.replica.apply_write(&path, &file.file_content, from).await {
            Ok(outcome) => {
                self.log
                    .sync(format!("File synced from {}: {}", from, path));
                vec![
                    Envelope::to_others(
                        from,
                        Message::FileUpdated(FilePayload {
                            relative_path: path.clone(),
                            file_content: file.file_content,
                            version: Some(outcome.version),
                        }),
                    ),
                    Envelope::to_peer(
                        from,
                        Message::FileSynced(PathPayload {
                            relative_path: path,
                        }),
                    ),
                ]
            }
            Err(e @ SyncError::FileTooLarge { .. }) => {
                self.log.warn(format!("Rejected from {}: {}", from, e));
                vec![Envelope::to_peer(from, Message::error(e.to_string()))]
            }
            Err(e) => {
                self.log
                    .error(format!("Error handling file sync from {}: {}", from, e));
                vec![Envelope::to_peer(from, Message::error("Failed to sync file"))]
            }
        }
    }

    async fn delete_file(&mut self, from: &str, target: PathPayload) -> Vec<Envelope> {
        let path = match normalize_relative_path(&target.relative_path) {
            Ok(path) => path,
            Err(e) => return vec![self.reject_frame(from, e)],
        };

        match self.replica.apply_delete(&path).await {
            Ok(existed) => {
                if existed {
                    self.log
                        .sync(format!("File deleted by {}: {}", from, path));
                } else {
                    self.log
                        .debug(format!("Delete of absent file from {}: {}", from, path));
                }
                vec![
                    Envelope::to_others(
                        from,
                        Message::FileDeleted(PathPayload {
                            relative_path: path.clone(),
                        }),
                    ),
                    Envelope::to_peer(
                        from,
                        Message::FileDeletedConfirmed(PathPayload {
                            relative_path: path,
                        }),
                    ),
                ]
            }
            Err(e) => {
                self.log
                    .error(format!("Error handling file delete from {}: {}", from, e));
                vec![Envelope::to_peer(from, Message::error("Failed to delete file"))]
            }
        }
    }

    async fn clear_folder(&mut self, from: &str) -> Vec<Envelope> {
        match self.replica.clear().await {
            Ok(()) => {
                self.log.info(format!("Folder cleared by {}", from));
                vec![
                    Envelope::to_others(from, Message::FolderCleared),
                    Envelope::to_peer(from, Message::FolderClearedConfirmed),
                ]
            }
            Err(e) => {
                self.log
                    .error(format!("Error handling clear folder from {}: {}", from, e));
                vec![Envelope::to_peer(from, Message::error("Failed to clear folder"))]
            }
        }
    }

    /// Broadcast a change made directly in the relay's own folder.
    pub async fn on_local_event(&mut self, event: LocalEvent) -> Option<Envelope> {
        let message = match self.replica.observe(event).await? {
            LocalIntent::Created {
                path,
                content,
                version,
            } => Message::FileCreated(FilePayload {
                relative_path: path,
                file_content: content,
                version: Some(version),
            }),
            LocalIntent::Changed {
                path,
                content,
                version,
            } => Message::FileChanged(FilePayload {
                relative_path: path,
                file_content: content,
                version: Some(version),
            }),
            LocalIntent::Deleted { path } => Message::FileDeleted(PathPayload { relative_path: path }),
        };
        self.log.sync(format!(
            "Local change broadcast: {} {}",
            message.kind(),
            message.relative_path().unwrap_or_default()
        ));
        Some(Envelope::to_all(message))
    }
}
