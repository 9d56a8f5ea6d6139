//! Client-side sync engine.
//!
//! `PeerEngine` is transport-agnostic: the session driver feeds it transport
//! signals, inbound frames and watcher events, and sends whatever messages
//! it returns. All disk effects go through the [`Replica`].

use crate::error::{Result, SyncError};
use crate::events::SyncEvent;
use crate::fs::FileSystem;
use crate::logging::Logger;
use crate::protocol::{self, FilePayload, Message, RELAY_ORIGIN, normalize_relative_path};
use crate::replica::{LocalEvent, LocalIntent, Replica};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Stopping,
}

/// What the driver should do after an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Nothing,
    /// Publish on the event bus
    Event(SyncEvent),
    /// Send back to the relay
    Reply(Message),
    /// The relay acknowledged our folder clear
    ClearConfirmed,
}

pub struct PeerEngine<F> {
    replica: Replica<F>,
    state: SessionState,
    log: Logger,
}

impl<F: FileSystem> PeerEngine<F> {
    pub fn new(replica: Replica<F>, log: Logger) -> Self {
        Self {
            replica,
            state: SessionState::Idle,
            log,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn replica(&self) -> &Replica<F> {
        &self.replica
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Active | SessionState::Stopping)
    }

    /// `Idle -> Connecting`.
    pub fn begin_start(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(SyncError::AlreadyActive);
        }
        self.state = SessionState::Connecting;
        Ok(())
    }

    /// The first connection attempt failed: back to `Idle`.
    pub fn connect_failed(&mut self) {
        if self.state == SessionState::Connecting {
            self.state = SessionState::Idle;
        }
    }

    /// `Connecting -> Active`. Returns the initial sync batch.
    ///
    /// Files over the size ceiling, unreadable files and non-UTF-8 files are
    /// skipped with a warning.
    pub async fn on_open(&mut self) -> Result<Vec<Message>> {
        if self.state != SessionState::Connecting {
            return Err(SyncError::NotActive);
        }
        self.state = SessionState::Active;

        let paths = self.replica.scan().await;
        let mut batch = Vec::with_capacity(paths.len());
        for path in paths {
            match self.replica.read_text(&path).await {
                Ok(content) => {
                    self.replica.record_sent(&path, &content);
                    batch.push(Message::sync_file(path, content));
                }
                Err(e @ SyncError::FileTooLarge { .. }) => {
                    self.log.warn(format!("Skipping: {}", e));
                }
                Err(e) => {
                    self.log.warn(format!("Skipping {}: {}", path, e));
                }
            }
        }

        self.log
            .info(format!("Initial sync: sending {} files", batch.len()));
        Ok(batch)
    }

    /// `Active -> Stopping`. Returns the clear request to send, if any.
    pub fn begin_stop(&mut self, connected: bool, clear_remote: bool) -> Result<Option<Message>> {
        match self.state {
            SessionState::Idle => return Err(SyncError::NotActive),
            SessionState::Stopping => return Ok(None),
            SessionState::Connecting | SessionState::Active => {}
        }
        self.state = SessionState::Stopping;
        Ok((connected && clear_remote).then_some(Message::ClearFolder))
    }

    /// `Stopping -> Idle`.
    pub fn finish_stop(&mut self) {
        self.state = SessionState::Idle;
    }

    /// Apply one inbound frame.
    pub async fn on_frame(&mut self, bytes: &[u8]) -> Inbound {
        match protocol::decode(bytes, self.replica.limits().max_payload_size) {
            Ok(message) => self.on_message(message).await,
            Err(e) => {
                self.log.warn(format!("Dropping invalid message: {}", e));
                Inbound::Nothing
            }
        }
    }

    pub async fn on_message(&mut self, message: Message) -> Inbound {
        self.log.debug(format!("Received {}", message.kind()));

        match message {
            Message::Ping => Inbound::Reply(Message::Pong),
            Message::Pong => Inbound::Nothing,
            Message::Connected(welcome) => {
                self.log.connection(format!(
                    "Connected to relay as {} ({} files mirrored)",
                    welcome.client_id, welcome.file_count
                ));
                Inbound::Nothing
            }
            Message::FileSynced(ack) => {
                self.log.sync(format!("File synced: {}", ack.relative_path));
                Inbound::Nothing
            }
            Message::FileDeletedConfirmed(ack) => {
                self.log
                    .sync(format!("File deleted on relay: {}", ack.relative_path));
                Inbound::Nothing
            }
            Message::FolderClearedConfirmed => Inbound::ClearConfirmed,
            Message::FolderCleared => {
                // Another peer cleared the relay; our own folder is left alone
                self.log.info("Relay folder was cleared by another peer");
                Inbound::Event(SyncEvent::FolderCleared)
            }
            Message::Error(error) => {
                self.log.error(format!("Relay error: {}", error.message));
                Inbound::Event(SyncEvent::ServerError {
                    message: error.message,
                })
            }
            _ if !self.is_active() => {
                self.log
                    .debug(format!("Ignoring {} while not syncing", message.kind()));
                Inbound::Nothing
            }
            Message::FileUpdated(file) => self.apply_remote_write(file, None).await,
            Message::FileCreated(file) => {
                self.apply_remote_write(file, Some(RemoteKind::Created))
                    .await
            }
            Message::FileChanged(file) => {
                self.apply_remote_write(file, Some(RemoteKind::Changed))
                    .await
            }
            Message::FileDeleted(target) => self.apply_remote_delete(&target.relative_path).await,
            Message::SyncFile(_) | Message::DeleteFile(_) | Message::ClearFolder => {
                self.log
                    .warn(format!("Unexpected {} from relay", message.kind()));
                Inbound::Nothing
            }
        }
    }

    async fn apply_remote_write(&mut self, file: FilePayload, kind: Option<RemoteKind>) -> Inbound {
        let path = match normalize_relative_path(&file.relative_path) {
            Ok(path) => path,
            Err(e) => {
                self.log.warn(format!("Rejected remote write: {}", e));
                return Inbound::Nothing;
            }
        };

        match self
            .replica
            .apply_write(&path, &file.file_content, RELAY_ORIGIN)
            .await
        {
            Ok(outcome) => {
                self.log.sync(format!("File received: {}", path));
                let created = match kind {
                    Some(RemoteKind::Created) => true,
                    Some(RemoteKind::Changed) => false,
                    None => outcome.created,
                };
                Inbound::Event(if created {
                    SyncEvent::FileCreated { path }
                } else {
                    SyncEvent::FileChanged { path }
                })
            }
            Err(e) => {
                self.log
                    .error(format!("Failed to write {}: {}", path, e));
                Inbound::Nothing
            }
        }
    }

    async fn apply_remote_delete(&mut self, raw_path: &str) -> Inbound {
        let path = match normalize_relative_path(raw_path) {
            Ok(path) => path,
            Err(e) => {
                self.log.warn(format!("Rejected remote delete: {}", e));
                return Inbound::Nothing;
            }
        };

        match self.replica.apply_delete(&path).await {
            Ok(existed) => {
                if existed {
                    self.log.sync(format!("File deleted: {}", path));
                }
                Inbound::Event(SyncEvent::FileDeleted { path })
            }
            Err(e) => {
                self.log
                    .error(format!("Failed to delete {}: {}", path, e));
                Inbound::Nothing
            }
        }
    }

    /// Turn a watcher event into an outbound message while syncing.
    pub async fn on_local_event(&mut self, event: LocalEvent) -> Option<Message> {
        if self.state != SessionState::Active {
            return None;
        }
        let message = match self.replica.observe(event).await? {
            LocalIntent::Created { path, content, .. } | LocalIntent::Changed { path, content, .. } => {
                Message::sync_file(path, content)
            }
            LocalIntent::Deleted { path } => Message::delete_file(path),
        };
        self.log.debug(format!(
            "Local change: {} {}",
            message.kind(),
            message.relative_path().unwrap_or_default()
        ));
        Some(message)
    }
}

#[derive(Debug, Clone, Copy)]
enum RemoteKind {
    Created,
    Changed,
}
