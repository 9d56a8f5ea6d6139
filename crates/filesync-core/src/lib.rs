//! filesync-core: platform-independent logic for full-content file sync.
//!
//! This crate provides:
//! - `.gitignore`-style rule evaluation and the initial-sync scanner
//! - The echo-suppression ledger and the local replica that enforces
//!   mark-before-write for every remote effect
//! - The JSON wire protocol
//! - Sans-IO sync engines for both roles: `PeerEngine` (client) and
//!   `RelayEngine` (fan-out server)
//! - `FileSystem` and logging abstractions injected by the daemon

pub mod error;
pub mod events;
pub mod fs;
pub mod ignore;
pub mod index;
pub mod limits;
pub mod logging;
pub mod peer;
pub mod protocol;
pub mod relay;
pub mod replica;
pub mod scanner;
pub mod suppression;

pub use error::SyncError;
pub use events::{EventBus, Subscription, SyncEvent};
pub use fs::{FileEntry, FileStat, FileSystem, FsError, InMemoryFs};
pub use ignore::{IgnoreCache, IgnoreRules};
pub use index::{FileIndex, SyncedFile};
pub use limits::Limits;
pub use logging::{LogConfig, LogLevel, Logger};
pub use peer::{Inbound, PeerEngine, SessionState};
pub use protocol::{Message, ProtocolError};
pub use relay::{Envelope, RelayEngine, Target};
pub use replica::{LocalEvent, LocalIntent, Replica, ReplicaConfig};
pub use suppression::SuppressionLedger;
