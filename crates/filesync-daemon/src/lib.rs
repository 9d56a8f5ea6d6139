//! filesync-daemon library: native glue around `filesync-core`.
//!
//! This is a thin library layer over the daemon components, so the binary
//! and the integration tests share the same types.

pub mod client;
pub mod config;
pub mod connection;
pub mod native_fs;
pub mod relay;
pub mod server;
pub mod session;
pub mod watcher;

pub use client::{ClientConnection, ClientEvent, GaveUp, ReconnectConfig};
pub use config::{Config, ConfigError};
pub use connection::{ConnectionEvent, PeerConnection};
pub use native_fs::NativeFs;
pub use relay::{RelayDaemon, RelayOptions, RelayStats};
pub use server::{ServerEvent, WebSocketServer};
pub use session::{SessionOptions, SyncSession};
pub use watcher::FileWatcher;
