//! Relay daemon: accepts clients, fans changes out, keeps the mirror root and
//! sweeps dead connections.

use crate::native_fs::NativeFs;
use crate::server::{ServerEvent, WebSocketServer};
use crate::watcher::FileWatcher;
use anyhow::Result;
use filesync_core::{LocalEvent, Logger, RelayEngine, Replica, ReplicaConfig};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Mirror root
    pub root: PathBuf,
    pub heartbeat_interval: Duration,
    pub replica: ReplicaConfig,
    /// Watch the mirror root for local edits
    pub watch: bool,
}

/// Snapshot logged on startup and shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStats {
    pub listen: String,
    pub client_count: usize,
    pub file_count: usize,
    pub root: PathBuf,
}

impl fmt::Display for RelayStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "listen={} clients={} files={} root={}",
            self.listen,
            self.client_count,
            self.file_count,
            self.root.display()
        )
    }
}

pub struct RelayDaemon {
    engine: RelayEngine<NativeFs>,
    server: WebSocketServer,
    watcher: Option<FileWatcher>,
    heartbeat_interval: Duration,
    root: PathBuf,
}

impl RelayDaemon {
    /// Prepare the mirror root and, if asked to, start watching it.
    pub async fn new(options: RelayOptions, log: Logger) -> Result<Self> {
        tokio::fs::create_dir_all(&options.root).await?;

        let watcher = if options.watch {
            Some(FileWatcher::new(options.root.clone())?)
        } else {
            None
        };

        let server = WebSocketServer::new(options.replica.limits.max_payload_size);
        let replica = Replica::new(NativeFs::new(options.root.clone()), options.replica, log);

        Ok(Self {
            engine: RelayEngine::new(replica, log),
            server,
            watcher,
            heartbeat_interval: options.heartbeat_interval,
            root: options.root,
        })
    }

    pub fn stats(&self, listen: &str) -> RelayStats {
        RelayStats {
            listen: listen.to_string(),
            client_count: self.server.connection_count(),
            file_count: self.engine.file_count(),
            root: self.root.clone(),
        }
    }

    /// Serve until `shutdown` resolves, then close every connection.
    pub async fn serve(
        mut self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<RelayStats> {
        let listen = listener.local_addr()?.to_string();
        info!("Relay started: {}", self.stats(&listen));

        tokio::pin!(shutdown);
        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => self.on_accept(stream, addr).await,
                    Err(e) => error!("Failed to accept connection: {}", e),
                },

                Some(event) = self.server.poll_event() => {
                    self.on_server_event(event).await;
                }

                Some(event) = next_local(&mut self.watcher) => {
                    self.on_local_event(event).await;
                }

                _ = heartbeat.tick() => {
                    let dead = self.server.heartbeat_sweep().await;
                    for conn_id in &dead {
                        self.engine.on_disconnect(conn_id);
                    }
                    debug!(
                        "Heartbeat: {} alive, {} terminated",
                        self.server.connection_count(),
                        dead.len()
                    );
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        let stats = self.stats(&listen);
        self.server.close_all().await;
        info!("Relay stopped: {}", stats);
        Ok(stats)
    }

    async fn on_accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        let Some(conn_id) = self.server.accept_connection(stream, addr).await else {
            return;
        };
        let welcome = self.engine.on_connect(&conn_id);
        self.server.deliver(&welcome).await;
        debug!(
            "{} connected from {} ({} total)",
            conn_id,
            addr,
            self.server.connection_count()
        );
    }

    async fn on_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Frame { conn_id, data } => {
                let envelopes = self.engine.handle_frame(&conn_id, &data).await;
                for envelope in &envelopes {
                    self.server.deliver(envelope).await;
                }
            }
            ServerEvent::Disconnected { conn_id } => {
                self.engine.on_disconnect(&conn_id);
            }
        }
    }

    async fn on_local_event(&mut self, event: LocalEvent) {
        if let Some(envelope) = self.engine.on_local_event(event).await {
            self.server.deliver(&envelope).await;
        }
    }
}

async fn next_local(watcher: &mut Option<FileWatcher>) -> Option<LocalEvent> {
    match watcher {
        Some(watcher) => watcher.event_rx().recv().await,
        None => std::future::pending().await,
    }
}
