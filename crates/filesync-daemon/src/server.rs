//! WebSocket server for the relay.
//!
//! Owns every accepted connection, keyed by a uuid connection id. Read tasks
//! report through one channel drained by `poll_event()`, which also keeps the
//! per-connection liveness flags used by the heartbeat sweep.

use crate::connection::{ConnectionEvent, PeerConnection};
use anyhow::Result;
use filesync_core::Envelope;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, error, info, warn};

/// Room above the payload ceiling so an oversized message still arrives
/// intact and can be answered with an error instead of a dropped socket.
pub const FRAME_HEADROOM: usize = 1024 * 1024;

/// Event surfaced to the relay loop.
#[derive(Debug, PartialEq, Eq)]
pub enum ServerEvent {
    /// A data frame from an open connection.
    Frame { conn_id: String, data: Vec<u8> },
    /// An open connection went away.
    Disconnected { conn_id: String },
}

pub struct WebSocketServer {
    connections: HashMap<String, PeerConnection>,
    /// Largest WebSocket message the transport accepts
    frame_limit: usize,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl WebSocketServer {
    pub fn new(max_payload_size: usize) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            connections: HashMap::new(),
            frame_limit: max_payload_size.saturating_add(FRAME_HEADROOM),
            event_tx,
            event_rx,
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("WebSocket server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    fn ws_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.frame_limit);
        config.max_frame_size = Some(self.frame_limit);
        config
    }

    /// Upgrade a new TCP connection. Returns the connection id on success.
    pub async fn accept_connection(&mut self, stream: TcpStream, addr: SocketAddr) -> Option<String> {
        let ws_stream = match accept_async_with_config(stream, Some(self.ws_config())).await {
            Ok(ws) => ws,
            Err(e) => {
                // Port probes connect and close without a WebSocket handshake
                let err_str = e.to_string();
                if err_str.contains("Handshake not finished")
                    || err_str.contains("Connection reset")
                    || err_str.contains("unexpected EOF")
                {
                    debug!("Connection closed before handshake from {}", addr);
                } else {
                    error!("WebSocket upgrade failed for {}: {}", addr, e);
                }
                return None;
            }
        };

        let conn_id = uuid::Uuid::new_v4().to_string();
        debug!("New connection from {} (conn_id: {})", addr, conn_id);

        let conn = PeerConnection::new(
            conn_id.clone(),
            addr.to_string(),
            ws_stream,
            self.event_tx.clone(),
        );
        self.connections.insert(conn_id.clone(), conn);
        Some(conn_id)
    }

    /// Wait for the next frame or disconnect.
    ///
    /// Any frame, pongs included, marks its connection alive. Events from
    /// connections that were already terminated are dropped.
    pub async fn poll_event(&mut self) -> Option<ServerEvent> {
        loop {
            let event = self.event_rx.recv().await?;

            let Some(conn) = self.connections.get_mut(event.conn_id()) else {
                debug!("Dropping event from closed connection {}", event.conn_id());
                continue;
            };

            match event {
                ConnectionEvent::Frame { conn_id, data } => {
                    conn.mark_alive();
                    return Some(ServerEvent::Frame { conn_id, data });
                }
                ConnectionEvent::Pong { .. } => {
                    conn.mark_alive();
                }
                ConnectionEvent::Closed { conn_id } => {
                    self.connections.remove(&conn_id);
                    return Some(ServerEvent::Disconnected { conn_id });
                }
            }
        }
    }

    /// Deliver an envelope to every open connection its target includes.
    ///
    /// A failed send is logged and never stops delivery to the others.
    pub async fn deliver(&self, envelope: &Envelope) {
        for (conn_id, conn) in &self.connections {
            if !envelope.target.includes(conn_id) {
                continue;
            }
            if let Err(e) = conn.send(&envelope.message).await {
                warn!("Failed to deliver {}: {}", envelope.message.kind(), e);
            }
        }
    }

    /// One heartbeat round.
    ///
    /// Connections that stayed silent since the previous round are
    /// terminated and returned; every other connection is marked not-alive
    /// and pinged.
    pub async fn heartbeat_sweep(&mut self) -> Vec<String> {
        let dead: Vec<String> = self
            .connections
            .iter()
            .filter(|(_, conn)| !conn.is_alive())
            .map(|(id, _)| id.clone())
            .collect();

        for conn_id in &dead {
            if let Some(mut conn) = self.connections.remove(conn_id) {
                warn!(
                    "Terminating unresponsive connection {} ({}), last seen {:?} ago",
                    conn_id,
                    conn.address,
                    conn.last_seen().elapsed()
                );
                conn.terminate();
            }
        }

        for (conn_id, conn) in self.connections.iter_mut() {
            conn.mark_not_alive();
            if let Err(e) = conn.ping().await {
                debug!("Heartbeat ping to {} failed: {}", conn_id, e);
            }
        }

        dead
    }

    /// Close every connection with a close frame.
    pub async fn close_all(&mut self) {
        for (conn_id, mut conn) in self.connections.drain() {
            debug!("Closing connection {}", conn_id);
            conn.close().await;
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_connected(&self, conn_id: &str) -> bool {
        self.connections.contains_key(conn_id)
    }
}
