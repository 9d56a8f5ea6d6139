//! Relay-side client connection.
//!
//! Each connection wraps a WebSocket stream, split into a write half shared
//! behind a mutex and a spawned read task that forwards frames to the
//! server's event channel.

use anyhow::{Result, anyhow};
use filesync_core::Message;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tracing::{debug, error};

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Event emitted by a connection's read task.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A text or binary data frame
    Frame { conn_id: String, data: Vec<u8> },
    /// A pong control frame (answer to a heartbeat ping)
    Pong { conn_id: String },
    /// The connection was closed by the remote or failed
    Closed { conn_id: String },
}

impl ConnectionEvent {
    pub fn conn_id(&self) -> &str {
        match self {
            ConnectionEvent::Frame { conn_id, .. }
            | ConnectionEvent::Pong { conn_id }
            | ConnectionEvent::Closed { conn_id } => conn_id,
        }
    }
}

/// One connected client, as seen by the relay.
pub struct PeerConnection {
    pub conn_id: String,
    /// Remote socket address, for logs
    pub address: String,
    alive: bool,
    last_seen: Instant,
    write: Arc<Mutex<WsSink>>,
    read_task: Option<JoinHandle<()>>,
}

impl PeerConnection {
    /// Wrap an accepted WebSocket stream and start its read task.
    pub fn new(
        conn_id: String,
        address: String,
        ws_stream: WebSocketStream<TcpStream>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (write, read) = ws_stream.split();

        let read_conn_id = conn_id.clone();
        let read_task = tokio::spawn(async move {
            Self::read_loop(read_conn_id, read, event_tx).await;
        });

        Self {
            conn_id,
            address,
            alive: true,
            last_seen: Instant::now(),
            write: Arc::new(Mutex::new(write)),
            read_task: Some(read_task),
        }
    }

    async fn read_loop(
        conn_id: String,
        mut read: WsSource,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        loop {
            let event = match read.next().await {
                Some(Ok(WsMessage::Text(text))) => ConnectionEvent::Frame {
                    conn_id: conn_id.clone(),
                    data: text.into_bytes(),
                },
                Some(Ok(WsMessage::Binary(data))) => ConnectionEvent::Frame {
                    conn_id: conn_id.clone(),
                    data: data.to_vec(),
                },
                Some(Ok(WsMessage::Pong(_))) => ConnectionEvent::Pong {
                    conn_id: conn_id.clone(),
                },
                // tungstenite answers pings itself
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Frame(_))) => continue,
                Some(Ok(WsMessage::Close(_))) => {
                    debug!("Received close frame from {}", conn_id);
                    break;
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection {} closed", conn_id);
                        }
                        _ => {
                            error!("WebSocket error on {}: {}", conn_id, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection {} stream ended", conn_id);
                    break;
                }
            };

            if event_tx.send(event).is_err() {
                // Server dropped
                return;
            }
        }

        let _ = event_tx.send(ConnectionEvent::Closed { conn_id });
    }

    /// Send a protocol message as a JSON text frame.
    pub async fn send(&self, message: &Message) -> Result<()> {
        self.send_raw(WsMessage::Text(message.to_json())).await
    }

    /// Send a heartbeat ping control frame.
    pub async fn ping(&self) -> Result<()> {
        self.send_raw(WsMessage::Ping(Vec::new())).await
    }

    async fn send_raw(&self, frame: WsMessage) -> Result<()> {
        let mut write = self.write.lock().await;
        write
            .send(frame)
            .await
            .map_err(|e| anyhow!("Failed to send to {}: {}", self.conn_id, e))
    }

    /// Record that a frame arrived.
    pub fn mark_alive(&mut self) {
        self.alive = true;
        self.last_seen = Instant::now();
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn mark_not_alive(&mut self) {
        self.alive = false;
    }

    /// Time of the last inbound frame.
    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Close the connection gracefully and stop the read task.
    pub async fn close(&mut self) {
        {
            let mut write = self.write.lock().await;
            let _ = write.send(WsMessage::Close(None)).await;
        }

        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }

    /// Drop the connection without a close handshake.
    pub fn terminate(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}
