//! Client-side connection supervisor.
//!
//! Manages the single outgoing connection to the relay:
//! - Connection establishment and a read task forwarding frames
//! - An open flag that turns sends on a closed socket into logged no-ops
//! - Opt-in reconnection with exponential backoff

use anyhow::{Result, anyhow};
use filesync_core::Message;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_with_config};
use tracing::{debug, error, info, warn};

use crate::server::FRAME_HEADROOM;

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ClientSink = SplitSink<ClientStream, WsMessage>;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "ReconnectFile")]
pub struct ReconnectConfig {
    /// Initial delay before first reconnect attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum number of attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            max_attempts: Some(5),
        }
    }
}

/// `[reconnect]` table as written in the config file (milliseconds).
#[derive(Debug, Deserialize)]
#[serde(default)]
struct ReconnectFile {
    initial_delay_ms: u64,
    max_delay_ms: u64,
    backoff_factor: f64,
    /// 0 means unlimited
    max_attempts: u32,
}

impl Default for ReconnectFile {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_factor: 2.0,
            max_attempts: 5,
        }
    }
}

impl From<ReconnectFile> for ReconnectConfig {
    fn from(file: ReconnectFile) -> Self {
        Self {
            initial_delay: Duration::from_millis(file.initial_delay_ms),
            max_delay: Duration::from_millis(file.max_delay_ms),
            backoff_factor: file.backoff_factor,
            max_attempts: (file.max_attempts > 0).then_some(file.max_attempts),
        }
    }
}

/// Calculates the next reconnection delay using exponential backoff.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let delay_secs = config.initial_delay.as_secs_f64()
        * config.backoff_factor.powi(attempt.saturating_sub(1) as i32);

    Duration::from_secs_f64(delay_secs.min(config.max_delay.as_secs_f64()))
}

/// Reconnection bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    /// Number of reconnection attempts since the last successful connect
    pub attempts: u32,
    /// Current backoff delay
    pub current_delay: Duration,
}

impl ReconnectState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more attempt and return how long to wait before it, or
    /// `None` once the attempt budget is spent.
    pub fn next_attempt(&mut self, config: &ReconnectConfig) -> Option<Duration> {
        if self.exceeded_max_attempts(config) {
            return None;
        }
        self.attempts += 1;
        self.current_delay = calculate_backoff(self.attempts, config);
        Some(self.current_delay)
    }

    /// Reset state after successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = Duration::ZERO;
    }

    /// Check if max attempts exceeded.
    pub fn exceeded_max_attempts(&self, config: &ReconnectConfig) -> bool {
        config
            .max_attempts
            .map(|max| self.attempts >= max)
            .unwrap_or(false)
    }
}

/// Transport signal from the read task.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientEvent {
    Frame(Vec<u8>),
    Closed,
}

/// The reconnect budget ran out.
#[derive(Debug, thiserror::Error)]
#[error("gave up reconnecting after {attempts} attempts")]
pub struct GaveUp {
    pub attempts: u32,
}

/// The client's connection to the relay.
pub struct ClientConnection {
    url: String,
    frame_limit: usize,
    write: Option<Arc<Mutex<ClientSink>>>,
    read_task: Option<JoinHandle<()>>,
    open: Arc<AtomicBool>,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
    event_rx: mpsc::UnboundedReceiver<ClientEvent>,
    pub reconnect: ReconnectState,
    reconnect_config: ReconnectConfig,
}

impl ClientConnection {
    /// Create a connection handle (not yet connected).
    pub fn new(url: impl Into<String>, max_payload_size: usize, reconnect_config: ReconnectConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            url: url.into(),
            frame_limit: max_payload_size.saturating_add(FRAME_HEADROOM),
            write: None,
            read_task: None,
            open: Arc::new(AtomicBool::new(false)),
            event_tx,
            event_rx,
            reconnect: ReconnectState::new(),
            reconnect_config,
        }
    }

    /// Open the socket and start the read task.
    pub async fn connect(&mut self) -> Result<()> {
        self.shutdown_task();
        // A stale `Closed` from the previous socket must not follow us
        while self.event_rx.try_recv().is_ok() {}

        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.frame_limit);
        config.max_frame_size = Some(self.frame_limit);

        let (ws_stream, _) = connect_async_with_config(self.url.as_str(), Some(config), false)
            .await
            .map_err(|e| anyhow!("Failed to connect to {}: {}", self.url, e))?;

        let (write, read) = ws_stream.split();
        self.write = Some(Arc::new(Mutex::new(write)));
        self.open.store(true, Ordering::SeqCst);

        let url = self.url.clone();
        let open = Arc::clone(&self.open);
        let event_tx = self.event_tx.clone();
        self.read_task = Some(tokio::spawn(async move {
            Self::read_loop(url, read, open, event_tx).await;
        }));

        self.reconnect.reset();
        Ok(())
    }

    async fn read_loop(
        url: String,
        mut read: SplitStream<ClientStream>,
        open: Arc<AtomicBool>,
        event_tx: mpsc::UnboundedSender<ClientEvent>,
    ) {
        loop {
            let data = match read.next().await {
                Some(Ok(WsMessage::Text(text))) => text.into_bytes(),
                Some(Ok(WsMessage::Binary(data))) => data.to_vec(),
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => continue,
                Some(Ok(WsMessage::Close(_))) => {
                    debug!("Received close frame from {}", url);
                    break;
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection to {} closed", url);
                        }
                        _ => {
                            error!("WebSocket error on {}: {}", url, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection to {} ended", url);
                    break;
                }
            };

            if event_tx.send(ClientEvent::Frame(data)).is_err() {
                return;
            }
        }

        open.store(false, Ordering::SeqCst);
        let _ = event_tx.send(ClientEvent::Closed);
    }

    pub fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Send a message as a JSON text frame.
    ///
    /// Sending on a closed connection does nothing beyond a warning.
    pub async fn send(&self, message: &Message) {
        let Some(write) = self.write.as_ref().filter(|_| self.is_connected()) else {
            warn!("Not connected, dropping {}", message.kind());
            return;
        };

        let mut w = write.lock().await;
        if let Err(e) = w.send(WsMessage::Text(message.to_json())).await {
            warn!("Failed to send {}: {}", message.kind(), e);
        }
    }

    /// Wait for the next transport signal.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        self.event_rx.recv().await
    }

    /// Like `recv`, but gives up after `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<ClientEvent> {
        tokio::time::timeout(timeout, self.event_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Close the socket with a close frame. The read task is stopped, so no
    /// `Closed` event follows.
    pub async fn disconnect(&mut self) {
        if let Some(write) = self.write.take() {
            let mut w = write.lock().await;
            let _ = w.send(WsMessage::Close(None)).await;
        }
        self.shutdown_task();
        // Drain anything the read task queued before it stopped
        while self.event_rx.try_recv().is_ok() {}
    }

    fn shutdown_task(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }

    /// Delay before the next reconnect attempt, or `GaveUp` when the budget
    /// is spent.
    pub fn schedule_reconnect(&mut self) -> std::result::Result<Duration, GaveUp> {
        match self.reconnect.next_attempt(&self.reconnect_config) {
            Some(delay) => {
                info!(
                    "Reconnecting to {} in {:?} (attempt {})",
                    self.url, delay, self.reconnect.attempts
                );
                Ok(delay)
            }
            None => Err(GaveUp {
                attempts: self.reconnect.attempts,
            }),
        }
    }

    /// Reconnect with exponential backoff until it succeeds or the budget is
    /// spent.
    pub async fn reconnect(&mut self) -> std::result::Result<(), GaveUp> {
        loop {
            let delay = self.schedule_reconnect()?;
            tokio::time::sleep(delay).await;
            match self.connect().await {
                Ok(()) => {
                    info!("Reconnected to {}", self.url);
                    return Ok(());
                }
                Err(e) => warn!("Reconnect attempt failed: {}", e),
            }
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}
