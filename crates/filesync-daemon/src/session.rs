//! Client sync session.
//!
//! Drives a [`PeerEngine`] over a [`ClientConnection`]: starts and stops sync,
//! forwards watcher events, applies inbound frames and publishes every state
//! change on the session's [`EventBus`]. Everything runs on the task that
//! calls [`SyncSession::run`].

use crate::client::{ClientConnection, ClientEvent, ReconnectConfig};
use anyhow::Result;
use filesync_core::{
    EventBus, FileSystem, Inbound, LocalEvent, Logger, PeerEngine, Replica, SessionState, SyncEvent,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub relay_url: String,
    /// Send `CLEAR_FOLDER` when sync stops
    pub clear_on_stop: bool,
    /// How long to wait for the clear confirmation
    pub clear_timeout: Duration,
    /// Reconnect on its own after an unexpected disconnect
    pub auto_reconnect: bool,
    pub reconnect: ReconnectConfig,
}

impl SessionOptions {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            clear_on_stop: true,
            clear_timeout: Duration::from_secs(2),
            auto_reconnect: false,
            reconnect: ReconnectConfig::default(),
        }
    }
}

pub struct SyncSession<F> {
    engine: PeerEngine<F>,
    conn: ClientConnection,
    events: Arc<EventBus>,
    options: SessionOptions,
    log: Logger,
    /// Pending reconnect attempt
    reconnect_at: Option<Instant>,
}

impl<F: FileSystem> SyncSession<F> {
    pub fn new(replica: Replica<F>, options: SessionOptions, log: Logger) -> Self {
        let conn = ClientConnection::new(
            options.relay_url.clone(),
            replica.limits().max_payload_size,
            options.reconnect.clone(),
        );
        Self {
            engine: PeerEngine::new(replica, log),
            conn,
            events: Arc::new(EventBus::new()),
            options,
            log,
            reconnect_at: None,
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn state(&self) -> SessionState {
        self.engine.state()
    }

    pub fn engine(&self) -> &PeerEngine<F> {
        &self.engine
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Connect and send the initial sync batch.
    ///
    /// Fails with `AlreadyActive` unless the session is idle. A failed
    /// connection attempt leaves the session idle.
    pub async fn start_sync(&mut self) -> Result<()> {
        self.engine.begin_start()?;
        self.log
            .connection(format!("Connecting to {}", self.options.relay_url));

        if let Err(e) = self.conn.connect().await {
            self.engine.connect_failed();
            return Err(e);
        }
        self.log.connection("Connected to relay");
        self.events.emit(SyncEvent::Connected);

        let batch = self.engine.on_open().await?;
        for message in &batch {
            self.conn.send(message).await;
        }

        self.events.emit(SyncEvent::SyncStarted);
        Ok(())
    }

    /// Stop syncing. When connected and configured to, asks the relay to
    /// clear its folder first and waits a bounded time for the confirmation.
    pub async fn stop_sync(&mut self) -> Result<()> {
        let clear = self
            .engine
            .begin_stop(self.conn.is_connected(), self.options.clear_on_stop)?;

        if let Some(message) = clear {
            self.conn.send(&message).await;
            if self.await_clear_confirmation().await {
                info!("Relay folder cleared");
            } else {
                warn!(
                    "No clear confirmation within {:?}, disconnecting anyway",
                    self.options.clear_timeout
                );
            }
        }

        self.conn.disconnect().await;
        self.reconnect_at = None;
        self.engine.finish_stop();
        self.log.connection("Disconnected from relay");
        self.events.emit(SyncEvent::SyncStopped);
        Ok(())
    }

    async fn await_clear_confirmation(&mut self) -> bool {
        let deadline = Instant::now() + self.options.clear_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.conn.recv_timeout(remaining).await {
                Some(ClientEvent::Frame(data)) => {
                    if self.handle_frame(&data).await {
                        return true;
                    }
                }
                Some(ClientEvent::Closed) | None => return false,
            }
        }
    }

    /// Forward one watcher event, if it is a real local change.
    pub async fn handle_local(&mut self, event: LocalEvent) {
        if let Some(message) = self.engine.on_local_event(event).await {
            self.conn.send(&message).await;
        }
    }

    /// Apply one inbound frame. Returns true for a clear confirmation.
    async fn handle_frame(&mut self, data: &[u8]) -> bool {
        match self.engine.on_frame(data).await {
            Inbound::Nothing => false,
            Inbound::Event(event) => {
                self.events.emit(event);
                false
            }
            Inbound::Reply(message) => {
                self.conn.send(&message).await;
                false
            }
            Inbound::ClearConfirmed => true,
        }
    }

    fn on_closed(&mut self) {
        self.log.connection("Connection to relay lost");
        self.events.emit(SyncEvent::Disconnected);
        if self.options.auto_reconnect && self.engine.is_active() {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        match self.conn.schedule_reconnect() {
            Ok(delay) => self.reconnect_at = Some(Instant::now() + delay),
            Err(gave_up) => {
                warn!("{}", gave_up);
                self.reconnect_at = None;
                self.events.emit(SyncEvent::ReconnectGaveUp {
                    attempts: gave_up.attempts,
                });
            }
        }
    }

    async fn try_reconnect(&mut self) {
        self.reconnect_at = None;
        match self.conn.connect().await {
            Ok(()) => {
                // Live changes only from here on; nothing is re-sent
                self.log.connection("Reconnected to relay");
                self.events.emit(SyncEvent::Connected);
            }
            Err(e) => {
                warn!("Reconnect attempt failed: {}", e);
                self.schedule_reconnect();
            }
        }
    }

    /// Event loop: inbound frames, local changes and reconnect timers until
    /// `shutdown` resolves, then `stop_sync`.
    pub async fn run(
        &mut self,
        local_events: &mut mpsc::UnboundedReceiver<LocalEvent>,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        tokio::pin!(shutdown);

        loop {
            let reconnect_at = self.reconnect_at;

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }

                event = self.conn.recv() => match event {
                    Some(ClientEvent::Frame(data)) => {
                        if self.handle_frame(&data).await {
                            debug!("Unexpected clear confirmation");
                        }
                    }
                    Some(ClientEvent::Closed) => self.on_closed(),
                    None => break,
                },

                Some(event) = local_events.recv() => {
                    self.handle_local(event).await;
                }

                _ = sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => {
                    self.try_reconnect().await;
                }
            }
        }

        if self.engine.state() != SessionState::Idle {
            self.stop_sync().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_is_opt_in() {
        let options = SessionOptions::new("ws://127.0.0.1:1420");
        assert!(!options.auto_reconnect);
        assert!(options.clear_on_stop);
        assert_eq!(options.clear_timeout, Duration::from_secs(2));
    }
}
