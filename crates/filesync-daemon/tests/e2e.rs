//! End-to-end tests for filesync-daemon.
//!
//! Tests the WebSocket server's liveness handling, the full relay loop over
//! real sockets, and the client session against a running relay.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use filesync_core::{Logger, Replica, SessionState, SyncEvent};
use filesync_daemon::{
    Config, NativeFs, RelayDaemon, RelayStats, ServerEvent, SyncSession, WebSocketServer,
};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Raw WebSocket client speaking the JSON protocol.
struct TestClient {
    ws: Ws,
    client_id: String,
}

impl TestClient {
    /// Connect to a relay and consume its `CONNECTED` welcome.
    async fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = connect_async(format!("ws://{}", addr))
            .await
            .expect("Failed to connect");
        let mut client = Self {
            ws,
            client_id: String::new(),
        };

        let welcome = client.recv().await;
        assert_eq!(welcome["type"], "CONNECTED");
        client.client_id = welcome["payload"]["clientId"]
            .as_str()
            .expect("clientId")
            .to_string();
        client
    }

    /// Receive the next JSON message, skipping control frames.
    async fn recv(&mut self) -> Value {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(&text).expect("Invalid JSON");
                }
                Some(Ok(Message::Binary(data))) => {
                    return serde_json::from_slice(&data).expect("Invalid JSON");
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => panic!("Connection closed unexpectedly"),
                Some(Err(e)) => panic!("WebSocket error: {}", e),
                None => panic!("Stream ended unexpectedly"),
                _ => continue,
            }
        }
    }

    async fn recv_timeout(&mut self, duration: Duration) -> Option<Value> {
        timeout(duration, self.recv()).await.ok()
    }

    /// Every message that arrives before the connection goes quiet for `quiet`.
    async fn drain(&mut self, quiet: Duration) -> Vec<Value> {
        let mut messages = Vec::new();
        while let Some(message) = self.recv_timeout(quiet).await {
            messages.push(message);
        }
        messages
    }

    async fn send(&mut self, message: Value) {
        self.send_text(message.to_string()).await;
    }

    async fn send_text(&mut self, text: String) {
        self.ws
            .send(Message::Text(text))
            .await
            .expect("Failed to send message");
    }

    /// True once the server has dropped the connection.
    async fn wait_closed(&mut self, duration: Duration) -> bool {
        let closed = async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(_)) => continue,
                }
            }
        };
        timeout(duration, closed).await.is_ok()
    }

    async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

fn sync_file(path: &str, content: &str) -> Value {
    json!({
        "type": "SYNC_FILE",
        "payload": { "relativePath": path, "fileContent": content }
    })
}

// ============================================================================
// Helpers
// ============================================================================

struct RunningRelay {
    addr: SocketAddr,
    root: TempDir,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<anyhow::Result<RelayStats>>,
}

impl RunningRelay {
    async fn stop(self) -> RelayStats {
        let _ = self.stop.send(());
        self.handle
            .await
            .expect("Relay task panicked")
            .expect("Relay failed")
    }
}

fn relay_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.root = root.to_path_buf();
    config.relay.watch = false;
    config
}

async fn start_relay(configure: impl FnOnce(&mut Config)) -> RunningRelay {
    let root = TempDir::new().unwrap();
    let mut config = relay_config(root.path());
    configure(&mut config);

    let listener = WebSocketServer::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().unwrap();
    let relay = RelayDaemon::new(config.relay_options(), Logger::default())
        .await
        .expect("Failed to create relay");

    let (stop, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(relay.serve(listener, async {
        let _ = stop_rx.await;
    }));

    RunningRelay {
        addr,
        root,
        stop,
        handle,
    }
}

/// Accept one client on a bare server.
async fn accept_one(server: &mut WebSocketServer, listener: &TcpListener) -> (Ws, String) {
    let addr = listener.local_addr().unwrap();
    let (client, conn_id) = tokio::join!(
        async {
            connect_async(format!("ws://{}", addr))
                .await
                .expect("Failed to connect")
                .0
        },
        async {
            let (stream, peer_addr) = listener.accept().await.expect("Failed to accept");
            server.accept_connection(stream, peer_addr).await
        }
    );
    (client, conn_id.expect("Upgrade failed"))
}

async fn wait_for_file(path: &Path) -> Option<String> {
    for _ in 0..100 {
        if let Ok(content) = tokio::fs::read_to_string(path).await {
            return Some(content);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    None
}

async fn wait_for_removal(path: &Path) -> bool {
    for _ in 0..100 {
        if !path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

fn record_events(session: &SyncSession<NativeFs>) -> (Arc<Mutex<Vec<SyncEvent>>>, filesync_core::Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let subscription = session
        .events()
        .subscribe(move |event| sink.lock().unwrap().push(event.clone()));
    (seen, subscription)
}

// ============================================================================
// WebSocketServer
// ============================================================================

#[tokio::test]
async fn test_poll_event_frame_and_disconnect() {
    let mut server = WebSocketServer::new(1024);
    let listener = WebSocketServer::bind("127.0.0.1:0").await.unwrap();
    let (mut client, conn_id) = accept_one(&mut server, &listener).await;
    assert_eq!(server.connection_count(), 1);

    client.send(Message::Text("hello".into())).await.unwrap();
    let event = timeout(Duration::from_secs(2), server.poll_event())
        .await
        .expect("Should receive frame");
    assert_eq!(
        event,
        Some(ServerEvent::Frame {
            conn_id: conn_id.clone(),
            data: b"hello".to_vec(),
        })
    );

    client.close(None).await.unwrap();
    let event = timeout(Duration::from_secs(2), server.poll_event())
        .await
        .expect("Should receive disconnect");
    assert_eq!(event, Some(ServerEvent::Disconnected { conn_id }));
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test]
async fn test_heartbeat_terminates_silent_connection() {
    let mut server = WebSocketServer::new(1024);
    let listener = WebSocketServer::bind("127.0.0.1:0").await.unwrap();
    // Never read, so never answers pings
    let (_client, conn_id) = accept_one(&mut server, &listener).await;

    assert!(server.heartbeat_sweep().await.is_empty());
    assert_eq!(server.connection_count(), 1);

    assert_eq!(server.heartbeat_sweep().await, vec![conn_id.clone()]);
    assert!(!server.is_connected(&conn_id));
}

#[tokio::test]
async fn test_heartbeat_spares_connection_that_sent_a_frame() {
    let mut server = WebSocketServer::new(1024);
    let listener = WebSocketServer::bind("127.0.0.1:0").await.unwrap();
    let (mut client, conn_id) = accept_one(&mut server, &listener).await;

    assert!(server.heartbeat_sweep().await.is_empty());

    client
        .send(Message::Text(r#"{"type":"PING"}"#.into()))
        .await
        .unwrap();
    timeout(Duration::from_secs(2), server.poll_event())
        .await
        .expect("Should receive frame");

    assert!(server.heartbeat_sweep().await.is_empty());
    assert!(server.is_connected(&conn_id));
}

#[tokio::test]
async fn test_heartbeat_spares_connection_that_answered_ping() {
    let mut server = WebSocketServer::new(1024);
    let listener = WebSocketServer::bind("127.0.0.1:0").await.unwrap();
    let (mut client, conn_id) = accept_one(&mut server, &listener).await;

    assert!(server.heartbeat_sweep().await.is_empty());

    // Reading the ping queues the pong, flushing sends it
    let ping = timeout(Duration::from_secs(2), client.next())
        .await
        .expect("Should receive ping");
    assert!(matches!(ping, Some(Ok(Message::Ping(_)))));
    client.flush().await.unwrap();

    // The pong is consumed inside poll_event
    assert!(
        timeout(Duration::from_millis(300), server.poll_event())
            .await
            .is_err()
    );

    assert!(server.heartbeat_sweep().await.is_empty());
    assert!(server.is_connected(&conn_id));
}

// ============================================================================
// Relay
// ============================================================================

#[tokio::test]
async fn test_sync_file_acked_and_fanned_out_without_echo() {
    let relay = start_relay(|_| {}).await;
    let mut a = TestClient::connect(relay.addr).await;
    let mut b = TestClient::connect(relay.addr).await;
    assert_ne!(a.client_id, b.client_id);

    a.send(sync_file("notes/todo.md", "- [ ] ship")).await;

    let ack = a.recv().await;
    assert_eq!(ack["type"], "FILE_SYNCED");
    assert_eq!(ack["payload"]["relativePath"], "notes/todo.md");

    let update = b.recv().await;
    assert_eq!(update["type"], "FILE_UPDATED");
    assert_eq!(update["payload"]["fileContent"], "- [ ] ship");
    assert_eq!(update["payload"]["version"], 1);

    // The origin never hears its own change
    assert!(a.recv_timeout(Duration::from_millis(300)).await.is_none());

    assert_eq!(
        std::fs::read_to_string(relay.root.path().join("notes/todo.md")).unwrap(),
        "- [ ] ship"
    );

    a.close().await;
    b.close().await;
    let stats = relay.stop().await;
    assert_eq!(stats.file_count, 1);
}

#[tokio::test]
async fn test_welcome_reports_file_count() {
    let relay = start_relay(|_| {}).await;
    let mut a = TestClient::connect(relay.addr).await;
    a.send(sync_file("one.txt", "1")).await;
    a.recv().await;

    let (ws, _) = connect_async(format!("ws://{}", relay.addr)).await.unwrap();
    let mut late = TestClient {
        ws,
        client_id: String::new(),
    };
    let welcome = late.recv().await;
    assert_eq!(welcome["type"], "CONNECTED");
    assert_eq!(welcome["payload"]["fileCount"], 1);

    relay.stop().await;
}

#[tokio::test]
async fn test_delete_is_acked_and_idempotent() {
    let relay = start_relay(|_| {}).await;
    let mut a = TestClient::connect(relay.addr).await;
    let mut b = TestClient::connect(relay.addr).await;

    a.send(sync_file("gone.txt", "bye")).await;
    a.recv().await;
    b.recv().await;

    for _ in 0..2 {
        a.send(json!({"type": "DELETE_FILE", "payload": {"relativePath": "gone.txt"}}))
            .await;
        assert_eq!(a.recv().await["type"], "FILE_DELETED_CONFIRMED");
        assert_eq!(b.recv().await["type"], "FILE_DELETED");
    }

    assert!(!relay.root.path().join("gone.txt").exists());
    relay.stop().await;
}

#[tokio::test]
async fn test_oversized_frame_answered_with_error() {
    let relay = start_relay(|config| {
        config.limits.max_payload_size = 1024;
        config.limits.max_file_size = 512;
    })
    .await;
    let mut a = TestClient::connect(relay.addr).await;

    a.send_text("x".repeat(2000)).await;
    let reply = a.recv().await;
    assert_eq!(reply["type"], "ERROR");
    assert_eq!(reply["payload"]["message"], "Message too large");

    // Fits the frame ceiling, not the file ceiling
    a.send(sync_file("big.txt", &"y".repeat(600))).await;
    let reply = a.recv().await;
    assert_eq!(reply["type"], "ERROR");
    assert!(!relay.root.path().join("big.txt").exists());

    // Still usable afterwards
    a.send(json!({"type": "PING"})).await;
    assert_eq!(a.recv().await["type"], "PONG");

    relay.stop().await;
}

#[tokio::test]
async fn test_path_escaping_root_is_rejected() {
    let relay = start_relay(|_| {}).await;
    let mut a = TestClient::connect(relay.addr).await;

    a.send(sync_file("../outside.txt", "nope")).await;
    assert_eq!(a.recv().await["type"], "ERROR");
    assert!(!relay.root.path().join("../outside.txt").exists());

    relay.stop().await;
}

#[tokio::test]
async fn test_relay_terminates_unresponsive_client() {
    let relay = start_relay(|config| {
        config.relay.heartbeat_interval_ms = 100;
    })
    .await;

    // Connect but never read, so pings go unanswered
    let (mut silent, _) = connect_async(format!("ws://{}", relay.addr)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let closed = timeout(Duration::from_secs(3), async {
        loop {
            match silent.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "silent client should have been dropped");

    relay.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let relay = start_relay(|_| {}).await;
    let mut a = TestClient::connect(relay.addr).await;

    let stats = relay.stop().await;
    assert_eq!(stats.client_count, 1);
    assert!(a.wait_closed(Duration::from_secs(2)).await);
}

// ============================================================================
// Relay watching its own root
// ============================================================================

/// Long enough for the watcher's debounce window to flush.
const WATCH_SETTLE: Duration = Duration::from_millis(1500);

fn types(messages: &[Value]) -> Vec<&str> {
    messages
        .iter()
        .map(|m| m["type"].as_str().unwrap_or_default())
        .collect()
}

#[tokio::test]
async fn test_watched_relay_does_not_echo_its_own_writes() {
    let relay = start_relay(|config| config.relay.watch = true).await;
    let mut a = TestClient::connect(relay.addr).await;
    let mut b = TestClient::connect(relay.addr).await;

    a.send(sync_file("dir/sub/a.txt", "hello")).await;

    assert_eq!(types(&a.drain(WATCH_SETTLE).await), vec!["FILE_SYNCED"]);
    assert_eq!(types(&b.drain(WATCH_SETTLE).await), vec!["FILE_UPDATED"]);

    relay.stop().await;
}

#[tokio::test]
async fn test_watched_relay_clear_folder_with_subdirectories() {
    let relay = start_relay(|config| config.relay.watch = true).await;
    let mut a = TestClient::connect(relay.addr).await;
    let mut b = TestClient::connect(relay.addr).await;

    a.send(sync_file("dir/sub/a.txt", "nested")).await;
    a.send(sync_file("top.txt", "top")).await;
    assert_eq!(a.drain(WATCH_SETTLE).await.len(), 2);
    assert_eq!(b.drain(WATCH_SETTLE).await.len(), 2);

    a.send(json!({"type": "CLEAR_FOLDER"})).await;

    assert_eq!(
        types(&a.drain(WATCH_SETTLE).await),
        vec!["FOLDER_CLEARED_CONFIRMED"]
    );
    assert_eq!(types(&b.drain(WATCH_SETTLE).await), vec!["FOLDER_CLEARED"]);
    assert!(std::fs::read_dir(relay.root.path()).unwrap().next().is_none());

    relay.stop().await;
}

#[tokio::test]
async fn test_watched_relay_broadcasts_local_edit() {
    let relay = start_relay(|config| config.relay.watch = true).await;
    let mut a = TestClient::connect(relay.addr).await;
    let mut b = TestClient::connect(relay.addr).await;

    std::fs::write(relay.root.path().join("local.txt"), "made on the relay").unwrap();

    for client in [&mut a, &mut b] {
        let messages = client.drain(WATCH_SETTLE).await;
        assert_eq!(types(&messages), vec!["FILE_CREATED"]);
        assert_eq!(messages[0]["payload"]["relativePath"], "local.txt");
        assert_eq!(messages[0]["payload"]["fileContent"], "made on the relay");
        assert_eq!(messages[0]["payload"]["version"], 1);
    }

    relay.stop().await;
}

// ============================================================================
// Client session
// ============================================================================

fn session_for(root: &Path, relay: &RunningRelay, configure: impl FnOnce(&mut Config)) -> SyncSession<NativeFs> {
    let mut config = Config::default();
    config.root = root.to_path_buf();
    config.client.relay_url = format!("ws://{}", relay.addr);
    configure(&mut config);

    let replica = Replica::new(
        NativeFs::new(root.to_path_buf()),
        config.replica_config("test-client"),
        Logger::default(),
    );
    SyncSession::new(replica, config.session_options(), Logger::default())
}

#[tokio::test]
async fn test_initial_sync_skips_oversized_and_ignored_files() {
    let relay = start_relay(|_| {}).await;
    let mut observer = TestClient::connect(relay.addr).await;

    let local = TempDir::new().unwrap();
    std::fs::write(local.path().join("small.txt"), "small").unwrap();
    std::fs::write(local.path().join("huge.txt"), "z".repeat(64)).unwrap();
    std::fs::write(local.path().join(".gitignore"), "*.log\n").unwrap();
    std::fs::write(local.path().join("debug.log"), "noise").unwrap();

    let mut session = session_for(local.path(), &relay, |config| {
        config.limits.max_file_size = 32;
    });
    let (events, _subscription) = record_events(&session);

    session.start_sync().await.unwrap();
    assert_eq!(session.state(), SessionState::Active);

    let mut received = Vec::new();
    while let Some(message) = observer.recv_timeout(Duration::from_millis(500)).await {
        assert_eq!(message["type"], "FILE_UPDATED");
        received.push(message["payload"]["relativePath"].as_str().unwrap().to_string());
    }
    received.sort();
    assert_eq!(received, vec![".gitignore", "small.txt"]);
    assert!(!relay.root.path().join("huge.txt").exists());

    assert_eq!(
        *events.lock().unwrap(),
        vec![SyncEvent::Connected, SyncEvent::SyncStarted]
    );

    session.stop_sync().await.unwrap();
    relay.stop().await;
}

#[tokio::test]
async fn test_start_twice_is_already_active() {
    let relay = start_relay(|_| {}).await;
    let local = TempDir::new().unwrap();
    let mut session = session_for(local.path(), &relay, |_| {});

    session.start_sync().await.unwrap();
    assert!(session.start_sync().await.is_err());

    session.stop_sync().await.unwrap();
    assert_eq!(session.state(), SessionState::Idle);
    relay.stop().await;
}

#[tokio::test]
async fn test_failed_connect_leaves_session_idle() {
    let relay = start_relay(|_| {}).await;
    let local = TempDir::new().unwrap();
    let mut session = session_for(local.path(), &relay, |config| {
        config.client.relay_url = "ws://127.0.0.1:1".into();
    });

    assert!(session.start_sync().await.is_err());
    assert_eq!(session.state(), SessionState::Idle);
    relay.stop().await;
}

#[tokio::test]
async fn test_stop_clears_relay_folder() {
    let relay = start_relay(|_| {}).await;
    let mut observer = TestClient::connect(relay.addr).await;

    let local = TempDir::new().unwrap();
    std::fs::write(local.path().join("a.txt"), "a").unwrap();

    let mut session = session_for(local.path(), &relay, |_| {});
    let (events, _subscription) = record_events(&session);
    session.start_sync().await.unwrap();
    assert_eq!(observer.recv().await["type"], "FILE_UPDATED");
    assert!(wait_for_file(&relay.root.path().join("a.txt")).await.is_some());

    session.stop_sync().await.unwrap();

    assert_eq!(observer.recv().await["type"], "FOLDER_CLEARED");
    assert!(std::fs::read_dir(relay.root.path()).unwrap().next().is_none());
    // Local files stay
    assert!(local.path().join("a.txt").exists());
    assert_eq!(events.lock().unwrap().last(), Some(&SyncEvent::SyncStopped));

    relay.stop().await;
}

#[tokio::test]
async fn test_stop_without_clear_keeps_relay_folder() {
    let relay = start_relay(|_| {}).await;
    let local = TempDir::new().unwrap();
    std::fs::write(local.path().join("keep.txt"), "k").unwrap();

    let mut session = session_for(local.path(), &relay, |config| {
        config.client.clear_on_stop = false;
    });
    session.start_sync().await.unwrap();
    assert!(wait_for_file(&relay.root.path().join("keep.txt")).await.is_some());

    session.stop_sync().await.unwrap();
    assert!(relay.root.path().join("keep.txt").exists());
    relay.stop().await;
}

#[tokio::test]
async fn test_running_session_applies_remote_changes() {
    let relay = start_relay(|_| {}).await;
    let mut remote = TestClient::connect(relay.addr).await;

    let local = TempDir::new().unwrap();
    let mut session = session_for(local.path(), &relay, |config| {
        config.client.clear_on_stop = false;
    });
    let (events, _subscription) = record_events(&session);
    session.start_sync().await.unwrap();

    let (_local_tx, mut local_rx) = mpsc::unbounded_channel();
    let (stop, stop_rx) = oneshot::channel::<()>();
    let running = tokio::spawn(async move {
        session
            .run(&mut local_rx, async {
                let _ = stop_rx.await;
            })
            .await
            .map(|()| session)
    });

    remote.send(sync_file("from-remote.md", "# hi")).await;
    assert_eq!(remote.recv().await["type"], "FILE_SYNCED");
    assert_eq!(
        wait_for_file(&local.path().join("from-remote.md")).await.as_deref(),
        Some("# hi")
    );

    remote
        .send(json!({"type": "DELETE_FILE", "payload": {"relativePath": "from-remote.md"}}))
        .await;
    assert_eq!(remote.recv().await["type"], "FILE_DELETED_CONFIRMED");
    assert!(wait_for_removal(&local.path().join("from-remote.md")).await);

    let _ = stop.send(());
    let session = running.await.unwrap().unwrap();
    assert_eq!(session.state(), SessionState::Idle);

    let events = events.lock().unwrap();
    assert!(events.contains(&SyncEvent::FileCreated {
        path: "from-remote.md".into()
    }));
    assert!(events.contains(&SyncEvent::FileDeleted {
        path: "from-remote.md".into()
    }));

    relay.stop().await;
}

#[tokio::test]
async fn test_running_session_forwards_local_changes() {
    let relay = start_relay(|_| {}).await;
    let mut remote = TestClient::connect(relay.addr).await;

    let local = TempDir::new().unwrap();
    let mut session = session_for(local.path(), &relay, |config| {
        config.client.clear_on_stop = false;
    });
    session.start_sync().await.unwrap();

    let (local_tx, mut local_rx) = mpsc::unbounded_channel();
    let (stop, stop_rx) = oneshot::channel::<()>();
    let running = tokio::spawn(async move {
        session
            .run(&mut local_rx, async {
                let _ = stop_rx.await;
            })
            .await
    });

    std::fs::write(local.path().join("draft.txt"), "v1").unwrap();
    local_tx
        .send(filesync_core::LocalEvent::Modified("draft.txt".into()))
        .unwrap();

    let update = remote.recv().await;
    assert_eq!(update["type"], "FILE_UPDATED");
    assert_eq!(update["payload"]["relativePath"], "draft.txt");
    assert_eq!(update["payload"]["fileContent"], "v1");

    let _ = stop.send(());
    running.await.unwrap().unwrap();
    relay.stop().await;
}
