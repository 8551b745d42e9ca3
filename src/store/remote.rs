//! WebSocket Client für das Store-Relay
//!
//! Implementiert den Store-Vertrag über eine WebSocket-Verbindung:
//! - Anfragen mit `requestId` und Warten auf `ack`/`value`/`error`
//! - Watch-Events über `watchId` an die jeweiligen Beobachter
//! - Disconnect-Hooks werden serverseitig ausgeführt
//! - Heartbeat gegen den Idle-Timeout des Relays

use super::protocol::{ClientMessage, ServerMessage};
use super::{split_path, Store, StoreError, Watch};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Maximale Wartezeit auf eine Server-Antwort
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, StoreError>>>;
type WatchMap = HashMap<u64, mpsc::UnboundedSender<Value>>;

// ============================================================================
// EVENTS
// ============================================================================

/// Verbindungs-Events des RemoteStore
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStoreEvent {
    Connected,
    Disconnected,
    Error { code: i32, message: String },
}

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
}

// ============================================================================
// REMOTE STORE
// ============================================================================

/// Store-Adapter über WebSocket
pub struct RemoteStore {
    server_url: String,
    state: Arc<RwLock<ClientState>>,
    tx: mpsc::Sender<String>,
    pending: Arc<Mutex<PendingMap>>,
    watches: Arc<Mutex<WatchMap>>,
    next_id: AtomicU64,
    event_tx: broadcast::Sender<RemoteStoreEvent>,
}

impl RemoteStore {
    /// Verbindet mit dem Relay
    pub async fn connect(server_url: &str) -> Result<Arc<Self>, StoreError> {
        let ws_url = Self::websocket_url(server_url)?;

        tracing::info!("Connecting to store relay: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(100);
        let (event_tx, _) = broadcast::channel(100);

        let store = Arc::new(Self {
            server_url: ws_url.to_string(),
            state: Arc::new(RwLock::new(ClientState { is_connected: true })),
            tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
            watches: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            event_tx,
        });

        let _ = store.event_tx.send(RemoteStoreEvent::Connected);

        // Read-Task
        let state = Arc::clone(&store.state);
        let pending = Arc::clone(&store.pending);
        let watches = Arc::clone(&store.watches);
        let event_tx = store.event_tx.clone();

        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(server_msg) => {
                            Self::handle_server_message(server_msg, &pending, &watches, &event_tx)
                        }
                        Err(e) => tracing::warn!("Unparseable store message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("Store connection closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Store connection error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state.write().is_connected = false;

            // Offene Anfragen scheitern, Beobachtungen enden
            for (_, waiter) in pending.lock().drain() {
                let _ = waiter.send(Err(StoreError::NotConnected));
            }
            watches.lock().clear();

            let _ = event_tx.send(RemoteStoreEvent::Disconnected);
        });

        // Write-Task
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send store message: {}", e);
                    break;
                }
            }
        });

        Ok(store)
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<RemoteStoreEvent> {
        self.event_tx.subscribe()
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Startet einen Heartbeat-Task
    pub fn start_heartbeat(self: &Arc<Self>, every: Duration) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                if !store.is_connected() {
                    tracing::info!("Heartbeat: store disconnected, stopping heartbeat task");
                    break;
                }
                if let Err(e) = store.send(&ClientMessage::Ping) {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                }
            }
        });
    }

    /// http(s) wird zu ws(s), alles andere muss bereits ws(s) sein
    fn websocket_url(server_url: &str) -> Result<url::Url, StoreError> {
        let mut url =
            url::Url::parse(server_url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(StoreError::Unavailable(format!(
                    "unsupported scheme: {}",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| StoreError::Unavailable(server_url.to_string()))?;
        Ok(url)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Sendet eine Nachricht (non-blocking)
    fn send(&self, msg: &ClientMessage) -> Result<(), StoreError> {
        if !self.is_connected() {
            return Err(StoreError::NotConnected);
        }
        let text =
            serde_json::to_string(msg).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        self.tx
            .try_send(text)
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    /// Sendet eine Anfrage und wartet auf die Antwort
    async fn request(&self, request_id: u64, msg: ClientMessage) -> Result<Value, StoreError> {
        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.pending.lock().insert(request_id, waiter_tx);

        if let Err(e) = self.send(&msg) {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        tokio::select! {
            result = waiter_rx => result.unwrap_or(Err(StoreError::NotConnected)),
            _ = tokio::time::sleep(REQUEST_TIMEOUT) => {
                self.pending.lock().remove(&request_id);
                Err(StoreError::Timeout)
            }
        }
    }

    /// Verarbeitet eingehende Server-Nachrichten
    fn handle_server_message(
        msg: ServerMessage,
        pending: &Arc<Mutex<PendingMap>>,
        watches: &Arc<Mutex<WatchMap>>,
        event_tx: &broadcast::Sender<RemoteStoreEvent>,
    ) {
        match msg {
            ServerMessage::Ack { request_id } => {
                if let Some(waiter) = pending.lock().remove(&request_id) {
                    let _ = waiter.send(Ok(Value::Null));
                }
            }

            ServerMessage::Value { request_id, value } => {
                if let Some(waiter) = pending.lock().remove(&request_id) {
                    let _ = waiter.send(Ok(value));
                }
            }

            ServerMessage::Event { watch_id, value } => {
                let mut watches = watches.lock();
                let closed = match watches.get(&watch_id) {
                    Some(tx) => tx.send(value).is_err(),
                    None => {
                        tracing::debug!("Event for unknown watch {}", watch_id);
                        false
                    }
                };
                if closed {
                    watches.remove(&watch_id);
                }
            }

            ServerMessage::Error {
                request_id,
                code,
                message,
            } => {
                tracing::error!("Store error {}: {}", code, message);
                if let Some(waiter) = request_id.and_then(|id| pending.lock().remove(&id)) {
                    let _ = waiter.send(Err(StoreError::Rejected {
                        code,
                        message: message.clone(),
                    }));
                }
                let _ = event_tx.send(RemoteStoreEvent::Error { code, message });
            }

            ServerMessage::Pong => {
                // Heartbeat-Response - nichts zu tun
            }
        }
    }
}

#[async_trait]
impl Store for RemoteStore {
    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        split_path(path)?;
        let request_id = self.next_id();
        let msg = ClientMessage::Set {
            request_id,
            path: path.to_string(),
            value,
        };
        self.request(request_id, msg).await.map(|_| ())
    }

    async fn get(&self, path: &str) -> Result<Value, StoreError> {
        split_path(path)?;
        let request_id = self.next_id();
        let msg = ClientMessage::Get {
            request_id,
            path: path.to_string(),
        };
        self.request(request_id, msg).await
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        self.set(path, Value::Null).await
    }

    async fn watch(&self, path: &str) -> Result<Watch, StoreError> {
        split_path(path)?;
        let request_id = self.next_id();
        let watch_id = self.next_id();

        // Vor der Anfrage registrieren, damit der Snapshot nicht verloren geht
        let (tx, rx) = mpsc::unbounded_channel();
        self.watches.lock().insert(watch_id, tx);

        let msg = ClientMessage::Watch {
            request_id,
            watch_id,
            path: path.to_string(),
        };
        if let Err(e) = self.request(request_id, msg).await {
            self.watches.lock().remove(&watch_id);
            return Err(e);
        }

        let watches = Arc::clone(&self.watches);
        let sender = self.tx.clone();
        Ok(Watch::new(rx, move || {
            watches.lock().remove(&watch_id);
            if let Ok(text) = serde_json::to_string(&ClientMessage::Unwatch { watch_id }) {
                let _ = sender.try_send(text);
            }
        }))
    }

    async fn on_disconnect_set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        split_path(path)?;
        let request_id = self.next_id();
        let msg = ClientMessage::OnDisconnectSet {
            request_id,
            path: path.to_string(),
            value,
        };
        self.request(request_id, msg).await.map(|_| ())
    }
}

impl std::fmt::Debug for RemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStore")
            .field("server_url", &self.server_url)
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
