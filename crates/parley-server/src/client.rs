use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use parley_core::ids::ConversationId;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

/// Unique identifier for one WebSocket connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl Default for ConnectionId {
    fn default() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }
}

impl ConnectionId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A connected WebSocket client and the conversations it subscribes to.
pub struct Connection {
    pub id: ConnectionId,
    joined: Mutex<HashSet<ConversationId>>,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    last_pong: AtomicU64,
}

impl Connection {
    fn new(id: ConnectionId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            joined: Mutex::new(HashSet::new()),
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn has_joined(&self, conversation_id: &ConversationId) -> bool {
        self.joined.lock().contains(conversation_id)
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < CLIENT_TIMEOUT.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of live connections and their conversation memberships.
///
/// Join and leave are idempotent. Broadcast is best effort per member:
/// a full queue or a torn-down connection skips that member and never
/// fails delivery to the others.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new connection and return its ID plus the receiving end
    /// of its outbound queue.
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.connections
            .insert(id.clone(), Arc::new(Connection::new(id.clone(), tx)));
        (id, rx)
    }

    /// Remove a connection; its memberships disappear with it.
    pub fn unregister(&self, id: &ConnectionId) {
        if let Some((_, connection)) = self.connections.remove(id) {
            connection.connected.store(false, Ordering::Relaxed);
        }
    }

    /// Add a connection to a conversation's session. Returns `true` when
    /// membership actually changed; re-joining is a no-op.
    pub fn join(&self, id: &ConnectionId, conversation_id: &ConversationId) -> bool {
        match self.connections.get(id) {
            Some(connection) => connection.joined.lock().insert(conversation_id.clone()),
            None => false,
        }
    }

    /// Remove a connection from a conversation's session. Removing an
    /// absent membership is a no-op.
    pub fn leave(&self, id: &ConnectionId, conversation_id: &ConversationId) -> bool {
        match self.connections.get(id) {
            Some(connection) => connection.joined.lock().remove(conversation_id),
            None => false,
        }
    }

    /// Send to one connection. Returns `false` if it is gone or its queue
    /// is full; the message is dropped, not retried.
    pub fn send_to(&self, id: &ConnectionId, message: String) -> bool {
        let Some(connection) = self.connections.get(id) else {
            return false;
        };
        match connection.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                tracing::warn!(
                    connection_id = %id,
                    msg_len = msg.len(),
                    "send queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Deliver to every live member of a conversation's session. Returns
    /// how many members the message reached.
    pub fn broadcast_to_conversation(&self, conversation_id: &ConversationId, message: &str) -> usize {
        let mut delivered = 0;
        for entry in self.connections.iter() {
            let connection = entry.value();
            if connection.is_connected() && connection.has_joined(conversation_id) {
                if connection.tx.try_send(message.to_string()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Number of registered connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Number of connections subscribed to a conversation.
    pub fn member_count(&self, conversation_id: &ConversationId) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().has_joined(conversation_id))
            .count()
    }

    /// Drop connections whose pongs stopped arriving.
    pub fn cleanup_dead_connections(&self) -> usize {
        let dead: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| !entry.value().is_alive())
            .map(|entry| entry.value().id.clone())
            .collect();

        let removed = dead.len();
        for id in dead {
            self.unregister(&id);
            tracing::info!(connection_id = %id, "cleaned up dead connection");
        }
        removed
    }

    #[cfg(test)]
    fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|e| Arc::clone(e.value()))
    }
}

/// Drive one WebSocket connection: a writer task forwarding the outbound
/// queue plus heartbeat pings, and a reader task feeding inbound text to
/// the RPC processor and recording pongs.
pub async fn handle_ws_connection(
    socket: WebSocket,
    connection_id: ConnectionId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ConnectionRegistry>,
    on_message: mpsc::Sender<(ConnectionId, String)>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_cid = connection_id.clone();
    let writer_registry = Arc::clone(&registry);
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }

        if let Some(connection) = writer_registry.connections.get(&writer_cid) {
            connection.connected.store(false, Ordering::Relaxed);
        }
    });

    let reader_cid = connection_id.clone();
    let reader_registry = Arc::clone(&registry);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    let _ = on_message.send((reader_cid.clone(), text.to_string())).await;
                }
                WsMessage::Pong(_) => {
                    if let Some(connection) = reader_registry.connections.get(&reader_cid) {
                        connection.record_pong();
                    }
                }
                WsMessage::Close(_) => break,
                WsMessage::Ping(_) => {} // axum replies automatically
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    registry.unregister(&connection_id);
}

/// Periodically sweep connections whose heartbeat stopped.
pub fn start_cleanup_task(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_dead_connections();
            if removed > 0 {
                tracing::info!(removed, "dead connection cleanup");
            }
        }
    })
}
