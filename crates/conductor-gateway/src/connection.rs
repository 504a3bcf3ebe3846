use conductor_core::Channel;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

/// Represents a connected observer.
#[derive(Debug)]
pub struct Connection {
    /// Connection id.
    pub id: Uuid,
    /// Outbound queue drained by the socket writer.
    pub tx: mpsc::UnboundedSender<String>,
    /// Subscribed channels.
    pub channels: HashSet<Channel>,
    heartbeat: Option<JoinHandle<()>>,
}

impl Connection {
    /// A connection with no subscriptions.
    pub fn new(id: Uuid, tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id,
            tx,
            channels: HashSet::new(),
            heartbeat: None,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }
}

/// Manages active observer connections and their channel subscriptions.
///
/// Subscriptions live only as long as the connection; nothing is persisted.
pub struct ConnectionManager {
    connections: RwLock<HashMap<Uuid, Connection>>,
}

impl ConnectionManager {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Track a new connection.
    pub async fn add(&self, conn: Connection) {
        let id = conn.id;
        self.connections.write().await.insert(id, conn);
        tracing::info!(connection_id = %id, "Connection added");
    }

    /// Remove a connection, dropping its subscriptions and stopping its heartbeat.
    pub async fn remove(&self, id: Uuid) -> bool {
        let removed = self.connections.write().await.remove(&id).is_some();
        if removed {
            tracing::info!(connection_id = %id, "Connection removed");
        }
        removed
    }

    /// Attach the heartbeat task owned by a connection. Aborted on removal.
    pub async fn set_heartbeat(&self, id: Uuid, handle: JoinHandle<()>) {
        match self.connections.write().await.get_mut(&id) {
            Some(conn) => {
                if let Some(previous) = conn.heartbeat.replace(handle) {
                    previous.abort();
                }
            }
            None => handle.abort(),
        }
    }

    /// Add channels to a connection's subscriptions. Returns the resulting set.
    pub async fn subscribe(&self, id: Uuid, channels: &[Channel]) -> Option<Vec<Channel>> {
        let mut conns = self.connections.write().await;
        let conn = conns.get_mut(&id)?;
        conn.channels.extend(channels.iter().copied());
        Some(sorted(&conn.channels))
    }

    /// Remove channels from a connection's subscriptions. Returns the resulting set.
    pub async fn unsubscribe(&self, id: Uuid, channels: &[Channel]) -> Option<Vec<Channel>> {
        let mut conns = self.connections.write().await;
        let conn = conns.get_mut(&id)?;
        for channel in channels {
            conn.channels.remove(channel);
        }
        Some(sorted(&conn.channels))
    }

    /// Channels a connection is subscribed to, sorted. `None` if unknown.
    pub async fn subscriptions(&self, id: Uuid) -> Option<Vec<Channel>> {
        self.connections
            .read()
            .await
            .get(&id)
            .map(|c| sorted(&c.channels))
    }

    /// Send to one connection. A closed connection is skipped, never an error.
    pub async fn send_to(&self, id: Uuid, message: &str) -> bool {
        let conns = self.connections.read().await;
        match conns.get(&id) {
            Some(conn) => deliver(conn, message),
            None => false,
        }
    }

    /// Deliver to every connection subscribed to `channel`. Returns how many
    /// connections accepted the message.
    pub async fn broadcast(&self, channel: Channel, message: &str) -> usize {
        let conns = self.connections.read().await;
        conns
            .values()
            .filter(|c| c.channels.contains(&channel))
            .filter(|c| deliver(c, message))
            .count()
    }

    /// Number of open connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Connections subscribed to `channel`.
    pub async fn subscriber_count(&self, channel: Channel) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| c.channels.contains(&channel))
            .count()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }
}

fn deliver(conn: &Connection, message: &str) -> bool {
    if conn.tx.send(message.to_string()).is_err() {
        debug!(connection_id = %conn.id, "Dropping message for closed connection");
        return false;
    }
    true
}

fn sorted(channels: &HashSet<Channel>) -> Vec<Channel> {
    let mut all: Vec<Channel> = channels.iter().copied().collect();
    all.sort();
    all
}
