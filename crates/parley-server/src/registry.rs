//! Registry of live client connections.
//!
//! Connections are indexed by id, by session and by user. All three tables
//! live behind one lock and are mutated together, so an index never names a
//! connection that is missing from the primary table and never keeps an
//! empty entry.
//!
//! Sends snapshot the target ids under the lock, release it, and only then
//! write to the transports. A slow or broken client never blocks other sends
//! or registry mutations.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use parley_cache::ClientInfo;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Create a new unique connection ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error writing to a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer has gone away.
    #[error("Transport closed")]
    Closed,

    /// The write failed.
    #[error("Transport write failed: {0}")]
    Write(String),
}

/// Outbound half of a client connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one text frame.
    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    /// Close the connection. Errors are ignored.
    async fn close(&self);
}

/// Error from [`ConnectionRegistry::try_send`].
#[derive(Debug, Error)]
pub enum SendError {
    /// No connection with this id is registered.
    #[error("Connection {0} is not registered")]
    NotConnected(ConnectionId),

    /// The message could not be encoded.
    #[error("Failed to encode message: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The transport rejected the write.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Snapshot of one registered connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub connection_id: ConnectionId,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub client_info: ClientInfo,
    pub is_active: bool,
}

/// Observability snapshot of the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_connections: usize,
    pub total_sessions: usize,
    pub total_users: usize,
    /// Connection count per session.
    pub sessions: BTreeMap<String, usize>,
    /// Connection count per user.
    pub users: BTreeMap<String, usize>,
}

struct Entry {
    info: Connection,
    transport: Arc<dyn Transport>,
}

#[derive(Default)]
struct Tables {
    connections: HashMap<ConnectionId, Entry>,
    by_session: HashMap<String, HashSet<ConnectionId>>,
    by_user: HashMap<String, HashSet<ConnectionId>>,
}

fn unindex(index: &mut HashMap<String, HashSet<ConnectionId>>, key: &str, id: ConnectionId) {
    if let Some(ids) = index.get_mut(key) {
        ids.remove(&id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

/// In-memory table of live connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    tables: RwLock<Tables>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and return its new id.
    pub fn connect(
        &self,
        transport: Arc<dyn Transport>,
        session_id: impl Into<String>,
        user_id: Option<String>,
        client_info: ClientInfo,
    ) -> ConnectionId {
        let id = ConnectionId::new();
        let now = Utc::now();
        let info = Connection {
            connection_id: id,
            session_id: session_id.into(),
            user_id,
            connected_at: now,
            last_activity: now,
            client_info,
            is_active: true,
        };

        let mut tables = self.tables.write();
        tables
            .by_session
            .entry(info.session_id.clone())
            .or_default()
            .insert(id);
        if let Some(user_id) = &info.user_id {
            tables.by_user.entry(user_id.clone()).or_default().insert(id);
        }
        debug!(
            connection_id = %id,
            session_id = %info.session_id,
            user_id = ?info.user_id,
            "Connection registered"
        );
        tables.connections.insert(id, Entry { info, transport });

        id
    }

    /// Remove a connection from every table. Unknown ids are a no-op.
    pub fn disconnect(&self, id: ConnectionId) -> Option<Connection> {
        let mut tables = self.tables.write();
        let entry = tables.connections.remove(&id)?;

        unindex(&mut tables.by_session, &entry.info.session_id, id);
        if let Some(user_id) = &entry.info.user_id {
            unindex(&mut tables.by_user, user_id, id);
        }
        drop(tables);

        debug!(connection_id = %id, session_id = %entry.info.session_id, "Connection removed");
        let mut info = entry.info;
        info.is_active = false;
        Some(info)
    }

    fn transport(&self, id: ConnectionId) -> Option<Arc<dyn Transport>> {
        self.tables
            .read()
            .connections
            .get(&id)
            .map(|entry| Arc::clone(&entry.transport))
    }

    async fn try_send_text(&self, text: String, id: ConnectionId) -> Result<(), SendError> {
        let transport = self.transport(id).ok_or(SendError::NotConnected(id))?;
        transport.send_text(text).await?;
        Ok(())
    }

    async fn send_text_personal(&self, text: String, id: ConnectionId) -> bool {
        match self.try_send_text(text, id).await {
            Ok(()) => true,
            Err(SendError::NotConnected(_)) => false,
            Err(e) => {
                warn!(connection_id = %id, error = %e, "Send failed, dropping connection");
                self.disconnect(id);
                false
            }
        }
    }

    /// Write a message to one connection, with no side effects on failure.
    pub async fn try_send<T: Serialize + ?Sized>(
        &self,
        message: &T,
        id: ConnectionId,
    ) -> Result<(), SendError> {
        let text = serde_json::to_string(message)?;
        self.try_send_text(text, id).await
    }

    /// Write a message to one connection. A connection whose transport
    /// fails is disconnected. Returns whether the write succeeded.
    pub async fn send_personal<T: Serialize + ?Sized>(&self, message: &T, id: ConnectionId) -> bool {
        match serde_json::to_string(message) {
            Ok(text) => self.send_text_personal(text, id).await,
            Err(e) => {
                warn!(connection_id = %id, error = %e, "Failed to encode message");
                false
            }
        }
    }

    async fn fan_out<T: Serialize + ?Sized>(&self, message: &T, ids: Vec<ConnectionId>) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to encode fan-out message");
                return 0;
            }
        };

        let sends = ids
            .into_iter()
            .map(|id| self.send_text_personal(text.clone(), id));
        let delivered = join_all(sends).await.into_iter().filter(|ok| *ok).count();
        trace!(delivered, "Fan-out complete");
        delivered
    }

    /// Send to every connection of a session. Returns successful deliveries.
    pub async fn send_to_session<T: Serialize + ?Sized>(&self, message: &T, session_id: &str) -> usize {
        let ids = self.connections_for_session(session_id);
        self.fan_out(message, ids).await
    }

    /// Send to every connection of a user. Returns successful deliveries.
    pub async fn send_to_user<T: Serialize + ?Sized>(&self, message: &T, user_id: &str) -> usize {
        let ids = self.connections_for_user(user_id);
        self.fan_out(message, ids).await
    }

    /// Send to every connection. Returns successful deliveries.
    pub async fn broadcast<T: Serialize + ?Sized>(&self, message: &T) -> usize {
        let ids: Vec<ConnectionId> = self.tables.read().connections.keys().copied().collect();
        self.fan_out(message, ids).await
    }

    /// Record activity on a connection. Returns whether it is registered.
    pub fn touch(&self, id: ConnectionId) -> bool {
        match self.tables.write().connections.get_mut(&id) {
            Some(entry) => {
                entry.info.last_activity = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Snapshot of one connection.
    pub fn get(&self, id: ConnectionId) -> Option<Connection> {
        self.tables
            .read()
            .connections
            .get(&id)
            .map(|entry| entry.info.clone())
    }

    /// Whether a connection is registered.
    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.tables.read().connections.contains_key(&id)
    }

    /// Ids of the connections attached to a session.
    pub fn connections_for_session(&self, session_id: &str) -> Vec<ConnectionId> {
        self.tables
            .read()
            .by_session
            .get(session_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Ids of the connections belonging to a user.
    pub fn connections_for_user(&self, user_id: &str) -> Vec<ConnectionId> {
        self.tables
            .read()
            .by_user
            .get(user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.tables.read().connections.len()
    }

    /// Whether no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Observability snapshot.
    pub fn stats(&self) -> RegistryStats {
        let tables = self.tables.read();
        RegistryStats {
            total_connections: tables.connections.len(),
            total_sessions: tables.by_session.len(),
            total_users: tables.by_user.len(),
            sessions: tables
                .by_session
                .iter()
                .map(|(id, ids)| (id.clone(), ids.len()))
                .collect(),
            users: tables
                .by_user
                .iter()
                .map(|(id, ids)| (id.clone(), ids.len()))
                .collect(),
        }
    }

    #[cfg(test)]
    fn check_invariants(&self) -> Result<(), String> {
        let tables = self.tables.read();
        for (name, index) in [("session", &tables.by_session), ("user", &tables.by_user)] {
            for (key, ids) in index {
                if ids.is_empty() {
                    return Err(format!("empty {name} index entry '{key}'"));
                }
                for id in ids {
                    if !tables.connections.contains_key(id) {
                        return Err(format!("{name} index '{key}' names missing {id}"));
                    }
                }
            }
        }
        for (id, entry) in &tables.connections {
            let indexed = tables
                .by_session
                .get(&entry.info.session_id)
                .is_some_and(|ids| ids.contains(id));
            if !indexed {
                return Err(format!("{id} missing from its session index"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Transport that records frames and can be told to fail.
    #[derive(Default)]
    pub struct MockTransport {
        pub sent: Mutex<Vec<String>>,
        pub fail: AtomicBool,
        pub closed: AtomicBool,
    }

    impl MockTransport {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn failing() -> Arc<Self> {
            let transport = Self::default();
            transport.fail.store(true, Ordering::SeqCst);
            Arc::new(transport)
        }

        pub fn frames(&self) -> Vec<serde_json::Value> {
            self.sent
                .lock()
                .iter()
                .map(|text| serde_json::from_str(text).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send_text(&self, text: String) -> Result<(), TransportError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            self.sent.lock().push(text);
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}
