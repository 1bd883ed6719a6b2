//! Client id → live connection map.
//!
//! At most one connection per client id. Registration is a single
//! entry-API check-and-insert; removal only succeeds for the connection
//! serial that inserted the entry, so a stale task can never evict a newer
//! connection with the same client id.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tether_core::ids::{ClientId, ConnectionId};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::connection::{Connection, Outbound};
use super::handshake::{HandshakeRequest, RejectReason};

/// Registry of live connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ClientId, Arc<Connection>>,
    next_id: AtomicU64,
    occupied: AtomicUsize,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Registry admitting at most `max_connections` connections.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            occupied: AtomicUsize::new(0),
            max_connections,
        }
    }

    /// Register a connection for `request.client_id`.
    ///
    /// The returned [`Registration`] unregisters on drop.
    pub fn try_register(
        self: &Arc<Self>,
        request: HandshakeRequest,
        tx: mpsc::Sender<Outbound>,
    ) -> Result<Registration, RejectReason> {
        match self.connections.entry(request.client_id.clone()) {
            Entry::Occupied(_) => Err(RejectReason::DuplicateClientId),
            Entry::Vacant(slot) => {
                if !self.reserve_slot() {
                    return Err(RejectReason::CapacityReached);
                }
                let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
                let connection = Arc::new(Connection::new(id, request, tx));
                let _ = slot.insert(Arc::clone(&connection));
                debug!(
                    client_id = %connection.client_id(),
                    connection_id = %id,
                    "connection registered"
                );
                Ok(Registration {
                    registry: Arc::clone(self),
                    connection,
                })
            }
        }
    }

    /// Remove `client_id` if it is still held by `connection_id`.
    ///
    /// Returns whether an entry was removed. Calling it twice is harmless.
    pub fn unregister(&self, client_id: &str, connection_id: ConnectionId) -> bool {
        let removed = self
            .connections
            .remove_if(client_id, |_, conn| conn.id() == connection_id)
            .is_some();
        if removed {
            let _ = self.occupied.fetch_sub(1, Ordering::AcqRel);
            debug!(client_id, connection_id = %connection_id, "connection unregistered");
        }
        removed
    }

    /// Live connection for a client id.
    pub fn get(&self, client_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(client_id).map(|c| Arc::clone(c.value()))
    }

    /// Whether a client id is connected.
    pub fn contains(&self, client_id: &str) -> bool {
        self.connections.contains_key(client_id)
    }

    /// Number of live connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Connected client ids, sorted.
    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.connections.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Queue `message` for one client.
    ///
    /// Returns `false` for unknown clients or a full/closed queue.
    pub fn send_to(&self, client_id: &str, message: &Value) -> bool {
        let Some(connection) = self.get(client_id) else {
            debug!(client_id, "send to unknown client");
            return false;
        };
        let sent = connection.send_json(message);
        if !sent {
            warn!(
                client_id,
                dropped = connection.drop_count(),
                "outbound queue full or closed, message dropped"
            );
        }
        sent
    }

    /// Queue `message` for every connection that declared `session_id`.
    ///
    /// Returns how many connections accepted it.
    pub fn broadcast_to_session(&self, session_id: &str, message: &Value) -> usize {
        let Ok(text) = serde_json::to_string(message) else {
            return 0;
        };
        let text = Arc::new(text);
        let targets: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|e| e.value().session_id().is_some_and(|s| s.as_str() == session_id))
            .map(|e| Arc::clone(e.value()))
            .collect();
        targets
            .iter()
            .filter(|conn| conn.send(Arc::clone(&text)))
            .count()
    }

    fn reserve_slot(&self) -> bool {
        self.occupied
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_connections).then_some(n + 1)
            })
            .is_ok()
    }
}

/// Ownership of a registry entry; dropping it unregisters the connection.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    connection: Arc<Connection>,
}

impl Registration {
    /// The registered connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

impl std::ops::Deref for Registration {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let _ = self
            .registry
            .unregister(self.connection.client_id(), self.connection.id());
    }
}
