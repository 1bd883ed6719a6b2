//! One live client connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tether_core::ids::{ClientId, ConnectionId, SessionId};
use tokio::sync::mpsc;

use super::handshake::HandshakeRequest;
use super::lifecycle::CloseReason;

/// Item on a connection's outbound queue.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    /// A serialized JSON text frame.
    Text(Arc<String>),
    /// Close the transport, with a close frame when a reason is given.
    Close(Option<CloseReason>),
}

/// A registered client connection.
///
/// Holds the sending half of the queue drained by the connection's writer
/// task; everything else is metadata from the handshake.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    client_id: ClientId,
    token: String,
    session_id: Option<SessionId>,
    world_info: Option<Value>,
    user_info: Option<Value>,
    connected_at: DateTime<Utc>,
    started: Instant,
    tx: mpsc::Sender<Outbound>,
    last_pong: Mutex<Instant>,
    dropped_messages: AtomicU64,
}

impl Connection {
    /// Build from an accepted handshake.
    pub fn new(id: ConnectionId, request: HandshakeRequest, tx: mpsc::Sender<Outbound>) -> Self {
        let now = Instant::now();
        Self {
            id,
            client_id: request.client_id,
            token: request.token,
            session_id: request.session_id,
            world_info: request.world_info,
            user_info: request.user_info,
            connected_at: Utc::now(),
            started: now,
            tx,
            last_pong: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Registry-assigned serial.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Client id from the handshake.
    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Opaque client token from the handshake.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Session the client declared, if any.
    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    /// Client world metadata.
    pub fn world_info(&self) -> Option<&Value> {
        self.world_info.as_ref()
    }

    /// Client user metadata.
    pub fn user_info(&self) -> Option<&Value> {
        self.user_info.as_ref()
    }

    /// Wall-clock registration time.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Time since registration.
    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    /// Queue a text frame.
    ///
    /// Returns `false` if the queue is full or closed, and counts the drop.
    pub fn send(&self, text: Arc<String>) -> bool {
        if self.tx.try_send(Outbound::Text(text)).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Serialize and queue a JSON value.
    pub fn send_json(&self, value: &Value) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.send(Arc::new(json)),
            Err(_) => false,
        }
    }

    /// Messages dropped because the queue was full or closed.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Record liveness (Pong or any inbound frame).
    pub fn mark_alive(&self) {
        *self.last_pong.lock() = Instant::now();
    }

    /// Time since the last sign of life.
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }
}
