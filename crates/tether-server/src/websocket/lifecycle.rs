//! Per-connection state machine.
//!
//! ```text
//! Connecting ─► Handshaking ─► Active ─► Closing ─► Closed
//!      │              │                               ▲
//!      └──────────────┴───────────────────────────────┘
//! ```

use std::fmt;

use tracing::{debug, error};

/// Where a connection is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Upgrade in progress.
    Connecting,
    /// Upgraded; waiting for the handshake message.
    Handshaking,
    /// Registered and processing envelopes.
    Active,
    /// Shutting down the transport.
    Closing,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    /// Whether `self → to` is a legal edge.
    pub fn can_transition(self, to: Self) -> bool {
        use ConnectionState::{Active, Closed, Closing, Connecting, Handshaking};
        matches!(
            (self, to),
            (Connecting, Handshaking | Closed)
                | (Handshaking, Active | Closed)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        self == Self::Closed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// A close code and reason sent in a close frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloseReason {
    /// RFC 6455 status code (4000-4999 are application codes).
    pub code: u16,
    /// Short human-readable reason.
    pub reason: &'static str,
}

impl CloseReason {
    /// A handler failed or panicked.
    pub const INTERNAL_ERROR: Self = Self {
        code: 1011,
        reason: "internal error",
    };
    /// The server is stopping.
    pub const SHUTTING_DOWN: Self = Self {
        code: 1001,
        reason: "server shutting down",
    };
    /// No Pong arrived within the heartbeat timeout.
    pub const HEARTBEAT_TIMEOUT: Self = Self {
        code: 1001,
        reason: "heartbeat timeout",
    };
}

/// Tracks the current state and logs every transition.
#[derive(Debug)]
pub struct Lifecycle {
    state: ConnectionState,
}

impl Lifecycle {
    /// Start in [`ConnectionState::Connecting`].
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Connecting,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `to` if legal. Illegal moves are logged and ignored.
    pub fn transition(&mut self, to: ConnectionState) -> bool {
        if self.state.can_transition(to) {
            debug!(from = %self.state, to = %to, "connection state change");
            self.state = to;
            true
        } else {
            error!(from = %self.state, to = %to, "illegal connection state transition");
            false
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
