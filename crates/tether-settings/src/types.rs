//! Settings type definitions.
//!
//! Field names are camelCase on the wire. Every section is
//! `#[serde(default)]`, so a partial settings file only needs the keys it
//! changes.

use serde::{Deserialize, Serialize};
use tether_core::logging::LogFormat;

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9000, "handshakeTimeoutMs": 5000 },
///   "session": { "timeoutMinutes": 60 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// HTTP/WebSocket server settings.
    pub server: ServerSettings,
    /// Session lifecycle settings.
    pub session: SessionSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl TetherSettings {
    /// Reject combinations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.session.timeout_minutes == 0 {
            return Err(SettingsError::InvalidValue(
                "session.timeoutMinutes must be at least 1".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxConnections must be at least 1".into(),
            ));
        }
        if self.server.handshake_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "server.handshakeTimeoutMs must be at least 1".into(),
            ));
        }
        if self.server.heartbeat_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatIntervalMs must be at least 1".into(),
            ));
        }
        if self.server.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server.sendQueueCapacity must be at least 1".into(),
            ));
        }
        if self.session.sweep_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "session.sweepIntervalSecs must be at least 1".into(),
            ));
        }
        if self.server.heartbeat_timeout_ms < self.server.heartbeat_interval_ms {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatTimeoutMs must not be shorter than heartbeatIntervalMs".into(),
            ));
        }
        if let Some(secret) = &self.session.csrf_secret {
            if secret.len() < 16 {
                return Err(SettingsError::InvalidValue(
                    "session.csrfSecret must be at least 16 bytes".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Server network and connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` auto-assigns).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// How long a new connection may take to send its handshake.
    pub handshake_timeout_ms: u64,
    /// Interval between server Ping frames.
    pub heartbeat_interval_ms: u64,
    /// Close a connection that has not answered a Ping for this long.
    pub heartbeat_timeout_ms: u64,
    /// Maximum inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Per-connection outbound queue depth.
    pub send_queue_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            max_connections: 256,
            handshake_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            max_message_size: 4 * 1024 * 1024,
            send_queue_capacity: 256,
        }
    }
}

/// Session lifecycle settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Sliding inactivity window.
    pub timeout_minutes: u32,
    /// Whether the background sweeper reclaims long-expired sessions.
    pub sweep_enabled: bool,
    /// Sweeper tick interval.
    pub sweep_interval_secs: u64,
    /// How long an expired session is kept before the sweeper drops it.
    pub sweep_grace_secs: u64,
    /// Fixed CSRF signing secret. A random per-process secret is used when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub csrf_secret: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout_minutes: 30,
            sweep_enabled: true,
            sweep_interval_secs: 60,
            sweep_grace_secs: 600,
            csrf_secret: None,
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level filter (overridden by `RUST_LOG`).
    pub level: String,
    /// stderr output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}
