//! Handshake parsing.
//!
//! The first frame on a connection must be
//! `{"type":"connect","client_id":..,"token":..}` with optional
//! `world_info`, `user_info` and `session_id`. Parsing is pure; the
//! connection task turns a rejection into a close frame.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value, json};
use tether_core::errors::ErrorKind;
use tether_core::ids::{ClientId, SessionId};

use super::lifecycle::CloseReason;

/// Longest accepted `client_id`, in bytes.
pub const MAX_CLIENT_ID_LEN: usize = 128;
/// Longest accepted pass-through `session_id`, in bytes.
pub const MAX_SESSION_ID_LEN: usize = 256;

/// A validated handshake.
#[derive(Clone, Debug, PartialEq)]
pub struct HandshakeRequest {
    /// Client-chosen id, unique while connected.
    pub client_id: ClientId,
    /// Opaque client token.
    pub token: String,
    /// Optional client world metadata.
    pub world_info: Option<Value>,
    /// Optional client user metadata.
    pub user_info: Option<Value>,
    /// Session the client says it belongs to.
    pub session_id: Option<SessionId>,
}

/// Why a handshake was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// Not JSON, not an object, or a field of the wrong type or size.
    InvalidPayload,
    /// `type` is absent or not `"connect"`.
    NotHandshake,
    /// `client_id` is absent or blank.
    MissingClientId,
    /// `token` is absent or blank.
    MissingToken,
    /// Another live connection holds this `client_id`.
    DuplicateClientId,
    /// Binary first frame that is not UTF-8.
    NonTextFrame,
    /// No first message within the handshake timeout.
    Timeout,
    /// The registry is full.
    CapacityReached,
}

impl RejectReason {
    /// Close code and reason for this rejection.
    pub fn close_reason(self) -> CloseReason {
        let (code, reason) = match self {
            Self::InvalidPayload => (1008, "invalid handshake payload"),
            Self::NotHandshake => (1008, "expected connect message"),
            Self::MissingClientId => (1008, "missing client_id"),
            Self::MissingToken => (1008, "missing token"),
            Self::DuplicateClientId => (1008, "client_id already connected"),
            Self::NonTextFrame => (1003, "unsupported frame"),
            Self::Timeout => (4408, "handshake timeout"),
            Self::CapacityReached => (1013, "server at capacity"),
        };
        CloseReason { code, reason }
    }

    /// Metric label.
    pub fn label(self) -> &'static str {
        match self {
            Self::InvalidPayload => "invalid_payload",
            Self::NotHandshake => "not_handshake",
            Self::MissingClientId => "missing_client_id",
            Self::MissingToken => "missing_token",
            Self::DuplicateClientId => "duplicate_client_id",
            Self::NonTextFrame => "non_text_frame",
            Self::Timeout => "timeout",
            Self::CapacityReached => "capacity_reached",
        }
    }

    /// Taxonomy bucket.
    pub fn kind(self) -> ErrorKind {
        match self {
            Self::InvalidPayload | Self::MissingClientId | Self::MissingToken => {
                ErrorKind::Validation
            }
            Self::NotHandshake | Self::DuplicateClientId | Self::NonTextFrame | Self::Timeout => {
                ErrorKind::ProtocolViolation
            }
            Self::CapacityReached => ErrorKind::Internal,
        }
    }
}

/// Result of [`parse_handshake`].
#[derive(Clone, Debug, PartialEq)]
pub enum HandshakeOutcome {
    /// Well-formed handshake.
    Accepted(HandshakeRequest),
    /// Refused, with the reason for the close frame.
    Rejected(RejectReason),
}

/// Parse and validate a handshake frame.
pub fn parse_handshake(text: &str) -> HandshakeOutcome {
    match parse(text) {
        Ok(request) => HandshakeOutcome::Accepted(request),
        Err(reason) => HandshakeOutcome::Rejected(reason),
    }
}

/// The `connected` acknowledgement sent after registration.
pub fn handshake_ack(client_id: &ClientId, now: DateTime<Utc>) -> Value {
    json!({
        "type": "connected",
        "data": {
            "client_id": client_id,
            "server_time": now.to_rfc3339_opts(SecondsFormat::Millis, true),
            "message": format!("Welcome, {client_id}"),
        },
    })
}

fn parse(text: &str) -> Result<HandshakeRequest, RejectReason> {
    let value: Value = serde_json::from_str(text).map_err(|_| RejectReason::InvalidPayload)?;
    let Value::Object(obj) = value else {
        return Err(RejectReason::InvalidPayload);
    };

    if obj.get("type").and_then(Value::as_str) != Some("connect") {
        return Err(RejectReason::NotHandshake);
    }

    let client_id = trimmed_string(&obj, "client_id")?.ok_or(RejectReason::MissingClientId)?;
    if client_id.len() > MAX_CLIENT_ID_LEN {
        return Err(RejectReason::InvalidPayload);
    }
    let token = trimmed_string(&obj, "token")?.ok_or(RejectReason::MissingToken)?;

    let session_id = trimmed_string(&obj, "session_id")?;
    if session_id.as_ref().is_some_and(|s| s.len() > MAX_SESSION_ID_LEN) {
        return Err(RejectReason::InvalidPayload);
    }

    Ok(HandshakeRequest {
        client_id: ClientId::from(client_id),
        token,
        world_info: metadata(&obj, "world_info"),
        user_info: metadata(&obj, "user_info"),
        session_id: session_id.map(SessionId::from),
    })
}

/// `Ok(None)` when absent, null or blank; `Err` when not a string.
fn trimmed_string(obj: &Map<String, Value>, key: &str) -> Result<Option<String>, RejectReason> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let s = s.trim();
            Ok((!s.is_empty()).then(|| s.to_owned()))
        }
        Some(_) => Err(RejectReason::InvalidPayload),
    }
}

fn metadata(obj: &Map<String, Value>, key: &str) -> Option<Value> {
    obj.get(key).filter(|v| !v.is_null()).cloned()
}
