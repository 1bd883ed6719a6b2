//! Shared error taxonomy.
//!
//! Every crate has its own `thiserror` enum, but each variant maps onto one
//! [`ErrorKind`]. The kind decides how a failure is surfaced:
//!
//! | Kind | Surfaced as | Retried |
//! |---|---|---|
//! | `Validation` | 4xx / handshake rejection | never |
//! | `ProtocolViolation` | close frame with explicit reason | by client reconnect only |
//! | `NotFound` | normal fallback path (e.g. create session) | n/a |
//! | `Internal` | generic failure, details logged server-side | no |

/// Machine-readable code for validation failures.
pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
/// Machine-readable code for protocol violations.
pub const PROTOCOL_VIOLATION: &str = "PROTOCOL_VIOLATION";
/// Machine-readable code for unknown or expired resources.
pub const NOT_FOUND: &str = "NOT_FOUND";
/// Machine-readable code for unexpected failures.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
/// Machine-readable code for a missing or mismatched anti-forgery token.
pub const FORBIDDEN: &str = "FORBIDDEN";

/// Error classification shared by all crates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed client input: missing field, oversized payload.
    Validation,
    /// Handshake ordering or content violation, duplicate client id.
    ProtocolViolation,
    /// Unknown or expired session; an expected condition.
    NotFound,
    /// Caller lacks the token required for the operation.
    Forbidden,
    /// Unexpected failure in server bookkeeping.
    Internal,
}

impl ErrorKind {
    /// Default machine-readable code for this kind.
    pub fn code(self) -> &'static str {
        match self {
            Self::Validation => VALIDATION_ERROR,
            Self::ProtocolViolation => PROTOCOL_VIOLATION,
            Self::NotFound => NOT_FOUND,
            Self::Forbidden => FORBIDDEN,
            Self::Internal => INTERNAL_ERROR,
        }
    }

    /// Whether the failure was caused by the caller rather than the server.
    pub fn is_client_error(self) -> bool {
        !matches!(self, Self::Internal)
    }
}

/// Generic error carrying a kind, a code, and a human-readable message.
#[derive(Clone, Debug, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct TetherError {
    kind: ErrorKind,
    code: String,
    message: String,
}

impl TetherError {
    /// Build an error with the kind's default code.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.code().to_owned(),
            message: message.into(),
        }
    }

    /// Override the machine-readable code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    /// Validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Protocol violation.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolViolation, message)
    }

    /// Unknown or expired resource.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Unexpected internal failure.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Machine-readable code.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Message safe to show a caller. Internal details are replaced.
    pub fn public_message(&self) -> &str {
        match self.kind {
            ErrorKind::Internal => "internal server error",
            _ => &self.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn kinds_have_default_codes() {
        assert_eq!(ErrorKind::Validation.code(), VALIDATION_ERROR);
        assert_eq!(ErrorKind::ProtocolViolation.code(), PROTOCOL_VIOLATION);
        assert_eq!(ErrorKind::NotFound.code(), NOT_FOUND);
        assert_eq!(ErrorKind::Forbidden.code(), FORBIDDEN);
        assert_eq!(ErrorKind::Internal.code(), INTERNAL_ERROR);
    }

    #[test]
    fn only_internal_is_server_side() {
        assert!(ErrorKind::Validation.is_client_error());
        assert!(ErrorKind::NotFound.is_client_error());
        assert!(!ErrorKind::Internal.is_client_error());
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = TetherError::validation("session_id too long");
        assert_eq!(err.to_string(), "[VALIDATION_ERROR] session_id too long");
    }

    #[test]
    fn with_code_overrides() {
        let err = TetherError::not_found("gone").with_code("SESSION_NOT_FOUND");
        assert_eq!(err.code(), "SESSION_NOT_FOUND");
        assert_matches!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn internal_messages_are_redacted() {
        let err = TetherError::internal("dashmap shard poisoned at store.rs:88");
        assert_eq!(err.public_message(), "internal server error");
        assert!(err.message().contains("store.rs"));

        let err = TetherError::validation("bad json");
        assert_eq!(err.public_message(), "bad json");
    }
}
