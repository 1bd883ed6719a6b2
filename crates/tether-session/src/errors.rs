//! Session error types.

use tether_core::errors::{ErrorKind, TetherError};

/// Errors raised by session bookkeeping.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    /// The session id is unknown or its sliding window has elapsed.
    #[error("session not found or expired: {session_id}")]
    NotFound {
        /// The id that was looked up.
        session_id: String,
    },
    /// The request carried malformed input.
    #[error("invalid session request: {0}")]
    Invalid(String),
    /// Bookkeeping reached a state it should not be able to reach.
    #[error("session bookkeeping failed: {0}")]
    Internal(String),
}

impl SessionError {
    /// Shorthand for [`SessionError::NotFound`].
    pub fn not_found(session_id: impl Into<String>) -> Self {
        Self::NotFound {
            session_id: session_id.into(),
        }
    }

    /// Taxonomy bucket for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Invalid(_) => ErrorKind::Validation,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<SessionError> for TetherError {
    fn from(err: SessionError) -> Self {
        let code = match &err {
            SessionError::NotFound { .. } => "SESSION_NOT_FOUND",
            SessionError::Invalid(_) => tether_core::errors::VALIDATION_ERROR,
            SessionError::Internal(_) => tether_core::errors::INTERNAL_ERROR,
        };
        let message = match &err {
            SessionError::Invalid(detail) => detail.clone(),
            SessionError::NotFound { .. } | SessionError::Internal(_) => err.to_string(),
        };
        TetherError::new(err.kind(), message).with_code(code)
    }
}
