//! HTTP session endpoints and the error-to-response mapping.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;
use tether_core::errors::{ErrorKind, TetherError};
use tether_session::{ClientContext, InitRequest, SessionError, SessionInfo};
use tracing::{error, info};

use crate::server::AppState;

/// Header carrying the anti-forgery token on session reads.
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Error returned by HTTP handlers.
#[derive(Debug)]
pub struct ApiError(pub TetherError);

impl From<TetherError> for ApiError {
    fn from(err: TetherError) -> Self {
        Self(err)
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = match err.kind() {
            ErrorKind::Validation | ErrorKind::ProtocolViolation => StatusCode::BAD_REQUEST,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = match err.kind() {
            ErrorKind::Internal => {
                error!(code = err.code(), message = err.message(), "request failed");
                json!({
                    "error": "internal server error",
                    "code": tether_core::errors::INTERNAL_ERROR,
                })
            }
            ErrorKind::Forbidden => {
                json!({ "error": "forbidden", "code": err.code(), "message": err.message() })
            }
            ErrorKind::NotFound => {
                json!({ "error": "not found", "code": err.code(), "message": err.message() })
            }
            ErrorKind::Validation | ErrorKind::ProtocolViolation => {
                json!({ "error": "invalid request", "code": err.code(), "message": err.message() })
            }
        };
        (status, Json(body)).into_response()
    }
}

/// `POST /session/init` response body.
#[derive(Debug, Serialize)]
pub struct InitResponse {
    /// Session now in effect.
    pub session_id: String,
    /// Expiry instant, RFC 3339.
    pub expires_at: String,
    /// Anti-forgery token for this session.
    pub csrf_token: String,
    /// Sliding window length.
    pub timeout_minutes: u32,
    /// True when an existing session was extended.
    pub was_extended: bool,
    /// Human-readable summary.
    pub message: &'static str,
}

/// POST /session/init: create a session or extend the one the client holds.
pub async fn session_init(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<InitResponse>, ApiError> {
    let request = parse_init_body(&body)?;
    let outcome = state.store.init_session(&request, client_context(&headers))?;

    info!(
        session_id = %outcome.session.session_id,
        was_extended = outcome.was_extended,
        "session initialized"
    );
    Ok(Json(InitResponse {
        session_id: outcome.session.session_id.into_inner(),
        expires_at: outcome.session.expires_at.to_rfc3339(),
        csrf_token: outcome.csrf_token.as_str().to_owned(),
        timeout_minutes: state.store.timeout_minutes(),
        was_extended: outcome.was_extended,
        message: if outcome.was_extended {
            "Session extended"
        } else {
            "Session created"
        },
    }))
}

/// GET /session/{session_id}: public session fields, CSRF-protected.
pub async fn session_info(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SessionInfo>, ApiError> {
    let token = headers
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| TetherError::new(ErrorKind::Forbidden, "missing csrf token"))?;

    // Token first: unknown and expired ids answer 403 like a bad token.
    if !state.store.verify_csrf_token(&session_id, token) {
        return Err(TetherError::new(ErrorKind::Forbidden, "csrf token mismatch").into());
    }

    let info = state
        .store
        .get_session_info(&session_id)
        .ok_or_else(|| TetherError::not_found(format!("session not found: {session_id}")))?;
    Ok(Json(info))
}

/// Empty or whitespace-only bodies mean "all defaults".
fn parse_init_body(body: &[u8]) -> Result<InitRequest, TetherError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(InitRequest::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| TetherError::validation(format!("malformed JSON body: {e}")))
}

fn client_context(headers: &HeaderMap) -> ClientContext {
    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    };
    ClientContext {
        user_agent: header_str(header::USER_AGENT.as_str()),
        remote_addr: header_str("x-forwarded-for")
            .and_then(|v| v.split(',').next().map(|s| s.trim().to_owned()))
            .filter(|s| !s.is_empty()),
    }
}
