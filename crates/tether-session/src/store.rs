//! Session identity and sliding expiry.
//!
//! Records live in a `DashMap`. Expiry is lazy: a record past its
//! `expires_at` stays in the map but reads as unknown everywhere, until the
//! sweeper reclaims it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tether_core::clock::{Clock, SystemClock};
use tether_core::ids::SessionId;
use tracing::{debug, info};

use crate::errors::SessionError;
use crate::token::{CsrfToken, TokenIssuer};

/// Longest session id accepted from a client.
pub const MAX_SESSION_ID_LEN: usize = 256;

/// Metric name for created sessions.
pub const SESSIONS_CREATED: &str = "sessions_created_total";
/// Metric name for extended sessions.
pub const SESSIONS_EXTENDED: &str = "sessions_extended_total";

/// Optional client metadata recorded at creation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ClientContext {
    /// `User-Agent` of the creating request.
    pub user_agent: Option<String>,
    /// Peer address of the creating request.
    pub remote_addr: Option<String>,
}

/// One session record.
#[derive(Clone, Debug)]
pub struct Session {
    id: SessionId,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    csrf_token: Option<CsrfToken>,
    client: ClientContext,
}

impl Session {
    fn new(id: SessionId, now: DateTime<Utc>, timeout: Duration, client: ClientContext) -> Self {
        Self {
            id,
            created_at: now,
            last_activity: now,
            expires_at: now + timeout,
            csrf_token: None,
            client,
        }
    }

    fn touch(&mut self, now: DateTime<Utc>, timeout: Duration) {
        self.last_activity = now;
        self.expires_at = now + timeout;
    }

    /// Whether the record is still inside its window at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at
    }

    /// Session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Creation instant.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last extension (or creation) instant.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    /// `last_activity + timeout`.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Metadata recorded at creation.
    pub fn client(&self) -> &ClientContext {
        &self.client
    }

    /// Public view of the record.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity,
            expires_at: self.expires_at,
        }
    }
}

/// Public session fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Session id.
    pub session_id: SessionId,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last extension (or creation) instant.
    pub last_activity: DateTime<Utc>,
    /// Expiry instant.
    pub expires_at: DateTime<Utc>,
}

/// Store counters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Records still inside their window.
    pub active_count: usize,
    /// Records held in memory, expired or not.
    pub tracked_count: usize,
    /// Sessions created since start.
    pub total_created: u64,
    /// Successful extensions since start.
    pub total_extended: u64,
    /// Sliding window length.
    pub timeout_minutes: u32,
}

/// `/session/init` request body.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct InitRequest {
    /// Try to extend `session_id` instead of creating.
    pub extend_existing: bool,
    /// Id the client already holds.
    pub session_id: Option<String>,
}

/// Result of [`SessionStore::init_session`].
#[derive(Clone, Debug)]
pub struct InitOutcome {
    /// The session now in effect.
    pub session: SessionInfo,
    /// Freshly issued token for it.
    pub csrf_token: CsrfToken,
    /// True when an existing session was extended.
    pub was_extended: bool,
}

/// Owner of every session record.
pub struct SessionStore {
    sessions: DashMap<SessionId, Session>,
    tokens: Arc<TokenIssuer>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    timeout_minutes: u32,
    total_created: AtomicU64,
    total_extended: AtomicU64,
}

impl SessionStore {
    /// Store on the system clock.
    pub fn new(timeout_minutes: u32, tokens: Arc<TokenIssuer>) -> Self {
        Self::with_clock(timeout_minutes, tokens, Arc::new(SystemClock))
    }

    /// Store on an injected clock.
    pub fn with_clock(
        timeout_minutes: u32,
        tokens: Arc<TokenIssuer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            tokens,
            clock,
            timeout: Duration::minutes(i64::from(timeout_minutes)),
            timeout_minutes,
            total_created: AtomicU64::new(0),
            total_extended: AtomicU64::new(0),
        }
    }

    /// Sliding window length in minutes.
    pub fn timeout_minutes(&self) -> u32 {
        self.timeout_minutes
    }

    /// Create a session with a fresh id.
    pub fn create_session(&self, client: ClientContext) -> SessionId {
        let id = SessionId::generate();
        let session = Session::new(id.clone(), self.clock.now(), self.timeout, client);
        let _ = self.sessions.insert(id.clone(), session);
        let _ = self.total_created.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(SESSIONS_CREATED).increment(1);
        debug!(session_id = %id, "session created");
        id
    }

    /// True iff the id exists and has not expired.
    pub fn is_session_valid(&self, id: &str) -> bool {
        let now = self.clock.now();
        self.sessions.get(id).is_some_and(|s| s.is_valid_at(now))
    }

    /// True iff a record (expired or not) is held for the id.
    pub fn is_tracked(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Slide a valid session's window forward.
    ///
    /// The validity check and the update happen under the entry's write
    /// lock. Unknown or expired ids change nothing.
    pub fn update_session_activity(&self, id: &str) -> Result<SessionInfo, SessionError> {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::not_found(id))?;
        let now = self.clock.now();
        if !entry.is_valid_at(now) {
            return Err(SessionError::not_found(id));
        }
        entry.touch(now, self.timeout);
        let info = entry.info();
        drop(entry);

        let _ = self.total_extended.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(SESSIONS_EXTENDED).increment(1);
        debug!(session_id = id, expires_at = %info.expires_at, "session extended");
        Ok(info)
    }

    /// Mint a token for a valid session and remember it as the current one.
    pub fn generate_csrf_token(&self, id: &str) -> Result<CsrfToken, SessionError> {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::not_found(id))?;
        if !entry.is_valid_at(self.clock.now()) {
            return Err(SessionError::not_found(id));
        }
        let token = self.tokens.issue(id);
        entry.csrf_token = Some(token.clone());
        Ok(token)
    }

    /// Whether `token` is the current token of a valid session.
    pub fn verify_csrf_token(&self, id: &str, token: &str) -> bool {
        let now = self.clock.now();
        let Some(entry) = self.sessions.get(id) else {
            return false;
        };
        entry.is_valid_at(now)
            && entry
                .csrf_token
                .as_ref()
                .is_some_and(|current| current.as_str() == token)
            && self.tokens.verify(id, token)
    }

    /// Public view of a valid session.
    pub fn get_session_info(&self, id: &str) -> Option<SessionInfo> {
        let now = self.clock.now();
        self.sessions
            .get(id)
            .filter(|s| s.is_valid_at(now))
            .map(|s| s.info())
    }

    /// Snapshot of the store counters.
    pub fn get_stats(&self) -> SessionStats {
        let now = self.clock.now();
        let active_count = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_valid_at(now))
            .count();
        SessionStats {
            active_count,
            tracked_count: self.sessions.len(),
            total_created: self.total_created.load(Ordering::Relaxed),
            total_extended: self.total_extended.load(Ordering::Relaxed),
            timeout_minutes: self.timeout_minutes,
        }
    }

    /// Create-or-extend policy behind `POST /session/init`.
    ///
    /// An unusable id falls through to creation. Only an oversized id
    /// offered for extension, or a bookkeeping fault, is an error.
    pub fn init_session(
        &self,
        request: &InitRequest,
        client: ClientContext,
    ) -> Result<InitOutcome, SessionError> {
        let proposed = request
            .session_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());

        if request.extend_existing {
            if let Some(id) = proposed {
                if id.len() > MAX_SESSION_ID_LEN {
                    return Err(SessionError::Invalid(format!(
                        "session_id exceeds {MAX_SESSION_ID_LEN} bytes"
                    )));
                }
                match self.update_session_activity(id) {
                    Ok(session) => {
                        let csrf_token = self.token_for_fresh(id)?;
                        return Ok(InitOutcome {
                            session,
                            csrf_token,
                            was_extended: true,
                        });
                    }
                    Err(SessionError::NotFound { .. }) => {
                        info!(
                            session_id = id,
                            "cannot extend unknown or expired session, creating new one"
                        );
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        let id = self.create_session(client);
        let csrf_token = self.token_for_fresh(&id)?;
        let session = self
            .get_session_info(&id)
            .ok_or_else(|| {
                SessionError::Internal(format!("session {id} vanished after creation"))
            })?;
        Ok(InitOutcome {
            session,
            csrf_token,
            was_extended: false,
        })
    }

    /// Remove records that expired more than `grace` ago.
    ///
    /// Returns the removed ids so dependent state can be dropped too.
    pub fn purge_expired(&self, grace: Duration) -> Vec<SessionId> {
        let Some(cutoff) = self.clock.now().checked_sub_signed(grace) else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        self.sessions.retain(|id, session| {
            let keep = session.expires_at >= cutoff;
            if !keep {
                removed.push(id.clone());
            }
            keep
        });
        removed
    }

    /// A session that was valid a moment ago should still accept a token.
    fn token_for_fresh(&self, id: &str) -> Result<CsrfToken, SessionError> {
        self.generate_csrf_token(id).map_err(|err| match err {
            SessionError::NotFound { .. } => {
                SessionError::Internal(format!("session {id} expired while issuing token"))
            }
            other => other,
        })
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("sessions", &self.sessions.len())
            .field("timeout_minutes", &self.timeout_minutes)
            .finish_non_exhaustive()
    }
}
