//! Facade for prompt assembly and WebSocket handlers.

use std::sync::Arc;

use tracing::debug;

use crate::delta::{DeltaEngine, DeltaMessage, DeltaOutcome};
use crate::store::{SessionInfo, SessionStore};

/// Session lookups plus delta filtering, with invalid sessions always
/// treated as a first turn.
#[derive(Clone, Debug)]
pub struct ContextService {
    store: Arc<SessionStore>,
    engine: Arc<DeltaEngine>,
}

impl ContextService {
    /// Compose from shared store and engine.
    pub fn new(store: Arc<SessionStore>, engine: Arc<DeltaEngine>) -> Self {
        Self { store, engine }
    }

    /// Messages the AI has not seen yet for this session.
    ///
    /// When the session is unknown or expired, its baseline is cleared
    /// first, so the whole valid input comes back.
    pub fn apply_message_delta<M: DeltaMessage>(
        &self,
        session_id: &str,
        messages: Vec<M>,
    ) -> DeltaOutcome<M> {
        if !self.store.is_session_valid(session_id) {
            debug!(session_id, "session not valid, resending full context");
            self.engine.force_full_context(session_id);
        }
        self.engine.apply_message_delta(session_id, messages)
    }

    /// Make the next delta call a full resend.
    pub fn force_full_context(&self, session_id: &str) {
        self.engine.force_full_context(session_id);
    }

    /// Public view of a valid session.
    pub fn get_session_info(&self, session_id: &str) -> Option<SessionInfo> {
        self.store.get_session_info(session_id)
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Underlying engine.
    pub fn engine(&self) -> &Arc<DeltaEngine> {
        &self.engine
    }
}
