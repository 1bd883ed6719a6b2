//! Incremental "what changed" filtering per session.
//!
//! Each session id owns a baseline: the largest normalized timestamp seen
//! so far. The first call for a session (or the first after a reset)
//! returns every valid message; later calls return only messages strictly
//! newer than the baseline. The baseline only moves forward between resets.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tether_core::ids::SessionId;
use tracing::debug;

use crate::timestamp::normalize_timestamp;

/// Metric name for messages dropped because of an unusable timestamp.
pub const DELTA_MESSAGES_DROPPED: &str = "delta_messages_dropped_total";

/// Anything the delta engine can filter.
pub trait DeltaMessage {
    /// The message's timestamp in whatever encoding the client sent.
    fn raw_timestamp(&self) -> Option<&Value>;
}

impl DeltaMessage for Value {
    fn raw_timestamp(&self) -> Option<&Value> {
        self.get("timestamp").or_else(|| self.get("send_date"))
    }
}

/// A chat message with a timestamp and arbitrary extra fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Seconds or milliseconds, as a number or numeric string.
    pub timestamp: Value,
    /// Everything else the client attached (author, text, ...).
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ChatMessage {
    /// Message with a numeric timestamp and no extra fields.
    pub fn at(timestamp: i64) -> Self {
        Self {
            timestamp: Value::from(timestamp),
            fields: Map::new(),
        }
    }
}

impl DeltaMessage for ChatMessage {
    fn raw_timestamp(&self) -> Option<&Value> {
        Some(&self.timestamp)
    }
}

/// Result of one filtering call.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeltaOutcome<M> {
    /// Messages to forward, in input order.
    pub messages: Vec<M>,
    /// True when no baseline existed and everything valid was returned.
    pub full_context: bool,
    /// Count of input messages dropped for a missing or invalid timestamp.
    pub dropped_invalid: usize,
    /// Baseline after the call.
    pub baseline: Option<i64>,
}

#[derive(Debug, Default)]
struct DeltaState {
    baseline: Option<i64>,
}

/// Per-session baselines keyed by session id.
///
/// The map is only touched to find a session's state; filtering runs under
/// that session's own mutex, so unrelated sessions never contend.
#[derive(Debug, Default)]
pub struct DeltaEngine {
    states: DashMap<SessionId, Arc<Mutex<DeltaState>>>,
}

impl DeltaEngine {
    /// Empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter `messages` against the session's baseline and advance it.
    pub fn apply_message_delta<M: DeltaMessage>(
        &self,
        session_id: &str,
        messages: Vec<M>,
    ) -> DeltaOutcome<M> {
        let state = self.state_for(session_id);
        let mut state = state.lock();

        let total = messages.len();
        let mut dropped_invalid = 0usize;
        let mut newest: Option<i64> = None;
        let mut valid = Vec::with_capacity(total);
        for message in messages {
            match message.raw_timestamp().and_then(normalize_timestamp) {
                Some(ts) => {
                    newest = newest.max(Some(ts));
                    valid.push((ts, message));
                }
                None => dropped_invalid += 1,
            }
        }

        let full_context = state.baseline.is_none();
        let messages: Vec<M> = match state.baseline {
            None => valid.into_iter().map(|(_, m)| m).collect(),
            Some(baseline) => valid
                .into_iter()
                .filter(|(ts, _)| *ts > baseline)
                .map(|(_, m)| m)
                .collect(),
        };

        state.baseline = state.baseline.max(newest);

        if dropped_invalid > 0 {
            metrics::counter!(DELTA_MESSAGES_DROPPED).increment(dropped_invalid as u64);
        }
        debug!(
            session_id,
            total,
            returned = messages.len(),
            dropped_invalid,
            full_context,
            baseline = ?state.baseline,
            "delta applied"
        );

        DeltaOutcome {
            messages,
            full_context,
            dropped_invalid,
            baseline: state.baseline,
        }
    }

    /// Clear the baseline so the next call is a full resend.
    pub fn force_full_context(&self, session_id: &str) {
        if let Some(state) = self.existing(session_id) {
            state.lock().baseline = None;
            debug!(session_id, "delta baseline cleared");
        }
    }

    /// Current baseline, if the session has one.
    pub fn baseline(&self, session_id: &str) -> Option<i64> {
        self.existing(session_id).and_then(|s| s.lock().baseline)
    }

    /// Drop a session's state entirely.
    pub fn forget(&self, session_id: &str) -> bool {
        self.states.remove(session_id).is_some()
    }

    /// Drop every state whose session id fails `keep`.
    pub fn retain(&self, mut keep: impl FnMut(&SessionId) -> bool) -> usize {
        let before = self.states.len();
        self.states.retain(|id, _| keep(id));
        before.saturating_sub(self.states.len())
    }

    /// Number of session ids with state.
    pub fn tracked_sessions(&self) -> usize {
        self.states.len()
    }

    fn existing(&self, session_id: &str) -> Option<Arc<Mutex<DeltaState>>> {
        self.states.get(session_id).map(|s| Arc::clone(s.value()))
    }

    fn state_for(&self, session_id: &str) -> Arc<Mutex<DeltaState>> {
        if let Some(state) = self.existing(session_id) {
            return state;
        }
        Arc::clone(
            self.states
                .entry(SessionId::from(session_id))
                .or_default()
                .value(),
        )
    }
}
