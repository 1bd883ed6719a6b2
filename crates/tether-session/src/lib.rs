//! # tether-session
//!
//! Per-client session state for the Tether bridge:
//!
//! - [`TokenIssuer`]: anti-forgery tokens bound to a session id
//! - [`SessionStore`]: session identity, sliding expiry, create-or-extend
//! - [`timestamp`]: canonical epoch-millisecond normalization
//! - [`DeltaEngine`]: per-session baseline and "what changed" filtering
//! - [`ContextService`]: the facade handed to prompt assembly
//! - [`sweep`]: optional background reclaim of long-expired records
//!
//! Expiry is lazy. An expired session reads exactly like an unknown one;
//! the sweeper only frees memory.

#![deny(unsafe_code)]

pub mod context;
pub mod delta;
pub mod errors;
pub mod store;
pub mod sweep;
pub mod timestamp;
pub mod token;

pub use context::ContextService;
pub use delta::{ChatMessage, DeltaEngine, DeltaMessage, DeltaOutcome};
pub use errors::SessionError;
pub use store::{
    ClientContext, InitOutcome, InitRequest, SessionInfo, SessionStats, SessionStore,
};
pub use timestamp::normalize_timestamp;
pub use token::{CsrfToken, TokenIssuer};
