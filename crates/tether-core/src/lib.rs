//! # tether-core
//!
//! Foundation types shared by every Tether crate:
//!
//! - **Branded IDs**: [`SessionId`], [`ClientId`], [`ConnectionId`]
//! - **Errors**: the [`ErrorKind`] taxonomy and [`TetherError`]
//! - **Clock**: the [`Clock`] seam used for expiry arithmetic
//! - **Logging**: [`logging::init_subscriber`] for the `tracing` stack

#![deny(unsafe_code)]

pub mod clock;
pub mod errors;
pub mod ids;
pub mod logging;

pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::{ErrorKind, TetherError};
pub use ids::{ClientId, ConnectionId, SessionId};
