//! `WebSocket` gateway: handshake, connection registry, lifecycle, and
//! typed message dispatch.

pub mod connection;
pub mod dispatch;
pub mod handshake;
pub mod lifecycle;
pub mod registry;
pub mod session;
