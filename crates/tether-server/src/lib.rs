//! # tether-server
//!
//! Axum HTTP + `WebSocket` bridge between chat clients and the AI side.
//!
//! - HTTP endpoints: `/session/init`, `/session/{id}`, `/health`, `/metrics`
//! - `WebSocket` gateway: handshake, one-connection-per-client registry,
//!   heartbeat, typed message dispatch
//! - Outbound routing to a client or to every client of a session
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod http;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;
