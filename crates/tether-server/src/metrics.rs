//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Call once at startup, before any metrics are recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from a recorder handle.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across crates.

/// WebSocket connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket disconnections of active connections (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Handshake rejections (counter, labels: reason).
pub const WS_HANDSHAKE_REJECTIONS_TOTAL: &str = "ws_handshake_rejections_total";
/// Inbound envelopes handled (counter, labels: type).
pub const WS_MESSAGES_TOTAL: &str = "ws_messages_total";
/// Handler failures (counter, labels: type).
pub const WS_HANDLER_ERRORS_TOTAL: &str = "ws_handler_errors_total";
/// Active connection lifetime (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Sessions created (counter).
pub const SESSIONS_CREATED_TOTAL: &str = tether_session::store::SESSIONS_CREATED;
/// Sessions extended (counter).
pub const SESSIONS_EXTENDED_TOTAL: &str = tether_session::store::SESSIONS_EXTENDED;
/// Delta messages dropped for unusable timestamps (counter).
pub const DELTA_MESSAGES_DROPPED_TOTAL: &str = tether_session::delta::DELTA_MESSAGES_DROPPED;
