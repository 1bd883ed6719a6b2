//! `TetherServer`: Axum HTTP + `WebSocket` server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use tether_session::{ContextService, DeltaEngine, SessionStore};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::http;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::dispatch::HandlerRegistry;
use crate::websocket::registry::ConnectionRegistry;
use crate::websocket::session::{ConnectionDeps, run_connection};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server tunables.
    pub config: Arc<ServerConfig>,
    /// Session records.
    pub store: Arc<SessionStore>,
    /// Live `WebSocket` connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Connection task dependencies.
    pub deps: ConnectionDeps,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Connection tasks, for draining on shutdown.
    pub tasks: TaskTracker,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// When the server started.
    pub start_time: Instant,
}

/// The main Tether server.
pub struct TetherServer {
    state: AppState,
}

impl TetherServer {
    /// Compose a server from its collaborators.
    pub fn new(
        config: ServerConfig,
        store: Arc<SessionStore>,
        engine: Arc<DeltaEngine>,
        handlers: HandlerRegistry,
    ) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(ConnectionRegistry::new(config.max_connections));
        let deps = ConnectionDeps {
            config: Arc::clone(&config),
            registry: Arc::clone(&registry),
            handlers: Arc::new(handlers),
            context: ContextService::new(Arc::clone(&store), engine),
        };
        Self {
            state: AppState {
                config,
                store,
                registry,
                deps,
                shutdown: Arc::new(ShutdownCoordinator::new()),
                tasks: TaskTracker::new(),
                metrics: None,
                start_time: Instant::now(),
            },
        }
    }

    /// Serve `/metrics` from this handle.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_handler))
            .route("/session/init", post(http::session_init))
            .route("/session/{session_id}", get(http::session_info))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.state.clone())
    }

    /// Bind and serve in a background task until shutdown.
    ///
    /// Returns the bound address (useful with port 0) and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let config = &self.state.config;
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let addr = listener.local_addr()?;
        let app = self.router();
        let token = self.state.shutdown.token();

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "server error");
            }
        });
        info!(%addr, "server listening");
        Ok((addr, handle))
    }

    /// Wait for connection tasks to finish after shutdown was signalled.
    ///
    /// Returns `false` if some were still running at the deadline.
    pub async fn drain_connections(&self, timeout: Duration) -> bool {
        let _ = self.state.tasks.close();
        let drained = tokio::time::timeout(timeout, self.state.tasks.wait()).await.is_ok();
        if !drained {
            warn!(remaining = self.state.tasks.len(), "connections still open after drain timeout");
        }
        drained
    }

    /// Get the connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.state.registry
    }

    /// Get the session store.
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.state.store
    }

    /// Get the session/delta facade.
    pub fn context(&self) -> &ContextService {
        &self.state.deps.context
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.registry.count(),
        state.store.get_stats().active_count,
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// GET /ws
async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let deps = state.deps.clone();
    let cancel = state.shutdown.child_token();
    let tasks = state.tasks.clone();
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| tasks.track_future(run_connection(socket, deps, cancel)))
}
