//! `DocketServer` — Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::response::Json;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use thiserror::Error;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use docket_realtime::RealtimeService;

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::routes;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::session::ws_handler;

/// Server startup failures.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Could not bind or accept on the listen address.
    #[error("server io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The realtime delivery subsystem.
    pub service: Arc<RealtimeService>,
    /// Server configuration.
    pub config: ServerConfig,
    /// When the server started.
    pub start_time: Instant,
    /// Renders `/metrics`; `None` when no recorder is installed (tests).
    pub metrics: Option<PrometheusHandle>,
}

/// The Docket realtime server.
pub struct DocketServer {
    config: ServerConfig,
    service: Arc<RealtimeService>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl DocketServer {
    /// Create a new server around an already-wired service.
    pub fn new(
        config: ServerConfig,
        service: Arc<RealtimeService>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            config,
            service,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics,
            start_time: Instant::now(),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            service: self.service.clone(),
            config: self.config.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/stats", get(routes::stats_handler))
            .route("/notify", post(routes::notify_handler))
            .route("/ws", get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Bind and serve. Returns the bound address and the serve task.
    ///
    /// The serve task runs until the shutdown coordinator fires.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let listener =
            tokio::net::TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;

        let router = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let shutdown = self.shutdown.token();

        info!(%addr, "listening");
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(err) = result {
                error!(%err, "server terminated abnormally");
            }
        });

        Ok((addr, handle))
    }

    /// Get the realtime service.
    pub fn service(&self) -> &Arc<RealtimeService> {
        &self.service
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.service.stats();
    let resp = health::health_check(
        state.start_time,
        stats.registry.total_connections,
        stats.coordinator_degraded,
    );
    Json(resp)
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> String {
    state
        .metrics
        .as_ref()
        .map(crate::metrics::render)
        .unwrap_or_default()
}
