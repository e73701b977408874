use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ServerConfig;
use crate::protocol::ConnectionId;
use crate::registry::ConnectionRegistry;
use crate::relay::Session;
use crate::switchboard::Switchboard;
use crate::websocket::websocket_handler;

pub struct AppState {
    pub registry: ConnectionRegistry,
    pub switchboard: Switchboard,
    metrics: PrometheusHandle,
}

impl AppState {
    pub fn new(config: &ServerConfig, metrics: PrometheusHandle) -> Arc<Self> {
        let registry = ConnectionRegistry::new(config.connection_buffer);
        let switchboard = Switchboard::new(Arc::new(registry.clone()), config.switchboard.clone());
        Arc::new(Self {
            registry,
            switchboard,
            metrics,
        })
    }

    pub fn stats(&self) -> StatsResponse {
        let snapshot = self.switchboard.snapshot();
        StatsResponse {
            active_connections: self.registry.len(),
            queue_length: snapshot.waiting.len(),
            active_sessions: snapshot.sessions.len(),
            waiting: snapshot.waiting,
            sessions: snapshot.sessions,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub active_connections: usize,
    pub queue_length: usize,
    pub active_sessions: usize,
    pub waiting: Vec<ConnectionId>,
    pub sessions: Vec<Session>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serve the router on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server shutdown with error")
}

pub async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let state = AppState::new(&config, metrics);
    let reaper = state.switchboard.spawn_reaper(config.reap_interval);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("beach-pier listening on {}", config.listen_addr);

    serve(listener, state, shutdown_signal()).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    if let Some(reaper) = reaper {
        reaper.abort();
    }
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.stats())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.metrics.render();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}
