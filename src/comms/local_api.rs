use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::agent::config::Config;
use crate::agent::decision::DecisionEngine;

pub type SharedState = Arc<AppState>;

#[derive(Debug)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: DecisionEngine,
}

impl AppState {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let engine = DecisionEngine::from_config(config.clone())
            .context("building outbound HTTP client")?;
        Ok(Self { config, engine })
    }
}

// Every path that is not a status probe is an authorization subrequest.
async fn authorize(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    state.engine.handle(&headers).await
}

async fn alive() -> impl IntoResponse {
    "ALIVE"
}

async fn ready(State(state): State<SharedState>) -> Response {
    if state.config.is_ready() {
        return (StatusCode::OK, "READY").into_response();
    }
    let too_early = StatusCode::from_u16(425).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
    (too_early, "NOT READY").into_response()
}

pub fn create_router(state: SharedState) -> Router {
    // Probes answer on their path and anything below it.
    let mut status = Router::new();
    for (base, handler) in [("/status/alive", get(alive)), ("/status/ready", get(ready))] {
        status = status
            .route(base, handler.clone())
            .route(&format!("{base}/"), handler.clone())
            .route(&format!("{base}/{{*rest}}"), handler);
    }

    Router::new()
        .fallback(authorize)
        .layer(TraceLayer::new_for_http())
        .merge(status)
        .with_state(state)
}

pub async fn serve(config: Config, port: u16) -> Result<()> {
    let cfg = Arc::new(config);
    if !cfg.is_ready() {
        warn!("client credentials not configured, readiness probe will report NOT READY");
    }
    let state = Arc::new(AppState::new(cfg)?);
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app).into_future().await?;
    Ok(())
}
