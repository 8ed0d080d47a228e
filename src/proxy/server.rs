//! HTTP server setup and configuration.

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use super::recorder::TrafficRecorder;
use crate::config::Config;
use crate::provider::ProviderRegistry;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ProviderRegistry>,
    pub config: Arc<Config>,
    pub recorder: Option<Arc<TrafficRecorder>>,
}

/// Create the axum router with all endpoints.
///
/// The OpenAI surface is served both bare and under `/v1` so either client
/// convention works.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/chat/completions", post(handlers::chat_completions))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/models", get(handlers::list_models))
        .route("/v1/models", get(handlers::list_models))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Run the HTTP server.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let listen_addr = config.listen.clone();

    let registry = Arc::new(ProviderRegistry::from_config(&config)?);
    tokio::spawn(
        registry
            .clone()
            .background_refresh(config.token_refresh_interval),
    );

    let recorder = config
        .record_traffic
        .then(|| Arc::new(TrafficRecorder::new(config.traffic_dir.clone())));
    if recorder.is_some() {
        tracing::info!(dir = %config.traffic_dir, "traffic recording enabled");
    }

    let state = AppState {
        registry,
        config: Arc::new(config),
        recorder,
    };

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "starting octogate gateway");

    axum::serve(listener, app).await?;

    Ok(())
}
