//! HTTP driver: OpenAI-style completion routes over a shared excoder model.
//!
//! The model is loaded once and shared read-only. Evaluation state is either one
//! mutex-guarded session or a fresh session per request, see [`SessionPolicy`].
//! Generation runs on the blocking pool so the async workers stay responsive.

pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod state;
pub mod types;


pub use config::{RequestDefaults, ServerConfig, SessionPolicy};
pub use engine::Engine;
pub use error::{ApiError, RequestValidationError};
pub use state::AppState;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use excoder_llm::Model;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/v1/completions", post(handlers::completions))
        .route(
            "/v1/engines/excoder/completions",
            post(handlers::completions),
        )
        .route(
            "/v1/engines/copilot-codex/completions",
            post(handlers::completions),
        )
        .route("/copilot_internal/v2/token", get(handlers::token))
        .with_state(state)
}

/// Estimates scratch needs, binds and serves until Ctrl-C.
pub async fn serve(model: Arc<Model>, config: ServerConfig) -> Result<()> {
    let engine = Engine::new(model, &config).context("scratch memory estimate failed")?;
    let addr = config.bind_addr();
    let app = create_router(AppState::new(engine, config));

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
