// Web server — Axum JSON / NDJSON front end for the moderation service.
//
// Routes:
//   POST /api/moderate               — single message, always aggregate
//   POST /api/moderate_conversation  — typed records (NDJSON when streaming)
//   POST /api/chat                   — Ollama-shaped chat chunks
//   GET  /health, GET /

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::http::{header, HeaderName, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::error::ModerationError;
use crate::moderation::service::ModerationService;

pub mod handlers;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Shared application state threaded through all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ModerationService>,
}

/// Start the Axum web server and block until it exits.
pub async fn run_server(service: Arc<ModerationService>, bind: &str, port: u16) -> Result<()> {
    let app = build_router(AppState { service });

    let addr = format!("{bind}:{port}");
    info!("guardstream listening on http://{addr}");
    info!("API endpoint: http://{addr}/api/chat");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/moderate", post(handlers::moderate::moderate))
        .route(
            "/api/moderate_conversation",
            post(handlers::conversation::moderate_conversation),
        )
        .route("/api/chat", post(handlers::chat::chat))
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([
                    header::CONTENT_TYPE,
                    header::AUTHORIZATION,
                    HeaderName::from_static("x-requested-with"),
                ])
                .max_age(Duration::from_secs(3600)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(axum::extract::State(state): axum::extract::State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "model_loaded": true,
        "model_name": state.service.model_name(),
    }))
}

async fn index(axum::extract::State(state): axum::extract::State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "name": "guardstream",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "/api/moderate": "POST - Moderate a single user message",
            "/api/moderate_conversation": "POST - Moderate a user turn and, token by token, an assistant turn",
            "/api/chat": "POST - Same as /api/moderate_conversation in an Ollama-style chat envelope",
            "/health": "GET - Health check",
        },
        "model": state.service.model_name(),
    }))
}

/// Typed JSON error response helper.
pub fn api_error(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// 400 for input problems, 500 for model failures.
pub fn moderation_error(err: &ModerationError) -> Response {
    if err.is_client_error() {
        warn!(error = %err, "Rejected moderation request");
        api_error(StatusCode::BAD_REQUEST, &err.to_string())
    } else {
        error!(error = %err, "Moderation failed");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
    }
}
