//! HTTP API
//!
//! Thin, stateless facade over the session registry. Each route maps to
//! one registry operation; every failure becomes a JSON error response.

pub mod error;
pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use std::time::Duration;
use tower_http::cors::CorsLayer;

use crate::session::SessionRegistry;

pub use error::ApiError;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    /// How long session creation waits for a code or connection
    pub auth_wait: Duration,
}

impl AppState {
    pub fn new(registry: SessionRegistry, auth_wait: Duration) -> Self {
        Self { registry, auth_wait }
    }
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/generate-qr", post(handlers::create_session))
        .route("/status/{id}", get(handlers::session_status))
        .route("/send-message", post(handlers::send_message))
        .route("/disconnect", post(handlers::disconnect))
        .route("/sessions", get(handlers::list_sessions))
        .route("/health", get(handlers::health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
