//! Builds the axum router tying the HTTP and WebSocket handlers together.

use crate::http;
use crate::registry::DatabaseRegistry;
use crate::ws;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[tracing::instrument(skip_all)]
pub fn build_app_router(registry: Arc<DatabaseRegistry>) -> Router {
    Router::new()
        .route("/db/{id}/query", post(http::query))
        .route("/db/{id}/execute", post(http::execute))
        .route("/db/{id}/transaction", post(http::transaction))
        .route("/db/{id}", get(ws::upgrade))
        .route("/health", get(http::health))
        .route("/health/ready", get(http::health_ready))
        .with_state(registry)
        .layer(TraceLayer::new_for_http())
}
