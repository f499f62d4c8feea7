//! Admin HTTP API for the coordinator
//!
//! - `GET /health`: liveness, 503 once the coordinator log has failed
//! - `GET /status`: live set, sequence counter and recovery backlog as JSON
//! - `GET /metrics`: Prometheus text

use crate::coordinator::Coordinator;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub fn create_router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/health", axum::routing::get(health))
        .route("/status", axum::routing::get(status))
        .route("/metrics", axum::routing::get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}

async fn health(State(coordinator): State<Arc<Coordinator>>) -> impl IntoResponse {
    if coordinator.is_failed().await {
        return (StatusCode::SERVICE_UNAVAILABLE, "failed");
    }
    (StatusCode::OK, "ok")
}

async fn status(State(coordinator): State<Arc<Coordinator>>) -> impl IntoResponse {
    Json(coordinator.status().await)
}

async fn metrics(State(coordinator): State<Arc<Coordinator>>) -> impl IntoResponse {
    let live = coordinator.live_participants().await.len();
    coordinator
        .metrics()
        .live_participants
        .set(live as u64);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        coordinator.metrics().to_prometheus(coordinator.next_id()),
    )
}
