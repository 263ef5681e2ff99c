// src/api.rs
use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::ingest::stats::{CycleStats, StatsRegistry};

#[derive(Clone)]
pub struct StatusState {
    stats: Arc<StatsRegistry>,
}

impl StatusState {
    pub fn new(stats: Arc<StatsRegistry>) -> Self {
        Self { stats }
    }
}

/// Read-only status surface: `/health` and `/stats`.
pub fn create_router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/stats", get(stats))
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Status router with the Prometheus `/metrics` route merged in.
pub fn router_with_metrics(state: StatusState, metrics: Router) -> Router {
    create_router(state).merge(metrics)
}

async fn stats(State(state): State<StatusState>) -> Json<CycleStats> {
    Json(state.stats.snapshot())
}
