//! API Module
//!
//! HTTP API layer for the trace store.
//! Each submodule handles endpoints for a specific resource.

pub mod analytics;
pub mod error;
pub mod health;
pub mod runs;
pub mod steps;

use axum::{
    Router,
    routing::{get, post},
};
use sqlx::PgPool;
use tower_http::trace::TraceLayer;

use crate::config::PageLimits;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub limits: PageLimits,
}

impl AppState {
    pub fn new(pool: PgPool, limits: PageLimits) -> Self {
        Self { pool, limits }
    }
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        // Run endpoints
        .route("/runs/ingest", post(runs::ingest_run))
        .route("/runs", get(runs::list_runs))
        .route("/runs/{id}", get(runs::get_run))
        // Step endpoints
        .route("/steps/query", post(steps::query_steps))
        .route("/steps/aggregate", post(steps::aggregate_steps))
        // Analytics endpoints
        .route(
            "/analytics/pipeline/{name}",
            get(analytics::pipeline_analytics),
        );

    Router::new()
        .route("/", get(health::root))
        .route("/health", get(health::health_check))
        .nest("/api", api)
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
