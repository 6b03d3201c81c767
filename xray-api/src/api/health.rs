//! Health Check API Handlers

use axum::Json;
use serde_json::{Value, json};

/// GET /
/// Service identification
pub async fn root() -> Json<Value> {
    Json(json!({
        "name": "X-Ray API",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "healthy",
    }))
}

/// GET /health
pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}
