//! Analytics API Handlers

use axum::{
    Json,
    extract::{Path, State},
};
use xray_core::dto::analytics::PipelineAnalytics;

use crate::api::AppState;
use crate::api::error::ApiResult;
use crate::service::analytics_service;

/// GET /api/analytics/pipeline/{name}
pub async fn pipeline_analytics(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<PipelineAnalytics>> {
    let analytics = analytics_service::pipeline_analytics(&state.pool, &name).await?;
    Ok(Json(analytics))
}
