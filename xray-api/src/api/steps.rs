//! Step API Handlers
//!
//! Cross-pipeline step queries and metadata aggregation.

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
};
use xray_core::dto::analytics::{AggregateRequest, AggregateResponse};
use xray_core::dto::query::{StepList, StepQuery};

use crate::api::AppState;
use crate::api::error::ApiResult;
use crate::service::query_service;

/// POST /api/steps/query
pub async fn query_steps(
    State(state): State<AppState>,
    query: Result<Json<StepQuery>, JsonRejection>,
) -> ApiResult<Json<StepList>> {
    let Json(query) = query?;
    let steps = query_service::query_steps(&state.pool, query, state.limits).await?;
    Ok(Json(steps))
}

/// POST /api/steps/aggregate
pub async fn aggregate_steps(
    State(state): State<AppState>,
    req: Result<Json<AggregateRequest>, JsonRejection>,
) -> ApiResult<Json<AggregateResponse>> {
    let Json(req) = req?;
    tracing::debug!("Aggregating steps by '{}'", req.group_by);

    let response = query_service::aggregate_steps(&state.pool, req).await?;
    Ok(Json(response))
}
