//! Run API Handlers
//!
//! Trace ingestion and run lookup.

use axum::{
    Json,
    extract::{Path, Query, State, rejection::{JsonRejection, QueryRejection}},
    http::StatusCode,
};
use uuid::Uuid;
use xray_core::dto::ingest::{IngestPayload, IngestResponse};
use xray_core::dto::query::{RunDetail, RunFilter, RunList};

use crate::api::AppState;
use crate::api::error::ApiResult;
use crate::service::{ingest_service, query_service};

/// POST /api/runs/ingest
/// Persist a finalized run and its steps
pub async fn ingest_run(
    State(state): State<AppState>,
    payload: Result<Json<IngestPayload>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<IngestResponse>)> {
    let Json(payload) = payload?;
    tracing::debug!(
        "Ingesting run {} with {} steps",
        payload.run.id,
        payload.steps.len()
    );

    let response = ingest_service::ingest(&state.pool, payload).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// GET /api/runs
/// List runs, newest first
///
/// Query parameters: `pipeline_name`, `pipeline_version`, `status`,
/// `start_time_from`, `start_time_to`, `metadata` (JSON object the run
/// metadata must contain), `limit`, `offset`.
pub async fn list_runs(
    State(state): State<AppState>,
    filter: Result<Query<RunFilter>, QueryRejection>,
) -> ApiResult<Json<RunList>> {
    let Query(filter) = filter?;
    let runs = query_service::list_runs(&state.pool, filter, state.limits).await?;
    Ok(Json(runs))
}

/// GET /api/runs/{id}
/// Run details with steps ordered by sequence
pub async fn get_run(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<RunDetail>> {
    tracing::debug!("Getting run: {}", id);

    let detail = query_service::get_run(&state.pool, id).await?;
    Ok(Json(detail))
}
