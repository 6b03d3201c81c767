//! Query Service
//!
//! Run lookup, run listing, cross-pipeline step search and metadata
//! aggregation.

use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;
use xray_core::dto::analytics::{
    AggregateGroup, AggregateMetric, AggregateRequest, AggregateResponse, PercentileValue,
};
use xray_core::dto::query::{RunDetail, RunFilter, RunList, StepList, StepQuery};

use crate::config::PageLimits;
use crate::repository::run::RunCriteria;
use crate::repository::{run_repository, step_repository};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("run {0} not found")]
    NotFound(Uuid),

    #[error("{0}")]
    ValidationError(String),

    #[error("database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
}

/// A run with its steps ordered by sequence
pub async fn get_run(pool: &PgPool, id: Uuid) -> Result<RunDetail, QueryError> {
    let run = run_repository::find_by_id(pool, id)
        .await?
        .ok_or(QueryError::NotFound(id))?;
    let steps = step_repository::find_by_run(pool, id).await?;

    Ok(RunDetail { run, steps })
}

/// One page of runs matching `filter`, newest first
pub async fn list_runs(pool: &PgPool, filter: RunFilter, limits: PageLimits) -> Result<RunList, QueryError> {
    let (limit, offset) = resolve_page(filter.limit, filter.offset, limits)?;
    let metadata = filter.metadata.as_deref().map(parse_metadata).transpose()?;

    let criteria = RunCriteria {
        pipeline_name: filter.pipeline_name,
        pipeline_version: filter.pipeline_version,
        status: filter.status,
        start_time_from: filter.start_time_from,
        start_time_to: filter.start_time_to,
        metadata,
    };

    let runs = run_repository::list(pool, &criteria, limit, offset).await?;
    let total = run_repository::count(pool, &criteria).await?;

    Ok(RunList {
        runs,
        total,
        limit,
        offset,
    })
}

/// One page of steps matching `query` across all runs
pub async fn query_steps(pool: &PgPool, query: StepQuery, limits: PageLimits) -> Result<StepList, QueryError> {
    validate_step_query(&query)?;
    let (limit, offset) = resolve_page(query.limit, query.offset, limits)?;

    let steps = step_repository::search(pool, &query, limit, offset).await?;
    let total = step_repository::count(pool, &query).await?;

    tracing::debug!("Step query matched {} steps", total);

    Ok(StepList {
        steps,
        total,
        limit,
        offset,
    })
}

/// Group steps by a metadata path and compute the requested metrics
pub async fn aggregate_steps(pool: &PgPool, req: AggregateRequest) -> Result<AggregateResponse, QueryError> {
    let path = parse_group_path(&req.group_by)?;
    let with_percentiles = req.metrics.contains(&AggregateMetric::PercentileDurationMs);
    let percentiles = if with_percentiles {
        validate_percentiles(&req.percentiles)?;
        req.percentiles.clone()
    } else {
        Vec::new()
    };

    let rows = step_repository::aggregate(
        pool,
        path,
        req.step_type,
        req.pipeline_name.as_deref(),
        percentiles.clone(),
    )
    .await?;

    let with_count = req.metrics.contains(&AggregateMetric::Count);
    let with_avg = req.metrics.contains(&AggregateMetric::AvgDurationMs);

    let groups = rows
        .into_iter()
        .map(|row| AggregateGroup {
            key: row.key,
            count: with_count.then_some(row.count),
            avg_duration_ms: if with_avg { row.avg_duration_ms } else { None },
            percentiles: with_percentiles.then(|| {
                let values = row.percentiles.unwrap_or_default();
                percentiles
                    .iter()
                    .enumerate()
                    .map(|(i, &percentile)| PercentileValue {
                        percentile,
                        duration_ms: values.get(i).copied().flatten(),
                    })
                    .collect()
            }),
        })
        .collect();

    Ok(AggregateResponse {
        group_by: req.group_by,
        groups,
    })
}

/// Applies the default page size, clamps the limit and checks the offset
pub fn resolve_page(limit: Option<i64>, offset: Option<i64>, limits: PageLimits) -> Result<(i64, i64), QueryError> {
    let limit = limit.unwrap_or(limits.default).clamp(1, limits.max);
    let offset = offset.unwrap_or(0);
    if offset < 0 {
        return Err(QueryError::ValidationError(
            "offset must not be negative".to_string(),
        ));
    }
    Ok((limit, offset))
}

fn parse_metadata(raw: &str) -> Result<serde_json::Value, QueryError> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| QueryError::ValidationError(format!("metadata is not valid JSON: {}", e)))?;
    if !value.is_object() {
        return Err(QueryError::ValidationError(
            "metadata filter must be a JSON object".to_string(),
        ));
    }
    Ok(value)
}

fn validate_step_query(query: &StepQuery) -> Result<(), QueryError> {
    check_range("reduction_rate", query.min_reduction_rate, query.max_reduction_rate)?;
    check_range("duration_ms", query.min_duration_ms, query.max_duration_ms)?;
    check_range("candidates_in", query.min_candidates_in, query.max_candidates_in)?;
    check_range("candidates_out", query.min_candidates_out, query.max_candidates_out)?;
    check_range("start_time", query.start_time_from, query.start_time_to)
}

fn check_range<T: PartialOrd>(field: &str, min: Option<T>, max: Option<T>) -> Result<(), QueryError> {
    if let (Some(min), Some(max)) = (min, max)
        && min > max
    {
        return Err(QueryError::ValidationError(format!(
            "{} lower bound exceeds its upper bound",
            field
        )));
    }
    Ok(())
}

/// Splits a dot-separated metadata path into its segments
fn parse_group_path(group_by: &str) -> Result<Vec<String>, QueryError> {
    let segments: Vec<String> = group_by.split('.').map(|s| s.trim().to_string()).collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(QueryError::ValidationError(format!(
            "invalid group_by path '{}'",
            group_by
        )));
    }
    Ok(segments)
}

fn validate_percentiles(percentiles: &[f64]) -> Result<(), QueryError> {
    if percentiles.is_empty() {
        return Err(QueryError::ValidationError(
            "percentile_duration_ms requires at least one percentile".to_string(),
        ));
    }
    if let Some(p) = percentiles.iter().find(|p| !(0.0..=1.0).contains(*p)) {
        return Err(QueryError::ValidationError(format!(
            "percentile {} is outside [0, 1]",
            p
        )));
    }
    Ok(())
}
