//! Analytics Service
//!
//! Per-pipeline health summary.

use sqlx::PgPool;
use std::collections::BTreeMap;
use thiserror::Error;
use xray_core::domain::step::StepType;
use xray_core::dto::analytics::{BottleneckStep, PipelineAnalytics};

use crate::repository::analytics::BottleneckRow;
use crate::repository::analytics_repository;

const BOTTLENECK_LIMIT: i64 = 5;

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("no runs recorded for pipeline '{0}'")]
    NotFound(String),

    #[error("database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
}

/// Summarize every run recorded for `pipeline_name`
pub async fn pipeline_analytics(pool: &PgPool, pipeline_name: &str) -> Result<PipelineAnalytics, AnalyticsError> {
    let summary = analytics_repository::run_summary(pool, pipeline_name).await?;
    if summary.total_runs == 0 {
        return Err(AnalyticsError::NotFound(pipeline_name.to_string()));
    }

    let steps_by_type: BTreeMap<String, i64> = analytics_repository::steps_by_type(pool, pipeline_name)
        .await?
        .into_iter()
        .collect();
    let total_steps = steps_by_type.values().sum();

    let bottleneck_steps = analytics_repository::bottlenecks(pool, pipeline_name, BOTTLENECK_LIMIT)
        .await?
        .into_iter()
        .map(bottleneck_from_row)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(PipelineAnalytics {
        pipeline_name: pipeline_name.to_string(),
        success_rate: success_rate(summary.success_count, summary.total_runs),
        total_runs: summary.total_runs,
        success_count: summary.success_count,
        failure_count: summary.failure_count,
        partial_count: summary.partial_count,
        avg_duration_ms: summary.avg_duration_ms,
        total_steps,
        steps_by_type,
        bottleneck_steps,
    })
}

fn bottleneck_from_row(row: BottleneckRow) -> Result<BottleneckStep, sqlx::Error> {
    let step_type = row
        .step_type
        .parse::<StepType>()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    Ok(BottleneckStep {
        step_name: row.step_name,
        step_type,
        occurrences: row.occurrences,
        avg_duration_ms: row.avg_duration_ms,
    })
}

fn success_rate(success: i64, total: i64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    success as f64 / total as f64
}
