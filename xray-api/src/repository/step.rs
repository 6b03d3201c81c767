//! Step Repository
//!
//! Writes go to the `steps` table; reads go through the `step_metrics`
//! view so every step comes back with its derived metrics.

use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;
use xray_core::domain::step::{Step, StepType};
use xray_core::dto::query::{StepQuery, StepView};

const STEP_COLUMNS: &str = r#"
        SELECT id, run_id, step_name, step_type, sequence, start_time, end_time,
               inputs, outputs, reasoning, candidates_in, candidates_out,
               candidates_data, filters_applied, metadata, error,
               duration_ms, reduction_rate
        FROM step_metrics
"#;

/// Insert a step belonging to `run_id`
pub async fn insert(conn: &mut PgConnection, run_id: Uuid, step: &Step) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO steps (id, run_id, step_name, step_type, sequence, start_time, end_time,
                           inputs, outputs, reasoning, candidates_in, candidates_out,
                           candidates_data, filters_applied, metadata, error)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        "#,
    )
    .bind(step.id)
    .bind(run_id)
    .bind(&step.step_name)
    .bind(step.step_type.as_str())
    .bind(i64::from(step.sequence))
    .bind(step.start_time)
    .bind(step.end_time)
    .bind(&step.inputs)
    .bind(&step.outputs)
    .bind(&step.reasoning)
    .bind(step.candidates_in)
    .bind(step.candidates_out)
    .bind(&step.candidates_data)
    .bind(&step.filters_applied)
    .bind(&step.metadata)
    .bind(&step.error)
    .execute(conn)
    .await?;

    Ok(())
}

/// Steps of a run, ordered by sequence
pub async fn find_by_run(pool: &PgPool, run_id: Uuid) -> Result<Vec<StepView>, sqlx::Error> {
    let mut builder = QueryBuilder::<Postgres>::new(STEP_COLUMNS);
    builder
        .push(" WHERE run_id = ")
        .push_bind(run_id)
        .push(" ORDER BY sequence ASC");

    let rows = builder.build_query_as::<StepRow>().fetch_all(pool).await?;
    rows.into_iter().map(StepView::try_from).collect()
}

/// Steps matching `query` across all runs, newest first
pub async fn search(
    pool: &PgPool,
    query: &StepQuery,
    limit: i64,
    offset: i64,
) -> Result<Vec<StepView>, sqlx::Error> {
    let mut builder = QueryBuilder::<Postgres>::new(STEP_COLUMNS);
    push_query(&mut builder, query);
    builder
        .push(" ORDER BY start_time DESC NULLS LAST, sequence ASC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);

    let rows = builder.build_query_as::<StepRow>().fetch_all(pool).await?;
    rows.into_iter().map(StepView::try_from).collect()
}

/// Count steps matching `query`
pub async fn count(pool: &PgPool, query: &StepQuery) -> Result<i64, sqlx::Error> {
    let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM step_metrics");
    push_query(&mut builder, query);
    builder.build_query_scalar::<i64>().fetch_one(pool).await
}

/// Per-group statistics, grouped by the value at `path` in step metadata
///
/// `percentiles` come back in the order they were requested.
pub async fn aggregate(
    pool: &PgPool,
    path: Vec<String>,
    step_type: Option<StepType>,
    pipeline_name: Option<&str>,
    percentiles: Vec<f64>,
) -> Result<Vec<AggregateRow>, sqlx::Error> {
    let mut builder = QueryBuilder::<Postgres>::new("SELECT metadata #> ");
    builder
        .push_bind(path)
        .push("::text[] AS key, COUNT(*) AS count, AVG(duration_ms) AS avg_duration_ms, ")
        .push("percentile_cont(")
        .push_bind(percentiles)
        .push("::float8[]) WITHIN GROUP (ORDER BY duration_ms) AS percentiles")
        .push(" FROM step_metrics WHERE TRUE");

    if let Some(step_type) = step_type {
        builder.push(" AND step_type = ").push_bind(step_type.as_str());
    }
    if let Some(name) = pipeline_name {
        builder
            .push(" AND pipeline_name = ")
            .push_bind(name.to_string());
    }
    builder.push(" GROUP BY 1 ORDER BY count DESC");

    builder.build_query_as::<AggregateRow>().fetch_all(pool).await
}

fn push_query(builder: &mut QueryBuilder<'_, Postgres>, query: &StepQuery) {
    builder.push(" WHERE TRUE");

    if let Some(name) = &query.pipeline_name {
        builder.push(" AND pipeline_name = ").push_bind(name.clone());
    }
    if let Some(name) = &query.step_name {
        builder.push(" AND step_name = ").push_bind(name.clone());
    }
    if let Some(step_type) = query.step_type {
        builder.push(" AND step_type = ").push_bind(step_type.as_str());
    }

    // NULL metrics never satisfy a bound, so only steps with both counts
    // (or both timestamps) can match these.
    if let Some(min) = query.min_reduction_rate {
        builder.push(" AND reduction_rate >= ").push_bind(min);
    }
    if let Some(max) = query.max_reduction_rate {
        builder.push(" AND reduction_rate <= ").push_bind(max);
    }
    if let Some(min) = query.min_duration_ms {
        builder.push(" AND duration_ms >= ").push_bind(min);
    }
    if let Some(max) = query.max_duration_ms {
        builder.push(" AND duration_ms <= ").push_bind(max);
    }

    if let Some(min) = query.min_candidates_in {
        builder.push(" AND candidates_in >= ").push_bind(min);
    }
    if let Some(max) = query.max_candidates_in {
        builder.push(" AND candidates_in <= ").push_bind(max);
    }
    if let Some(min) = query.min_candidates_out {
        builder.push(" AND candidates_out >= ").push_bind(min);
    }
    if let Some(max) = query.max_candidates_out {
        builder.push(" AND candidates_out <= ").push_bind(max);
    }

    if let Some(from) = query.start_time_from {
        builder.push(" AND start_time >= ").push_bind(from);
    }
    if let Some(to) = query.start_time_to {
        builder.push(" AND start_time <= ").push_bind(to);
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct StepRow {
    id: Uuid,
    run_id: Uuid,
    step_name: String,
    step_type: String,
    sequence: i64,
    start_time: Option<chrono::DateTime<chrono::Utc>>,
    end_time: Option<chrono::DateTime<chrono::Utc>>,
    inputs: serde_json::Value,
    outputs: serde_json::Value,
    reasoning: Option<String>,
    candidates_in: Option<i64>,
    candidates_out: Option<i64>,
    candidates_data: Option<serde_json::Value>,
    filters_applied: serde_json::Value,
    metadata: serde_json::Value,
    error: Option<String>,
    duration_ms: Option<f64>,
    reduction_rate: Option<f64>,
}

impl TryFrom<StepRow> for StepView {
    type Error = sqlx::Error;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        let step_type = row
            .step_type
            .parse::<StepType>()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        let sequence = u32::try_from(row.sequence).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

        Ok(StepView {
            step: Step {
                id: row.id,
                run_id: Some(row.run_id),
                step_name: row.step_name,
                step_type,
                sequence,
                start_time: row.start_time,
                end_time: row.end_time,
                inputs: row.inputs,
                outputs: row.outputs,
                reasoning: row.reasoning,
                candidates_in: row.candidates_in,
                candidates_out: row.candidates_out,
                candidates_data: row.candidates_data,
                filters_applied: row.filters_applied,
                metadata: row.metadata,
                error: row.error,
            },
            duration_ms: row.duration_ms,
            reduction_rate: row.reduction_rate,
        })
    }
}

/// One group of an aggregation
#[derive(Debug, sqlx::FromRow)]
pub struct AggregateRow {
    pub key: Option<serde_json::Value>,
    pub count: i64,
    pub avg_duration_ms: Option<f64>,
    pub percentiles: Option<Vec<Option<f64>>>,
}
