//! Analytics Repository
//!
//! Read-only aggregate queries over one pipeline's runs and steps.

use sqlx::PgPool;

#[derive(Debug, sqlx::FromRow)]
pub struct RunSummaryRow {
    pub total_runs: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub partial_count: i64,
    pub avg_duration_ms: Option<f64>,
}

#[derive(Debug, sqlx::FromRow)]
pub struct BottleneckRow {
    pub step_name: String,
    pub step_type: String,
    pub occurrences: i64,
    pub avg_duration_ms: Option<f64>,
}

/// Run counts by status and the average duration of finished runs
pub async fn run_summary(pool: &PgPool, pipeline_name: &str) -> Result<RunSummaryRow, sqlx::Error> {
    sqlx::query_as::<_, RunSummaryRow>(
        r#"
        SELECT
            COUNT(*) AS total_runs,
            COUNT(*) FILTER (WHERE status = 'success') AS success_count,
            COUNT(*) FILTER (WHERE status = 'failure') AS failure_count,
            COUNT(*) FILTER (WHERE status = 'partial') AS partial_count,
            (AVG(EXTRACT(EPOCH FROM (end_time - start_time))) * 1000)::float8 AS avg_duration_ms
        FROM runs
        WHERE pipeline_name = $1
        "#,
    )
    .bind(pipeline_name)
    .fetch_one(pool)
    .await
}

/// Number of steps of each type
pub async fn steps_by_type(pool: &PgPool, pipeline_name: &str) -> Result<Vec<(String, i64)>, sqlx::Error> {
    sqlx::query_as::<_, (String, i64)>(
        r#"
        SELECT s.step_type, COUNT(*)
        FROM steps s
        JOIN runs r ON r.id = s.run_id
        WHERE r.pipeline_name = $1
        GROUP BY s.step_type
        ORDER BY s.step_type
        "#,
    )
    .bind(pipeline_name)
    .fetch_all(pool)
    .await
}

/// Slowest step names by average duration
pub async fn bottlenecks(pool: &PgPool, pipeline_name: &str, limit: i64) -> Result<Vec<BottleneckRow>, sqlx::Error> {
    sqlx::query_as::<_, BottleneckRow>(
        r#"
        SELECT step_name, step_type, COUNT(*) AS occurrences, AVG(duration_ms) AS avg_duration_ms
        FROM step_metrics
        WHERE pipeline_name = $1
        GROUP BY step_name, step_type
        ORDER BY avg_duration_ms DESC NULLS LAST
        LIMIT $2
        "#,
    )
    .bind(pipeline_name)
    .bind(limit)
    .fetch_all(pool)
    .await
}
