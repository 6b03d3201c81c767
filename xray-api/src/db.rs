use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

/// Creates the schema; safe to run on every startup
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Create runs table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id UUID PRIMARY KEY,
            pipeline_name VARCHAR(255) NOT NULL,
            pipeline_version VARCHAR(50) NOT NULL DEFAULT '1.0.0',
            start_time TIMESTAMPTZ NOT NULL,
            end_time TIMESTAMPTZ,
            status VARCHAR(20) NOT NULL,
            metadata JSONB NOT NULL DEFAULT '{}',
            final_output JSONB,
            error TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create steps table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS steps (
            id UUID PRIMARY KEY,
            run_id UUID NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
            step_name VARCHAR(255) NOT NULL,
            step_type VARCHAR(50) NOT NULL,
            sequence BIGINT NOT NULL,
            start_time TIMESTAMPTZ,
            end_time TIMESTAMPTZ,
            inputs JSONB NOT NULL DEFAULT '{}',
            outputs JSONB NOT NULL DEFAULT '{}',
            reasoning TEXT,
            candidates_in BIGINT,
            candidates_out BIGINT,
            candidates_data JSONB,
            filters_applied JSONB NOT NULL DEFAULT '{}',
            metadata JSONB NOT NULL DEFAULT '{}',
            error TEXT,
            UNIQUE (run_id, sequence)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes for the common filters
    for statement in [
        "CREATE INDEX IF NOT EXISTS idx_runs_pipeline_name ON runs(pipeline_name)",
        "CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status)",
        "CREATE INDEX IF NOT EXISTS idx_runs_start_time ON runs(start_time DESC)",
        "CREATE INDEX IF NOT EXISTS idx_steps_run_id ON steps(run_id, sequence)",
        "CREATE INDEX IF NOT EXISTS idx_steps_step_type ON steps(step_type)",
        "CREATE INDEX IF NOT EXISTS idx_steps_step_name ON steps(step_name)",
        "CREATE INDEX IF NOT EXISTS idx_steps_candidates ON steps(candidates_in, candidates_out)",
        "CREATE INDEX IF NOT EXISTS idx_steps_metadata ON steps USING GIN (metadata)",
    ] {
        sqlx::query(statement).execute(pool).await?;
    }

    // Derived step metrics, computed at read time so they are never stale
    sqlx::query(
        r#"
        CREATE OR REPLACE VIEW step_metrics AS
        SELECT
            s.id, s.run_id, s.step_name, s.step_type, s.sequence,
            s.start_time, s.end_time, s.inputs, s.outputs, s.reasoning,
            s.candidates_in, s.candidates_out, s.candidates_data,
            s.filters_applied, s.metadata, s.error,
            r.pipeline_name,
            CASE
                WHEN s.start_time IS NOT NULL AND s.end_time IS NOT NULL
                THEN (EXTRACT(EPOCH FROM (s.end_time - s.start_time)) * 1000)::float8
            END AS duration_ms,
            CASE
                WHEN s.candidates_in IS NULL OR s.candidates_out IS NULL THEN NULL
                WHEN s.candidates_in = 0 THEN 0.0::float8
                ELSE 1.0::float8 - s.candidates_out::float8 / s.candidates_in::float8
            END AS reduction_rate
        FROM steps s
        JOIN runs r ON r.id = s.run_id
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
