//! Run Repository
//!
//! Handles all database operations on the `runs` table.

use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;
use xray_core::domain::run::{Run, RunStatus};

/// Filters for listing runs
#[derive(Debug, Clone, Default)]
pub struct RunCriteria {
    pub pipeline_name: Option<String>,
    pub pipeline_version: Option<String>,
    pub status: Option<RunStatus>,
    pub start_time_from: Option<chrono::DateTime<chrono::Utc>>,
    pub start_time_to: Option<chrono::DateTime<chrono::Utc>>,
    /// Document the run metadata must contain (`@>`)
    pub metadata: Option<serde_json::Value>,
}

/// Insert a run
pub async fn insert(conn: &mut PgConnection, run: &Run) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO runs (id, pipeline_name, pipeline_version, start_time, end_time,
                          status, metadata, final_output, error)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(run.id)
    .bind(&run.pipeline_name)
    .bind(&run.pipeline_version)
    .bind(run.start_time)
    .bind(run.end_time)
    .bind(run.status.as_str())
    .bind(&run.metadata)
    .bind(&run.final_output)
    .bind(&run.error)
    .execute(conn)
    .await?;

    Ok(())
}

/// Check whether a run id is already taken
pub async fn exists(conn: &mut PgConnection, id: Uuid) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM runs WHERE id = $1)")
        .bind(id)
        .fetch_one(conn)
        .await
}

/// Find a run by ID
pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Run>, sqlx::Error> {
    let row = sqlx::query_as::<_, RunRow>(
        r#"
        SELECT id, pipeline_name, pipeline_version, start_time, end_time,
               status, metadata, final_output, error
        FROM runs
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(Run::try_from).transpose()
}

/// List runs matching `criteria`, newest first
pub async fn list(
    pool: &PgPool,
    criteria: &RunCriteria,
    limit: i64,
    offset: i64,
) -> Result<Vec<Run>, sqlx::Error> {
    let mut builder = QueryBuilder::<Postgres>::new(
        r#"
        SELECT id, pipeline_name, pipeline_version, start_time, end_time,
               status, metadata, final_output, error
        FROM runs
        "#,
    );
    push_criteria(&mut builder, criteria);
    builder
        .push(" ORDER BY start_time DESC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);

    let rows = builder.build_query_as::<RunRow>().fetch_all(pool).await?;
    rows.into_iter().map(Run::try_from).collect()
}

/// Count runs matching `criteria`
pub async fn count(pool: &PgPool, criteria: &RunCriteria) -> Result<i64, sqlx::Error> {
    let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM runs");
    push_criteria(&mut builder, criteria);
    builder.build_query_scalar::<i64>().fetch_one(pool).await
}

fn push_criteria(builder: &mut QueryBuilder<'_, Postgres>, criteria: &RunCriteria) {
    builder.push(" WHERE TRUE");

    if let Some(name) = &criteria.pipeline_name {
        builder.push(" AND pipeline_name = ").push_bind(name.clone());
    }
    if let Some(version) = &criteria.pipeline_version {
        builder.push(" AND pipeline_version = ").push_bind(version.clone());
    }
    if let Some(status) = criteria.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(from) = criteria.start_time_from {
        builder.push(" AND start_time >= ").push_bind(from);
    }
    if let Some(to) = criteria.start_time_to {
        builder.push(" AND start_time <= ").push_bind(to);
    }
    if let Some(metadata) = &criteria.metadata {
        builder.push(" AND metadata @> ").push_bind(metadata.clone());
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    pipeline_name: String,
    pipeline_version: String,
    start_time: chrono::DateTime<chrono::Utc>,
    end_time: Option<chrono::DateTime<chrono::Utc>>,
    status: String,
    metadata: serde_json::Value,
    final_output: Option<serde_json::Value>,
    error: Option<String>,
}

impl TryFrom<RunRow> for Run {
    type Error = sqlx::Error;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<RunStatus>()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

        Ok(Run {
            id: row.id,
            pipeline_name: row.pipeline_name,
            pipeline_version: row.pipeline_version,
            start_time: row.start_time,
            end_time: row.end_time,
            status,
            metadata: row.metadata,
            final_output: row.final_output,
            error: row.error,
        })
    }
}
