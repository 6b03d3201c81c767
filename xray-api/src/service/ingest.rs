//! Ingest Service
//!
//! Validates a finalized trace and persists it atomically.

use std::collections::HashSet;

use sqlx::PgPool;
use thiserror::Error;
use xray_core::dto::ingest::{IngestPayload, IngestResponse};

use crate::repository::{is_unique_violation, run_repository, step_repository};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{0}")]
    ValidationError(String),

    #[error("database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
}

/// Checks the structural shape of a trace before anything is written
pub fn validate(payload: &IngestPayload) -> Result<(), IngestError> {
    let run = &payload.run;
    if run.pipeline_name.trim().is_empty() {
        return Err(invalid("pipeline_name must not be empty"));
    }
    if run.pipeline_version.trim().is_empty() {
        return Err(invalid("pipeline_version must not be empty"));
    }
    if !run.is_consistent() {
        return Err(invalid(format!(
            "run {} has status '{}' inconsistent with its end_time",
            run.id, run.status
        )));
    }

    require_object("run metadata", &run.metadata)?;

    let mut sequences = HashSet::new();
    let mut ids = HashSet::new();
    for step in &payload.steps {
        if step.step_name.trim().is_empty() {
            return Err(invalid(format!("step {} has an empty step_name", step.id)));
        }
        for (field, value) in [
            ("inputs", &step.inputs),
            ("outputs", &step.outputs),
            ("filters_applied", &step.filters_applied),
            ("metadata", &step.metadata),
        ] {
            require_object(&format!("step {} {}", step.id, field), value)?;
        }
        if let Some(run_id) = step.run_id
            && run_id != run.id
        {
            return Err(invalid(format!(
                "step {} belongs to run {}, not {}",
                step.id, run_id, run.id
            )));
        }
        if !sequences.insert(step.sequence) {
            return Err(invalid(format!("duplicate step sequence {}", step.sequence)));
        }
        if !ids.insert(step.id) {
            return Err(invalid(format!("duplicate step id {}", step.id)));
        }
        if let (Some(start), Some(end)) = (step.start_time, step.end_time)
            && end < start
        {
            return Err(invalid(format!("step {} ends before it starts", step.id)));
        }
        if step.candidates_in.is_some_and(|n| n < 0) || step.candidates_out.is_some_and(|n| n < 0) {
            return Err(invalid(format!(
                "step {} has a negative candidate count",
                step.id
            )));
        }
    }

    Ok(())
}

/// Persist a run and all its steps in one transaction
pub async fn ingest(pool: &PgPool, payload: IngestPayload) -> Result<IngestResponse, IngestError> {
    validate(&payload)?;

    let run_id = payload.run.id;
    let mut tx = pool.begin().await?;

    if run_repository::exists(&mut tx, run_id).await? {
        return Err(invalid(format!("run {} already exists", run_id)));
    }

    run_repository::insert(&mut tx, &payload.run)
        .await
        .map_err(|e| conflict(e, run_id))?;
    for step in &payload.steps {
        step_repository::insert(&mut tx, run_id, step)
            .await
            .map_err(|e| conflict(e, run_id))?;
    }

    tx.commit().await.map_err(|e| conflict(e, run_id))?;

    tracing::info!(
        "Ingested run {} ({}) with {} steps",
        run_id,
        payload.run.pipeline_name,
        payload.steps.len()
    );

    Ok(IngestResponse {
        run_id,
        steps_ingested: payload.steps.len(),
    })
}

fn require_object(what: &str, value: &serde_json::Value) -> Result<(), IngestError> {
    if value.is_object() {
        Ok(())
    } else {
        Err(invalid(format!("{} must be a JSON object", what)))
    }
}

fn invalid(message: impl Into<String>) -> IngestError {
    IngestError::ValidationError(message.into())
}

// A concurrent ingest of the same ids can still race past the existence check
fn conflict(err: sqlx::Error, run_id: uuid::Uuid) -> IngestError {
    if is_unique_violation(&err) {
        invalid(format!("run {} or one of its steps already exists", run_id))
    } else {
        IngestError::DatabaseError(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use xray_core::domain::run::{Run, RunStatus};
    use xray_core::domain::step::{Step, StepType};

    fn finished_run() -> Run {
        let mut run = Run::start("competitor_selection", "1.0.0", json!({}));
        run.status = RunStatus::Success;
        run.end_time = Some(run.start_time + Duration::milliseconds(20));
        run
    }

    fn payload(steps: usize) -> IngestPayload {
        let run = finished_run();
        let steps = (0..steps)
            .map(|i| Step::new(run.id, format!("step_{}", i), StepType::Filter, i as u32))
            .collect();
        IngestPayload::new(run, steps)
    }

    fn assert_invalid(payload: &IngestPayload, fragment: &str) {
        match validate(payload) {
            Err(IngestError::ValidationError(msg)) => {
                assert!(msg.contains(fragment), "'{}' does not mention '{}'", msg, fragment)
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_payload() {
        assert!(validate(&payload(3)).is_ok());
        assert!(validate(&payload(0)).is_ok());
    }

    #[test]
    fn test_rejects_empty_pipeline_name() {
        let mut payload = payload(1);
        payload.run.pipeline_name = "  ".to_string();
        assert_invalid(&payload, "pipeline_name");
    }

    #[test]
    fn test_rejects_inconsistent_status() {
        let mut payload = payload(1);
        payload.run.end_time = None;
        assert_invalid(&payload, "inconsistent");
    }

    #[test]
    fn test_rejects_duplicate_sequence() {
        let mut payload = payload(2);
        payload.steps[1].sequence = 0;
        assert_invalid(&payload, "duplicate step sequence 0");
    }

    #[test]
    fn test_rejects_step_from_another_run() {
        let mut payload = payload(1);
        payload.steps[0].run_id = Some(uuid::Uuid::new_v4());
        assert_invalid(&payload, "belongs to run");
    }

    #[test]
    fn test_step_without_run_id_is_accepted() {
        let mut payload = payload(1);
        payload.steps[0].run_id = None;
        assert!(validate(&payload).is_ok());
    }

    #[test]
    fn test_rejects_step_ending_before_start() {
        let mut payload = payload(1);
        let start = payload.run.start_time;
        payload.steps[0].start_time = Some(start);
        payload.steps[0].end_time = Some(start - Duration::milliseconds(1));
        assert_invalid(&payload, "ends before it starts");
    }

    #[test]
    fn test_rejects_non_object_documents() {
        let mut payload = payload(1);
        payload.run.metadata = json!(["region", "us"]);
        assert_invalid(&payload, "run metadata must be a JSON object");

        let mut payload = payload_with_step_field("inputs", json!("query text"));
        assert_invalid(&payload, "inputs must be a JSON object");
        payload.steps[0].inputs = json!({ "query": "query text" });
        assert!(validate(&payload).is_ok());

        assert_invalid(&payload_with_step_field("outputs", json!(42)), "outputs");
        assert_invalid(&payload_with_step_field("filters_applied", json!(null)), "filters_applied");
        assert_invalid(&payload_with_step_field("metadata", json!([1, 2])), "metadata");
    }

    #[test]
    fn test_free_form_fields_accept_any_json() {
        let mut payload = payload(1);
        payload.run.final_output = Some(json!(["a", "b"]));
        payload.steps[0].candidates_data = Some(json!([1, "two", { "three": 3 }]));
        assert!(validate(&payload).is_ok());
    }

    fn payload_with_step_field(field: &str, value: serde_json::Value) -> IngestPayload {
        let mut payload = payload(1);
        let step = &mut payload.steps[0];
        match field {
            "inputs" => step.inputs = value,
            "outputs" => step.outputs = value,
            "filters_applied" => step.filters_applied = value,
            "metadata" => step.metadata = value,
            other => panic!("unknown step field {}", other),
        }
        payload
    }

    #[test]
    fn test_rejects_negative_counts() {
        let mut payload = payload(1);
        payload.steps[0].candidates_in = Some(-1);
        assert_invalid(&payload, "negative");
    }
}
