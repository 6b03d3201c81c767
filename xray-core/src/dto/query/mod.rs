//! Query DTOs

use serde::{Deserialize, Serialize};

use crate::domain::run::{Run, RunStatus};
use crate::domain::step::{Step, StepType};

/// A step as returned by queries, with its derived metrics
///
/// `duration_ms` and `reduction_rate` are computed when the step is read and
/// are never part of an ingest payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepView {
    #[serde(flatten)]
    pub step: Step,
    pub duration_ms: Option<f64>,
    pub reduction_rate: Option<f64>,
}

impl From<Step> for StepView {
    fn from(step: Step) -> Self {
        Self {
            duration_ms: step.duration_ms(),
            reduction_rate: step.reduction_rate(),
            step,
        }
    }
}

/// A run with its steps ordered by sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDetail {
    pub run: Run,
    pub steps: Vec<StepView>,
}

/// Query-string filters for listing runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunFilter {
    pub pipeline_name: Option<String>,
    pub pipeline_version: Option<String>,
    pub status: Option<RunStatus>,
    pub start_time_from: Option<chrono::DateTime<chrono::Utc>>,
    pub start_time_to: Option<chrono::DateTime<chrono::Utc>>,
    /// JSON document the run metadata must contain
    pub metadata: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// One page of runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunList {
    pub runs: Vec<Run>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Cross-pipeline step filters
///
/// Reduction-rate and duration bounds apply to the derived metrics, which
/// are computed from stored counts and timestamps at query time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepQuery {
    pub pipeline_name: Option<String>,
    pub step_name: Option<String>,
    pub step_type: Option<StepType>,
    pub min_reduction_rate: Option<f64>,
    pub max_reduction_rate: Option<f64>,
    pub min_duration_ms: Option<f64>,
    pub max_duration_ms: Option<f64>,
    pub min_candidates_in: Option<i64>,
    pub max_candidates_in: Option<i64>,
    pub min_candidates_out: Option<i64>,
    pub max_candidates_out: Option<i64>,
    pub start_time_from: Option<chrono::DateTime<chrono::Utc>>,
    pub start_time_to: Option<chrono::DateTime<chrono::Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// One page of steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepList {
    pub steps: Vec<StepView>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_step_view_flattens_step_fields() {
        let mut step = Step::new(Uuid::new_v4(), "price_filter", StepType::Filter, 2);
        step.candidates_in = Some(100);
        step.candidates_out = Some(25);

        let json = serde_json::to_value(StepView::from(step)).unwrap();
        assert_eq!(json["step_name"], "price_filter");
        assert_eq!(json["sequence"], 2);
        assert_eq!(json["reduction_rate"], 0.75);
        assert!(json["duration_ms"].is_null());
    }

    #[test]
    fn test_step_query_accepts_partial_body() {
        let query: StepQuery = serde_json::from_value(serde_json::json!({
            "step_type": "filter",
            "min_reduction_rate": 0.5
        }))
        .unwrap();

        assert_eq!(query.step_type, Some(StepType::Filter));
        assert_eq!(query.min_reduction_rate, Some(0.5));
        assert!(query.limit.is_none());
    }
}
