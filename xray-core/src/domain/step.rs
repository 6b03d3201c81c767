//! Step domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::run::empty_object;
use super::{ParseEnumError, millis_between};

/// One instrumented stage of a run
///
/// Carries the decision context of the stage: what went in, what came out,
/// why, and how many candidates survived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    #[serde(default)]
    pub run_id: Option<Uuid>,
    pub step_name: String,
    pub step_type: StepType,
    pub sequence: u32,
    #[serde(default)]
    pub start_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default = "empty_object")]
    pub inputs: serde_json::Value,
    #[serde(default = "empty_object")]
    pub outputs: serde_json::Value,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub candidates_in: Option<i64>,
    #[serde(default)]
    pub candidates_out: Option<i64>,
    #[serde(default)]
    pub candidates_data: Option<serde_json::Value>,
    #[serde(default = "empty_object")]
    pub filters_applied: serde_json::Value,
    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl Step {
    /// Creates an empty step belonging to `run_id`
    pub fn new(run_id: Uuid, step_name: impl Into<String>, step_type: StepType, sequence: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id: Some(run_id),
            step_name: step_name.into(),
            step_type,
            sequence,
            start_time: None,
            end_time: None,
            inputs: empty_object(),
            outputs: empty_object(),
            reasoning: None,
            candidates_in: None,
            candidates_out: None,
            candidates_data: None,
            filters_applied: empty_object(),
            metadata: empty_object(),
            error: None,
        }
    }

    /// Step duration in milliseconds, when both timestamps are known
    pub fn duration_ms(&self) -> Option<f64> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(millis_between(start, end)),
            _ => None,
        }
    }

    /// Fraction of candidates eliminated by this step
    ///
    /// `None` unless both counts are set; `0.0` when nothing came in.
    pub fn reduction_rate(&self) -> Option<f64> {
        Some(reduction_rate(self.candidates_in?, self.candidates_out?))
    }
}

/// `1 - out/in`, or `0.0` when `candidates_in` is zero
pub fn reduction_rate(candidates_in: i64, candidates_out: i64) -> f64 {
    if candidates_in == 0 {
        return 0.0;
    }
    1.0 - candidates_out as f64 / candidates_in as f64
}

/// Standardized step types, queryable across pipelines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Llm,
    Search,
    Filter,
    Rank,
    Select,
    Transform,
    #[default]
    Custom,
}

impl StepType {
    pub const ALL: [StepType; 7] = [
        StepType::Llm,
        StepType::Search,
        StepType::Filter,
        StepType::Rank,
        StepType::Select,
        StepType::Transform,
        StepType::Custom,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepType::Llm => "llm",
            StepType::Search => "search",
            StepType::Filter => "filter",
            StepType::Rank => "rank",
            StepType::Select => "select",
            StepType::Transform => "transform",
            StepType::Custom => "custom",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepType::ALL
            .into_iter()
            .find(|step_type| step_type.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "step type",
                value: s.to_string(),
                expected: "llm, search, filter, rank, select, transform, custom",
            })
    }
}
