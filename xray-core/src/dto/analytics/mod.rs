//! Aggregation and analytics DTOs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::step::StepType;

/// Metrics that can be computed per aggregation group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateMetric {
    Count,
    AvgDurationMs,
    PercentileDurationMs,
}

/// Group steps by a path inside their metadata document
///
/// `group_by` is a dot-separated path, e.g. `"model"` or `"llm.provider"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRequest {
    pub step_type: Option<StepType>,
    #[serde(default)]
    pub pipeline_name: Option<String>,
    pub group_by: String,
    #[serde(default = "default_metrics")]
    pub metrics: Vec<AggregateMetric>,
    /// Percentiles in `[0, 1]`, used with `percentile_duration_ms`
    #[serde(default = "default_percentiles")]
    pub percentiles: Vec<f64>,
}

fn default_metrics() -> Vec<AggregateMetric> {
    vec![AggregateMetric::Count, AggregateMetric::AvgDurationMs]
}

fn default_percentiles() -> Vec<f64> {
    vec![0.5, 0.95]
}

/// Duration at a given percentile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentileValue {
    pub percentile: f64,
    pub duration_ms: Option<f64>,
}

/// Metrics for one group; only the requested metrics are populated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateGroup {
    /// Value found at the group-by path, `null` when the path is absent
    pub key: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_duration_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentiles: Option<Vec<PercentileValue>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateResponse {
    pub group_by: String,
    pub groups: Vec<AggregateGroup>,
}

/// Slow step within a pipeline, ranked by average duration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BottleneckStep {
    pub step_name: String,
    pub step_type: StepType,
    pub occurrences: i64,
    pub avg_duration_ms: Option<f64>,
}

/// Aggregated health of one pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineAnalytics {
    pub pipeline_name: String,
    pub total_runs: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub partial_count: i64,
    pub success_rate: f64,
    pub avg_duration_ms: Option<f64>,
    pub total_steps: i64,
    pub steps_by_type: BTreeMap<String, i64>,
    pub bottleneck_steps: Vec<BottleneckStep>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_request_defaults() {
        let req: AggregateRequest = serde_json::from_value(serde_json::json!({
            "step_type": "llm",
            "group_by": "model"
        }))
        .unwrap();

        assert_eq!(
            req.metrics,
            vec![AggregateMetric::Count, AggregateMetric::AvgDurationMs]
        );
        assert_eq!(req.percentiles, vec![0.5, 0.95]);
        assert!(req.pipeline_name.is_none());
    }

    #[test]
    fn test_aggregate_group_omits_unrequested_metrics() {
        let group = AggregateGroup {
            key: Some(serde_json::json!("gpt-4")),
            count: Some(3),
            avg_duration_ms: None,
            percentiles: None,
        };
        let json = serde_json::to_value(&group).unwrap();
        assert_eq!(json, serde_json::json!({ "key": "gpt-4", "count": 3 }));
    }
}
