//! Run domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::{ParseEnumError, millis_between};

/// Default version recorded when a pipeline does not declare one
pub const DEFAULT_PIPELINE_VERSION: &str = "1.0.0";

/// One traced pipeline execution
///
/// Built by the SDK while the run scope is open and persisted by the
/// ingestion service once the scope closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub pipeline_name: String,
    #[serde(default = "default_pipeline_version")]
    pub pipeline_version: String,
    pub start_time: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub final_output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Run {
    /// Creates a running run that starts now
    pub fn start(
        pipeline_name: impl Into<String>,
        pipeline_version: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_name: pipeline_name.into(),
            pipeline_version: pipeline_version.into(),
            start_time: super::now(),
            end_time: None,
            status: RunStatus::Running,
            metadata,
            final_output: None,
            error: None,
        }
    }

    /// Wall-clock duration, once the run has ended
    pub fn duration_ms(&self) -> Option<f64> {
        self.end_time.map(|end| millis_between(self.start_time, end))
    }

    /// Checks the status/end-time invariant and timestamp ordering
    ///
    /// A run is `running` exactly when it has no end time, and an end time
    /// never precedes the start time.
    pub fn is_consistent(&self) -> bool {
        match self.end_time {
            None => self.status == RunStatus::Running,
            Some(end) => self.status != RunStatus::Running && end >= self.start_time,
        }
    }
}

/// Run lifecycle status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Running,
    Success,
    Failure,
    Partial,
}

impl RunStatus {
    pub const ALL: [RunStatus; 4] = [
        RunStatus::Running,
        RunStatus::Success,
        RunStatus::Failure,
        RunStatus::Partial,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
            RunStatus::Partial => "partial",
        }
    }

    /// True for every status a closed run can carry
    pub fn is_terminal(self) -> bool {
        self != RunStatus::Running
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "run status",
                value: s.to_string(),
                expected: "running, success, failure, partial",
            })
    }
}

fn default_pipeline_version() -> String {
    DEFAULT_PIPELINE_VERSION.to_string()
}

pub(crate) fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}
