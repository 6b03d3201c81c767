//! Ingestion DTOs

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::run::Run;
use crate::domain::step::Step;

/// A finalized trace: one run plus its steps in close order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestPayload {
    pub run: Run,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl IngestPayload {
    pub fn new(run: Run, steps: Vec<Step>) -> Self {
        Self { run, steps }
    }
}

/// Acknowledgement returned once a trace is persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResponse {
    pub run_id: Uuid,
    pub steps_ingested: usize,
}
