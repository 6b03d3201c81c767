//! Run endpoints: ingestion and retrieval

use crate::XrayClient;
use crate::error::Result;
use uuid::Uuid;
use xray_core::dto::ingest::{IngestPayload, IngestResponse};
use xray_core::dto::query::{RunDetail, RunFilter, RunList};

impl XrayClient {
    // =============================================================================
    // Ingestion
    // =============================================================================

    /// Deliver a finished trace
    ///
    /// # Returns
    /// The persisted run id and the number of steps stored
    ///
    /// # Example
    /// ```no_run
    /// # use xray_client::XrayClient;
    /// # use xray_core::domain::run::Run;
    /// # use xray_core::dto::ingest::IngestPayload;
    /// # async fn example() -> anyhow::Result<()> {
    /// let client = XrayClient::new("http://localhost:8000");
    /// let run = Run::start("competitor_selection", "1.0.0", serde_json::json!({}));
    /// let ack = client.ingest(&IngestPayload::new(run, vec![])).await?;
    /// println!("stored {} steps", ack.steps_ingested);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn ingest(&self, payload: &IngestPayload) -> Result<IngestResponse> {
        let url = format!("{}/api/runs/ingest", self.base_url);
        tracing::debug!(
            "Posting trace for run {} ({} steps)",
            payload.run.id,
            payload.steps.len()
        );
        let response = self.client.post(&url).json(payload).send().await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Queries
    // =============================================================================

    /// Get a run with its steps ordered by sequence
    pub async fn get_run(&self, run_id: Uuid) -> Result<RunDetail> {
        let url = format!("{}/api/runs/{}", self.base_url, run_id);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }

    /// List runs matching `filter`, newest first
    pub async fn list_runs(&self, filter: &RunFilter) -> Result<RunList> {
        let url = format!("{}/api/runs", self.base_url);
        let response = self.client.get(&url).query(filter).send().await?;

        self.handle_response(response).await
    }
}
