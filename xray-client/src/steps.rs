//! Step endpoints: cross-pipeline queries and aggregation

use crate::XrayClient;
use crate::error::Result;
use xray_core::dto::analytics::{AggregateRequest, AggregateResponse};
use xray_core::dto::query::{StepList, StepQuery};

impl XrayClient {
    /// Query steps across all pipelines
    ///
    /// # Example
    /// ```no_run
    /// # use xray_client::XrayClient;
    /// # use xray_core::dto::query::StepQuery;
    /// # use xray_core::domain::step::StepType;
    /// # async fn example() -> anyhow::Result<()> {
    /// let client = XrayClient::new("http://localhost:8000");
    /// let slow_llm_calls = client.query_steps(&StepQuery {
    ///     step_type: Some(StepType::Llm),
    ///     min_duration_ms: Some(2_000.0),
    ///     ..Default::default()
    /// }).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn query_steps(&self, query: &StepQuery) -> Result<StepList> {
        let url = format!("{}/api/steps/query", self.base_url);
        let response = self.client.post(&url).json(query).send().await?;

        self.handle_response(response).await
    }

    /// Group steps by a metadata path and compute duration statistics
    pub async fn aggregate_steps(&self, req: &AggregateRequest) -> Result<AggregateResponse> {
        let url = format!("{}/api/steps/aggregate", self.base_url);
        let response = self.client.post(&url).json(req).send().await?;

        self.handle_response(response).await
    }
}
