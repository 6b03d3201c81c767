//! Analytics endpoints

use crate::XrayClient;
use crate::error::Result;
use xray_core::dto::analytics::PipelineAnalytics;

impl XrayClient {
    /// Get aggregated statistics for one pipeline
    pub async fn pipeline_analytics(&self, pipeline_name: &str) -> Result<PipelineAnalytics> {
        let url = format!("{}/api/analytics/pipeline/{}", self.base_url, pipeline_name);
        let response = self.client.get(&url).send().await?;

        self.handle_response(response).await
    }
}
