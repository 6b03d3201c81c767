//! X-Ray HTTP Client
//!
//! A small, type-safe HTTP client for the X-Ray ingestion and query API.
//!
//! The capture SDK uses it to deliver finished traces; operators and tests
//! use it to query what has been persisted.
//!
//! # Example
//!
//! ```no_run
//! use xray_client::XrayClient;
//! use xray_core::dto::query::StepQuery;
//! use xray_core::domain::step::StepType;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = XrayClient::new("http://localhost:8000");
//!
//!     // Filters that eliminated more than 90% of their candidates
//!     let page = client.query_steps(&StepQuery {
//!         step_type: Some(StepType::Filter),
//!         min_reduction_rate: Some(0.9),
//!         ..Default::default()
//!     }).await?;
//!
//!     println!("{} aggressive filter steps", page.total);
//!     Ok(())
//! }
//! ```

pub mod error;
mod analytics;
mod runs;
mod steps;

// Re-export commonly used types
pub use error::{ClientError, Result};

use reqwest::Client;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// HTTP client for the X-Ray API
///
/// Endpoints are grouped by concern:
/// - Runs: ingest, fetch, list
/// - Steps: cross-pipeline queries and aggregation
/// - Analytics: per-pipeline summaries
#[derive(Debug, Clone)]
pub struct XrayClient {
    /// Base URL of the API (e.g., "http://localhost:8000")
    base_url: String,
    /// HTTP client instance
    client: Client,
}

impl XrayClient {
    /// Create a new client
    ///
    /// # Example
    /// ```
    /// use xray_client::XrayClient;
    ///
    /// let client = XrayClient::new("http://localhost:8000");
    /// ```
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a client whose requests give up after `timeout`
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(base_url, client))
    }

    /// Create a new client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Get the base URL of the API
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check that the service is up
    pub async fn health(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let response = self.client.get(&url).send().await?;

        self.handle_empty_response(response).await
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Check the status code and deserialize the JSON body
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Check the status code of a response whose body is ignored
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(())
    }
}
