//! Trace sinks
//!
//! A sink performs exactly one delivery attempt. Retries, timeouts and the
//! fallback policy are the transport's job.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use xray_client::{ClientError, XrayClient};
use xray_core::dto::ingest::IngestPayload;

use crate::config::XrayConfig;
use crate::error::{DeliveryError, XrayError};

/// Destination for finished traces
#[async_trait]
pub trait TraceSink: Send + Sync {
    /// Makes a single delivery attempt
    async fn deliver(&self, payload: &IngestPayload) -> Result<(), DeliveryError>;
}

/// Posts traces to the ingestion API
pub struct HttpSink {
    client: XrayClient,
    timeout: Duration,
}

impl HttpSink {
    pub fn new(config: &XrayConfig) -> Result<Self, XrayError> {
        let client = XrayClient::with_timeout(&config.api_url, config.timeout)
            .map_err(|e| XrayError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            timeout: config.timeout,
        })
    }
}

#[async_trait]
impl TraceSink for HttpSink {
    async fn deliver(&self, payload: &IngestPayload) -> Result<(), DeliveryError> {
        self.client
            .ingest(payload)
            .await
            .map(|_| ())
            .map_err(|e| classify(e, self.timeout))
    }
}

fn classify(error: ClientError, timeout: Duration) -> DeliveryError {
    if error.is_timeout() {
        return DeliveryError::Timeout(timeout);
    }
    match error {
        ClientError::ApiError { status, message } => DeliveryError::Rejected { status, message },
        ClientError::ParseError(message) => DeliveryError::InvalidResponse(message),
        ClientError::RequestFailed(e) => DeliveryError::Unreachable(e.to_string()),
    }
}

/// Keeps delivered traces in memory
///
/// Clones share the same buffer, so a test can hand one clone to a
/// [`crate::Tracer`] and inspect another.
#[derive(Clone, Default)]
pub struct InMemorySink {
    traces: Arc<Mutex<Vec<IngestPayload>>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Traces delivered so far, in delivery order
    pub fn traces(&self) -> Vec<IngestPayload> {
        self.traces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Removes and returns every delivered trace
    pub fn drain(&self) -> Vec<IngestPayload> {
        self.traces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}

#[async_trait]
impl TraceSink for InMemorySink {
    async fn deliver(&self, payload: &IngestPayload) -> Result<(), DeliveryError> {
        self.traces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(payload.clone());
        Ok(())
    }
}
