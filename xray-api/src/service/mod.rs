//! Service Module
//!
//! Business logic layer for the trace store.
//! Services validate requests and orchestrate repository calls.

pub mod analytics;
pub mod ingest;
pub mod query;

// Re-export for convenience
pub use analytics as analytics_service;
pub use ingest as ingest_service;
pub use query as query_service;
