//! Data Transfer Objects for the ingestion and query API
//!
//! Shared by the service (which serves them) and the client (which sends
//! and decodes them), so both sides agree on the wire format.

pub mod analytics;
pub mod ingest;
pub mod query;
