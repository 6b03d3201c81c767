//! X-Ray ingestion and query service
//!
//! Layers, outermost first:
//! - api: axum handlers, routing and error mapping
//! - service: validation and query rules
//! - repository: SQL against the `runs` / `steps` tables and the
//!   `step_metrics` view
//! - db: pool creation and schema migrations

pub mod api;
pub mod config;
pub mod db;
pub mod repository;
pub mod service;
