//! X-Ray Core
//!
//! Core types shared by the X-Ray capture SDK and the ingestion service.
//!
//! This crate contains:
//! - Domain types: Runs, Steps and their derived metrics
//! - DTOs: Wire formats for ingestion, queries and analytics

pub mod domain;
pub mod dto;
