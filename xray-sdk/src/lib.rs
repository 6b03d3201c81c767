//! X-Ray SDK
//!
//! Captures the decision context of multi-step pipelines: what each step
//! received, what it produced, why, and how many candidates survived.
//!
//! Architecture:
//! - Configuration: immutable settings injected into a [`Tracer`]
//! - Context: per-thread / per-task tracking of the current run and step
//! - Lifecycle: run and step scopes with guaranteed finalization
//! - Sampler: bounds large candidate lists before they are shipped
//! - Transport: delivers finished traces with retry and a fallback policy
//!
//! # Example
//!
//! ```no_run
//! use xray_sdk::{StepType, Tracer, XrayConfig, XrayError};
//!
//! fn main() -> Result<(), XrayError> {
//!     let tracer = Tracer::new(XrayConfig::default())?;
//!
//!     tracer.trace_run("competitor_selection", "1.0.0", serde_json::json!({}), |run| {
//!         run.in_step("price_filter", StepType::Filter, |step| {
//!             step.set_candidates(5000, 450, None)?;
//!             step.set_reasoning("Dropped listings outside the price band")?;
//!             Ok::<_, XrayError>(())
//!         })
//!     })
//! }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod sampler;
pub mod transport;

pub use config::{FallbackMode, SamplingConfig, SamplingStrategy, XrayConfig};
pub use context::{current_run, current_step};
pub use error::{DeliveryError, TransportError, XrayError};
pub use lifecycle::{Outcome, RunHandle, RunScope, StepHandle, StepScope, Tracer, in_step, step};
pub use transport::{
    BackgroundDelivery, DeliveryOutcome, DispatchStatus, HttpSink, InMemorySink, TraceSink,
    Transport,
};
pub use xray_core::domain::run::{Run, RunStatus};
pub use xray_core::domain::step::{Step, StepType};
pub use xray_core::dto::ingest::IngestPayload;
