//! Core domain types
//!
//! The trace model shared between the SDK (which builds traces) and the
//! ingestion service (which persists and queries them).

pub mod run;
pub mod step;

use thiserror::Error;

/// Error returned when parsing an enumerated value from its wire form
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind} '{value}' (expected one of: {expected})")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
    pub expected: &'static str,
}

/// Milliseconds between two instants, with microsecond precision.
pub(crate) fn millis_between(
    start: chrono::DateTime<chrono::Utc>,
    end: chrono::DateTime<chrono::Utc>,
) -> f64 {
    let delta = end - start;
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1000.0,
        None => delta.num_milliseconds() as f64,
    }
}

/// Current time truncated to microseconds, the precision the store keeps.
///
/// Capturing at storage precision keeps derived durations identical before
/// and after a round-trip through the ingestion service.
pub fn now() -> chrono::DateTime<chrono::Utc> {
    use chrono::SubsecRound;
    chrono::Utc::now().trunc_subsecs(6)
}
