//! Error types for the capture runtime

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the SDK
#[derive(Debug, Error)]
pub enum XrayError {
    /// A step was opened with no run bound on this thread or task
    #[error("no active run: open a run scope before opening a step")]
    NoActiveRun,

    /// A scope was mutated after it closed
    #[error("{kind} '{name}' is already closed")]
    ScopeClosed { kind: &'static str, name: String },

    /// An explicit sequence number collides with one already assigned
    #[error("sequence {sequence} is already used in run {run_id}")]
    DuplicateSequence { run_id: uuid::Uuid, sequence: u32 },

    /// No sequence number is left above the ones already taken
    #[error("run {run_id} has no sequence number left to assign")]
    SequenceExhausted { run_id: uuid::Uuid },

    /// Trace delivery failed and the fallback mode is `raise`
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Delivery gave up after exhausting its attempts
#[derive(Debug, Error)]
#[error("trace delivery failed after {attempts} attempt(s): {last}")]
pub struct TransportError {
    pub attempts: u32,
    pub last: DeliveryError,
}

/// Why a single delivery attempt failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Connection could not be established or was dropped
    #[error("ingestion endpoint unreachable: {0}")]
    Unreachable(String),

    /// No response within the configured timeout
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The endpoint answered with a non-success status
    #[error("ingestion endpoint rejected the trace (status {status}): {message}")]
    Rejected { status: u16, message: String },

    /// The endpoint answered, but not with a valid acknowledgement
    #[error("invalid response from ingestion endpoint: {0}")]
    InvalidResponse(String),

    /// The background worker never reported back
    #[error("delivery worker stopped: {0}")]
    WorkerLost(String),
}

impl DeliveryError {
    /// Whether another attempt could succeed
    ///
    /// A 4xx means the payload itself is unacceptable; resending it is futile.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Rejected { status, .. } => !(400..500).contains(status),
            DeliveryError::Unreachable(_)
            | DeliveryError::Timeout(_)
            | DeliveryError::InvalidResponse(_) => true,
            DeliveryError::WorkerLost(_) => false,
        }
    }
}
