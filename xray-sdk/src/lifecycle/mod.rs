//! Run and step lifecycle
//!
//! A [`Tracer`] opens runs; a run opens steps. Opening returns an owning
//! scope ([`RunScope`], [`StepScope`]) that binds itself as current and is
//! finalized exactly once: explicitly through `close(outcome)`, through the
//! closure helpers, or on drop (including unwinding) as a last resort.
//!
//! The handles ([`RunHandle`], [`StepHandle`]) are cheap clones that can be
//! passed around or looked up via [`crate::current_run`]. Mutating a handle
//! whose scope has already closed fails with [`XrayError::ScopeClosed`].

mod run;
mod step;

pub use run::{RunHandle, RunScope};
pub use step::{StepHandle, StepScope};

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use xray_core::domain::step::StepType;

use crate::config::XrayConfig;
use crate::context;
use crate::error::XrayError;
use crate::transport::{HttpSink, TraceSink, Transport};

/// How a scope ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Ended by an error; the message is recorded on the run or step
    Failure(String),
}

impl Outcome {
    pub fn failure(error: impl fmt::Display) -> Self {
        Outcome::Failure(error.to_string())
    }

    /// Success for `Ok`, failure carrying the error message for `Err`
    pub fn from_result<T, E: fmt::Display>(result: &Result<T, E>) -> Self {
        match result {
            Ok(_) => Outcome::Success,
            Err(e) => Outcome::failure(e),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// Entry point of the capture runtime
///
/// Owns the configuration and the transport. Cloning is cheap; every clone
/// shares the same transport.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

struct TracerInner {
    config: Arc<XrayConfig>,
    transport: Transport,
}

impl Tracer {
    /// Creates a tracer that delivers to the configured ingestion API
    pub fn new(config: XrayConfig) -> Result<Self, XrayError> {
        config.validate()?;
        let sink = HttpSink::new(&config)?;
        Self::with_sink(config, Arc::new(sink))
    }

    /// Creates a tracer configured from `XRAY_*` environment variables
    pub fn from_env() -> Result<Self, XrayError> {
        Self::new(XrayConfig::from_env()?)
    }

    /// Creates a tracer that delivers through a custom sink
    pub fn with_sink(config: XrayConfig, sink: Arc<dyn TraceSink>) -> Result<Self, XrayError> {
        config.validate()?;
        let config = Arc::new(config);
        let transport = Transport::new(config.clone(), sink);
        Ok(Self {
            inner: Arc::new(TracerInner { config, transport }),
        })
    }

    pub fn config(&self) -> &XrayConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    /// Opens a run and binds it as current
    pub fn start_run(
        &self,
        pipeline_name: impl Into<String>,
        pipeline_version: impl Into<String>,
        metadata: serde_json::Value,
    ) -> RunScope {
        RunScope::open(self.clone(), pipeline_name.into(), pipeline_version.into(), metadata)
    }

    /// Runs `f` inside a run scope and closes it with the closure's outcome
    ///
    /// The closure's own error is returned unchanged. When the closure
    /// succeeds but delivery fails under the `raise` fallback, the transport
    /// error is returned instead.
    pub fn trace_run<T, E, F>(
        &self,
        pipeline_name: impl Into<String>,
        pipeline_version: impl Into<String>,
        metadata: serde_json::Value,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce(&RunHandle) -> Result<T, E>,
        E: fmt::Display + From<XrayError>,
    {
        let run = self.start_run(pipeline_name, pipeline_version, metadata);
        let result = f(&run);
        let closed = run.close(Outcome::from_result(&result));
        settle(result, closed)
    }

    /// Async counterpart of [`Tracer::trace_run`]
    ///
    /// The run lives in its own task-local frame, so it stays current for
    /// code awaited inside `f` and is invisible to other tasks.
    pub async fn trace_run_async<T, E, F, Fut>(
        &self,
        pipeline_name: impl Into<String>,
        pipeline_version: impl Into<String>,
        metadata: serde_json::Value,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce(RunHandle) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display + From<XrayError>,
    {
        let pipeline_name = pipeline_name.into();
        let pipeline_version = pipeline_version.into();
        context::scope(async move {
            let run = self.start_run(pipeline_name, pipeline_version, metadata);
            let result = f(run.handle()).await;
            let closed = run.close_async(Outcome::from_result(&result)).await;
            settle(result, closed)
        })
        .await
    }

    /// Run currently open on this thread or task
    pub fn current_run(&self) -> Option<RunHandle> {
        context::current_run()
    }

    /// Step currently open on this thread or task
    pub fn current_step(&self) -> Option<StepHandle> {
        context::current_step()
    }
}

/// Opens a step in the current run
///
/// Fails with [`XrayError::NoActiveRun`] when no run is bound on this
/// thread or task.
pub fn step(step_name: impl Into<String>, step_type: StepType) -> Result<StepScope, XrayError> {
    context::current_run()
        .ok_or(XrayError::NoActiveRun)?
        .step(step_name, step_type)
}

/// Runs `f` inside a step of the current run
pub fn in_step<T, E, F>(step_name: impl Into<String>, step_type: StepType, f: F) -> Result<T, E>
where
    F: FnOnce(&StepHandle) -> Result<T, E>,
    E: fmt::Display + From<XrayError>,
{
    context::current_run()
        .ok_or(XrayError::NoActiveRun)?
        .in_step(step_name, step_type, f)
}

/// Combines the body's result with the result of closing its scope
///
/// The body's error wins; a close error only surfaces when the body
/// succeeded.
pub(crate) fn settle<T, C, E>(result: Result<T, E>, closed: Result<C, XrayError>) -> Result<T, E>
where
    E: From<XrayError>,
{
    match (result, closed) {
        (Err(e), _) => Err(e),
        (Ok(_), Err(e)) => Err(e.into()),
        (Ok(value), Ok(_)) => Ok(value),
    }
}
