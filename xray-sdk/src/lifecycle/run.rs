//! Run scope

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};
use uuid::Uuid;
use xray_core::domain::now;
use xray_core::domain::run::{Run, RunStatus};
use xray_core::domain::step::{Step, StepType};
use xray_core::dto::ingest::IngestPayload;

use super::step::{StepHandle, StepScope};
use super::{Outcome, Tracer, settle};
use crate::context::{self, BindToken};
use crate::error::XrayError;
use crate::transport::DispatchStatus;

/// Shared reference to an open (or closed) run
#[derive(Clone)]
pub struct RunHandle {
    inner: Arc<RunShared>,
}

struct RunShared {
    id: Uuid,
    pipeline_name: String,
    tracer: Tracer,
    state: Mutex<RunState>,
}

struct RunState {
    run: Run,
    /// Finished steps, in close order
    steps: Vec<Step>,
    next_sequence: u32,
    used_sequences: HashSet<u32>,
    partial: bool,
    closed: bool,
}

impl RunHandle {
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn pipeline_name(&self) -> &str {
        &self.inner.pipeline_name
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Snapshot of the run record
    pub fn run(&self) -> Run {
        self.lock().run.clone()
    }

    /// Snapshot of the steps finished so far, in close order
    pub fn steps(&self) -> Vec<Step> {
        self.lock().steps.clone()
    }

    pub fn set_final_output(&self, output: serde_json::Value) -> Result<(), XrayError> {
        self.mutate(|state| state.run.final_output = Some(output))
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: serde_json::Value) -> Result<(), XrayError> {
        let key = key.into();
        self.mutate(|state| {
            super::step::object_mut(&mut state.run.metadata).insert(key, value);
        })
    }

    /// Closes the run as `partial` instead of `success` (a failure still wins)
    pub fn mark_partial(&self) -> Result<(), XrayError> {
        self.mutate(|state| state.partial = true)
    }

    /// Opens a step with the next free sequence number
    pub fn step(&self, step_name: impl Into<String>, step_type: StepType) -> Result<StepScope, XrayError> {
        let sequence = self.reserve_sequence(None)?;
        Ok(StepScope::open(self.clone(), step_name.into(), step_type, sequence))
    }

    /// Opens a step with an explicit sequence number
    pub fn step_with_sequence(
        &self,
        step_name: impl Into<String>,
        step_type: StepType,
        sequence: u32,
    ) -> Result<StepScope, XrayError> {
        let sequence = self.reserve_sequence(Some(sequence))?;
        Ok(StepScope::open(self.clone(), step_name.into(), step_type, sequence))
    }

    /// Runs `f` inside a step and closes it with the closure's outcome
    pub fn in_step<T, E, F>(&self, step_name: impl Into<String>, step_type: StepType, f: F) -> Result<T, E>
    where
        F: FnOnce(&StepHandle) -> Result<T, E>,
        E: fmt::Display + From<XrayError>,
    {
        let step = self.step(step_name, step_type)?;
        let result = f(&step);
        let closed = step.close(Outcome::from_result(&result));
        settle(result, closed)
    }

    /// Async counterpart of [`RunHandle::in_step`]
    ///
    /// The step is only visible through [`crate::current_step`] when the
    /// caller runs inside a task frame (see [`crate::context::scope`]).
    pub async fn in_step_async<T, E, F, Fut>(
        &self,
        step_name: impl Into<String>,
        step_type: StepType,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce(StepHandle) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display + From<XrayError>,
    {
        let step = self.step(step_name, step_type)?;
        let result = f(step.handle()).await;
        let closed = step.close(Outcome::from_result(&result));
        settle(result, closed)
    }

    fn reserve_sequence(&self, explicit: Option<u32>) -> Result<u32, XrayError> {
        let mut state = self.lock();
        if state.closed {
            return Err(self.closed_error());
        }

        let sequence = match explicit {
            Some(sequence) => {
                if state.used_sequences.contains(&sequence) {
                    return Err(XrayError::DuplicateSequence {
                        run_id: self.inner.id,
                        sequence,
                    });
                }
                state.next_sequence = state.next_sequence.max(sequence.saturating_add(1));
                sequence
            }
            None => {
                let exhausted = || XrayError::SequenceExhausted { run_id: self.inner.id };
                let mut sequence = state.next_sequence;
                while state.used_sequences.contains(&sequence) {
                    sequence = sequence.checked_add(1).ok_or_else(exhausted)?;
                }
                state.next_sequence = sequence.saturating_add(1);
                sequence
            }
        };
        state.used_sequences.insert(sequence);
        Ok(sequence)
    }

    /// Appends a finished step; steps finishing after the run are dropped
    pub(super) fn attach(&self, step: Step) {
        let mut state = self.lock();
        if state.closed {
            warn!(
                run_id = %self.inner.id,
                step = %step.step_name,
                "Step finished after its run was closed; it is not part of the trace"
            );
            return;
        }
        state.steps.push(step);
    }

    pub(super) fn tracer(&self) -> &Tracer {
        &self.inner.tracer
    }

    fn mutate(&self, f: impl FnOnce(&mut RunState)) -> Result<(), XrayError> {
        let mut state = self.lock();
        if state.closed {
            return Err(self.closed_error());
        }
        f(&mut state);
        Ok(())
    }

    fn closed_error(&self) -> XrayError {
        XrayError::ScopeClosed {
            kind: "run",
            name: self.inner.pipeline_name.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Finalizes the record and builds the trace; fails if already closed
    fn finalize(&self, outcome: &Outcome) -> Result<IngestPayload, XrayError> {
        let mut state = self.lock();
        if state.closed {
            return Err(self.closed_error());
        }

        state.closed = true;
        state.run.end_time = Some(now());
        let status = match outcome {
            Outcome::Failure(message) => {
                state.run.error = Some(message.clone());
                RunStatus::Failure
            }
            Outcome::Success if state.partial => RunStatus::Partial,
            Outcome::Success => RunStatus::Success,
        };
        state.run.status = status;

        Ok(IngestPayload::new(state.run.clone(), state.steps.clone()))
    }
}

impl fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunHandle")
            .field("id", &self.inner.id)
            .field("pipeline_name", &self.inner.pipeline_name)
            .finish()
    }
}

/// Owning scope of a run
///
/// Dereferences to its [`RunHandle`]. Dropping an unclosed scope closes it:
/// as a failure while unwinding from a panic, as a success otherwise.
#[must_use = "a run is closed and dispatched when its scope is dropped"]
pub struct RunScope {
    handle: RunHandle,
    token: Option<BindToken>,
}

impl RunScope {
    pub(super) fn open(tracer: Tracer, pipeline_name: String, pipeline_version: String, metadata: serde_json::Value) -> Self {
        let metadata = if metadata.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            metadata
        };
        let run = Run::start(pipeline_name.clone(), pipeline_version, metadata);
        debug!(run_id = %run.id, pipeline = %pipeline_name, "Run opened");

        let handle = RunHandle {
            inner: Arc::new(RunShared {
                id: run.id,
                pipeline_name,
                tracer,
                state: Mutex::new(RunState {
                    run,
                    steps: Vec::new(),
                    next_sequence: 0,
                    used_sequences: HashSet::new(),
                    partial: false,
                    closed: false,
                }),
            }),
        };

        let token = context::bind_run(handle.clone());
        Self {
            handle,
            token: Some(token),
        }
    }

    pub fn handle(&self) -> RunHandle {
        self.handle.clone()
    }

    /// Closes the run and hands the trace to the transport
    ///
    /// Returns the transport error only under the `raise` fallback.
    pub fn close(mut self, outcome: Outcome) -> Result<DispatchStatus, XrayError> {
        let payload = self.finish(&outcome)?;
        Ok(self.handle.tracer().transport().dispatch(payload)?)
    }

    /// Closes the run without blocking the executor
    ///
    /// In synchronous delivery mode the trace is sent on the calling task
    /// instead of a helper thread.
    pub async fn close_async(mut self, outcome: Outcome) -> Result<DispatchStatus, XrayError> {
        let payload = self.finish(&outcome)?;
        Ok(self.handle.tracer().transport().dispatch_async(payload).await?)
    }

    fn finish(&mut self, outcome: &Outcome) -> Result<IngestPayload, XrayError> {
        let finalized = self.handle.finalize(outcome);
        if let Some(token) = self.token.take() {
            context::unbind(token);
        }
        let payload = finalized?;
        debug!(
            run_id = %payload.run.id,
            status = %payload.run.status,
            steps = payload.steps.len(),
            "Run closed"
        );
        Ok(payload)
    }
}

impl Deref for RunScope {
    type Target = RunHandle;

    fn deref(&self) -> &RunHandle {
        &self.handle
    }
}

impl Drop for RunScope {
    fn drop(&mut self) {
        if self.token.is_none() {
            return;
        }

        let outcome = if std::thread::panicking() {
            Outcome::Failure("panicked".to_string())
        } else {
            Outcome::Success
        };
        let payload = match self.finish(&outcome) {
            Ok(payload) => payload,
            Err(_) => return,
        };
        if let Err(e) = self.handle.tracer().transport().dispatch(payload) {
            warn!(run_id = %self.handle.id(), error = %e, "Trace delivery failed for a run closed on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{FallbackMode, SamplingConfig, XrayConfig};
    use crate::error::XrayError;
    use crate::lifecycle::{Outcome, Tracer};
    use crate::transport::{DeliveryOutcome, DispatchStatus, InMemorySink};
    use serde_json::json;
    use std::sync::Arc;
    use xray_core::domain::run::RunStatus;
    use xray_core::domain::step::StepType;

    #[derive(Debug, thiserror::Error)]
    enum PipelineError {
        #[error("{0}")]
        Ranker(String),
        #[error(transparent)]
        Trace(#[from] XrayError),
    }

    fn tracer_with_sink() -> (Tracer, InMemorySink) {
        let sink = InMemorySink::new();
        let config = XrayConfig::default()
            .with_async_mode(false)
            .with_fallback(FallbackMode::Raise)
            .with_sampling(SamplingConfig::default());
        let tracer = Tracer::with_sink(config, Arc::new(sink.clone())).unwrap();
        (tracer, sink)
    }

    #[test]
    fn test_successful_run_is_delivered_with_steps() {
        let (tracer, sink) = tracer_with_sink();

        let run = tracer.start_run("competitor_selection", "1.0.0", json!({"product_id": "B0123"}));
        run.in_step("keyword_generation", StepType::Llm, |step| {
            step.set_outputs(json!({"keywords": ["phone case", "iphone 15 case"]}))
        })
        .unwrap();
        run.in_step("price_filter", StepType::Filter, |step| {
            step.set_candidates(5000, 4200, None)
        })
        .unwrap();
        run.set_final_output(json!({"asin": "B0999"})).unwrap();

        let status = run.close(Outcome::Success).unwrap();
        assert!(matches!(status, DispatchStatus::Completed(DeliveryOutcome::Delivered)));

        let traces = sink.traces();
        assert_eq!(traces.len(), 1);
        let trace = &traces[0];
        assert_eq!(trace.run.status, RunStatus::Success);
        assert!(trace.run.end_time.is_some());
        assert!(trace.run.is_consistent());
        assert_eq!(trace.run.final_output, Some(json!({"asin": "B0999"})));

        let sequences: Vec<u32> = trace.steps.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![0, 1]);
        assert!((trace.steps[1].reduction_rate().unwrap() - 0.16).abs() < 1e-9);
        assert!(trace.steps.iter().all(|s| s.run_id == Some(trace.run.id)));
    }

    #[test]
    fn test_failing_step_fails_the_run_and_propagates() {
        let (tracer, sink) = tracer_with_sink();

        let result: Result<(), PipelineError> = tracer.trace_run("checkout", "2.1.0", json!({}), |run| {
            run.in_step("rank", StepType::Rank, |_| {
                Err(PipelineError::Ranker("ranker timed out".to_string()))
            })
        });
        assert!(matches!(result, Err(PipelineError::Ranker(ref m)) if m == "ranker timed out"));

        let trace = &sink.traces()[0];
        assert_eq!(trace.run.status, RunStatus::Failure);
        assert_eq!(trace.run.error.as_deref(), Some("ranker timed out"));
        assert_eq!(trace.steps[0].error.as_deref(), Some("ranker timed out"));
        assert!(trace.steps[0].end_time.is_some());
    }

    #[test]
    fn test_mark_partial() {
        let (tracer, sink) = tracer_with_sink();
        let run = tracer.start_run("partial", "1.0.0", json!({}));
        run.mark_partial().unwrap();
        run.close(Outcome::Success).unwrap();
        assert_eq!(sink.traces()[0].run.status, RunStatus::Partial);
    }

    #[test]
    fn test_failure_wins_over_partial() {
        let (tracer, sink) = tracer_with_sink();
        let run = tracer.start_run("partial", "1.0.0", json!({}));
        run.mark_partial().unwrap();
        run.close(Outcome::failure("boom")).unwrap();
        assert_eq!(sink.traces()[0].run.status, RunStatus::Failure);
    }

    #[test]
    fn test_setters_fail_after_close() {
        let (tracer, _sink) = tracer_with_sink();
        let run = tracer.start_run("closed", "1.0.0", json!({}));
        let handle = run.handle();
        run.close(Outcome::Success).unwrap();

        assert!(handle.is_closed());
        assert!(matches!(
            handle.set_final_output(json!(1)),
            Err(XrayError::ScopeClosed { kind: "run", .. })
        ));
        assert!(matches!(
            handle.step("late", StepType::Custom),
            Err(XrayError::ScopeClosed { .. })
        ));
    }

    #[test]
    fn test_sequences_follow_creation_order() {
        let (tracer, sink) = tracer_with_sink();
        let run = tracer.start_run("sequencing", "1.0.0", json!({}));

        let outer = run.step("outer", StepType::Custom).unwrap();
        let inner = run.step("inner", StepType::Custom).unwrap();
        inner.close(Outcome::Success).unwrap();
        outer.close(Outcome::Success).unwrap();
        for i in 0..3 {
            run.in_step(format!("tail-{}", i), StepType::Transform, |_| Ok::<_, XrayError>(()))
                .unwrap();
        }
        run.close(Outcome::Success).unwrap();

        let trace = &sink.traces()[0];
        // Close order is kept; sequence numbers reflect creation.
        let names: Vec<&str> = trace.steps.iter().map(|s| s.step_name.as_str()).collect();
        assert_eq!(names, vec!["inner", "outer", "tail-0", "tail-1", "tail-2"]);
        let mut sequences: Vec<u32> = trace.steps.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences[..2], [1, 0]);
        sequences.sort();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_explicit_sequence() {
        let (tracer, _sink) = tracer_with_sink();
        let run = tracer.start_run("explicit", "1.0.0", json!({}));

        let step = run.step_with_sequence("jump", StepType::Custom, 5).unwrap();
        assert_eq!(step.sequence(), 5);
        step.close(Outcome::Success).unwrap();

        assert!(matches!(
            run.step_with_sequence("again", StepType::Custom, 5),
            Err(XrayError::DuplicateSequence { sequence: 5, .. })
        ));

        let next = run.step("next", StepType::Custom).unwrap();
        assert_eq!(next.sequence(), 6);
        next.close(Outcome::Success).unwrap();
        run.close(Outcome::Success).unwrap();
    }

    #[test]
    fn test_sequence_space_exhausted() {
        let (tracer, sink) = tracer_with_sink();
        let run = tracer.start_run("exhausted", "1.0.0", json!({}));

        let last = run.step_with_sequence("last", StepType::Custom, u32::MAX).unwrap();
        last.close(Outcome::Success).unwrap();

        assert!(matches!(
            run.step("next", StepType::Custom),
            Err(XrayError::SequenceExhausted { run_id }) if run_id == run.id()
        ));

        // Lower numbers stay available explicitly
        let low = run.step_with_sequence("low", StepType::Custom, 0).unwrap();
        low.close(Outcome::Success).unwrap();
        run.close(Outcome::Success).unwrap();

        let trace = sink.drain().pop().unwrap();
        let sequences: Vec<u32> = trace.steps.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![u32::MAX, 0]);
    }

    #[test]
    fn test_drop_closes_run() {
        let (tracer, sink) = tracer_with_sink();
        {
            let _run = tracer.start_run("dropped", "1.0.0", json!({}));
        }
        let traces = sink.traces();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].run.status, RunStatus::Success);
        assert!(crate::current_run().is_none());
    }

    #[test]
    fn test_panic_marks_run_failed() {
        let (tracer, sink) = tracer_with_sink();
        let panicking = tracer.clone();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _run = panicking.start_run("explodes", "1.0.0", json!({}));
            panic!("pipeline bug");
        }));
        assert!(result.is_err());

        let trace = &sink.traces()[0];
        assert_eq!(trace.run.status, RunStatus::Failure);
        assert_eq!(trace.run.error.as_deref(), Some("panicked"));
    }

    #[test]
    fn test_null_metadata_becomes_object() {
        let (tracer, _sink) = tracer_with_sink();
        let run = tracer.start_run("meta", "1.0.0", serde_json::Value::Null);
        run.set_metadata("region", json!("eu")).unwrap();
        assert_eq!(run.run().metadata, json!({"region": "eu"}));
        run.close(Outcome::Success).unwrap();
    }

    #[tokio::test]
    async fn test_trace_run_async() {
        let (tracer, sink) = tracer_with_sink();

        let value = tracer
            .trace_run_async("async_pipeline", "1.0.0", json!({}), |run| async move {
                run.in_step_async("search", StepType::Search, |step| async move {
                    tokio::task::yield_now().await;
                    assert_eq!(crate::current_step().map(|s| s.id()), Some(step.id()));
                    step.set_candidates(120, 40, None)
                })
                .await?;
                Ok::<_, XrayError>(42)
            })
            .await
            .unwrap();
        assert_eq!(value, 42);

        let trace = &sink.traces()[0];
        assert_eq!(trace.run.status, RunStatus::Success);
        assert_eq!(trace.steps[0].candidates_in, Some(120));
    }
}
