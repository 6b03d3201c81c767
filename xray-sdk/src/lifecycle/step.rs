//! Step scope

use rand::Rng;
use serde_json::{Map, Value};
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;
use uuid::Uuid;
use xray_core::domain::now;
use xray_core::domain::step::{Step, StepType};

use super::Outcome;
use super::run::RunHandle;
use crate::context::{self, BindToken};
use crate::error::XrayError;

/// Shared reference to an open (or closed) step
#[derive(Clone)]
pub struct StepHandle {
    inner: Arc<StepShared>,
}

struct StepShared {
    id: Uuid,
    name: String,
    sequence: u32,
    run: RunHandle,
    state: Mutex<StepState>,
}

struct StepState {
    step: Step,
    closed: bool,
}

impl StepHandle {
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn sequence(&self) -> u32 {
        self.inner.sequence
    }

    pub fn run_id(&self) -> Uuid {
        self.inner.run.id()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Snapshot of the step record
    pub fn step(&self) -> Step {
        self.lock().step.clone()
    }

    pub fn set_inputs(&self, inputs: Value) -> Result<(), XrayError> {
        self.mutate(|step| step.inputs = inputs)
    }

    pub fn set_outputs(&self, outputs: Value) -> Result<(), XrayError> {
        self.mutate(|step| step.outputs = outputs)
    }

    pub fn set_reasoning(&self, reasoning: impl Into<String>) -> Result<(), XrayError> {
        let reasoning = reasoning.into();
        self.mutate(|step| step.reasoning = Some(reasoning))
    }

    pub fn set_filters_applied(&self, filters: Value) -> Result<(), XrayError> {
        self.mutate(|step| step.filters_applied = filters)
    }

    pub fn add_metadata(&self, key: impl Into<String>, value: Value) -> Result<(), XrayError> {
        let key = key.into();
        self.mutate(|step| {
            object_mut(&mut step.metadata).insert(key, value);
        })
    }

    /// Merges every entry of `entries` into the step metadata
    pub fn update_metadata(&self, entries: Map<String, Value>) -> Result<(), XrayError> {
        self.mutate(|step| object_mut(&mut step.metadata).extend(entries))
    }

    /// Records candidate counts and, optionally, the candidates themselves
    ///
    /// Counts are stored as given. `data` is reduced with the tracer's
    /// sampling settings before it is kept.
    pub fn set_candidates(
        &self,
        candidates_in: usize,
        candidates_out: usize,
        data: Option<Vec<Value>>,
    ) -> Result<(), XrayError> {
        self.set_candidates_with_rng(candidates_in, candidates_out, data, &mut rand::thread_rng())
    }

    /// [`StepHandle::set_candidates`] with a caller-supplied random source
    pub fn set_candidates_with_rng<R: Rng + ?Sized>(
        &self,
        candidates_in: usize,
        candidates_out: usize,
        data: Option<Vec<Value>>,
        rng: &mut R,
    ) -> Result<(), XrayError> {
        let sampling = &self.inner.run.tracer().config().sampling;
        let sample = data
            .filter(|data| !data.is_empty())
            .map(|data| sampling.apply(&data, rng));

        self.mutate(|step| {
            step.candidates_in = Some(count(candidates_in));
            step.candidates_out = Some(count(candidates_out));

            if let Some(sample) = sample {
                if sample.sampled {
                    let metadata = object_mut(&mut step.metadata);
                    metadata.insert("sampling_applied".to_string(), Value::Bool(true));
                    metadata.insert("original_data_count".to_string(), sample.total.into());
                    metadata.insert("sampled_data_count".to_string(), sample.items.len().into());
                    metadata.insert("sampling_strategy".to_string(), sampling.strategy.name().into());
                }
                step.candidates_data = Some(Value::Array(sample.items));
            }
        })
    }

    fn mutate(&self, f: impl FnOnce(&mut Step)) -> Result<(), XrayError> {
        let mut state = self.lock();
        if state.closed {
            return Err(XrayError::ScopeClosed {
                kind: "step",
                name: self.inner.name.clone(),
            });
        }
        f(&mut state.step);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, StepState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finalize(&self, outcome: &Outcome) -> Result<Step, XrayError> {
        let mut state = self.lock();
        if state.closed {
            return Err(XrayError::ScopeClosed {
                kind: "step",
                name: self.inner.name.clone(),
            });
        }

        state.closed = true;
        state.step.end_time = Some(now());
        if let Outcome::Failure(message) = outcome {
            state.step.error = Some(message.clone());
        }
        Ok(state.step.clone())
    }
}

impl fmt::Debug for StepHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("sequence", &self.inner.sequence)
            .finish()
    }
}

/// Owning scope of a step
///
/// Dereferences to its [`StepHandle`]. Closing (or dropping) the scope
/// appends the finished step to its run.
#[must_use = "a step is closed when its scope is dropped"]
pub struct StepScope {
    handle: StepHandle,
    token: Option<BindToken>,
}

impl StepScope {
    pub(super) fn open(run: RunHandle, name: String, step_type: StepType, sequence: u32) -> Self {
        let mut step = Step::new(run.id(), name.clone(), step_type, sequence);
        step.start_time = Some(now());
        debug!(run_id = %run.id(), step = %name, sequence, "Step opened");

        let handle = StepHandle {
            inner: Arc::new(StepShared {
                id: step.id,
                name,
                sequence,
                run,
                state: Mutex::new(StepState { step, closed: false }),
            }),
        };

        let token = context::bind_step(handle.clone());
        Self {
            handle,
            token: Some(token),
        }
    }

    pub fn handle(&self) -> StepHandle {
        self.handle.clone()
    }

    /// Closes the step and appends it to its run
    pub fn close(mut self, outcome: Outcome) -> Result<(), XrayError> {
        self.finish(&outcome)
    }

    fn finish(&mut self, outcome: &Outcome) -> Result<(), XrayError> {
        let finalized = self.handle.finalize(outcome);
        if let Some(token) = self.token.take() {
            context::unbind(token);
        }
        let step = finalized?;
        debug!(
            run_id = %self.handle.run_id(),
            step = %step.step_name,
            failed = step.error.is_some(),
            "Step closed"
        );
        self.handle.inner.run.attach(step);
        Ok(())
    }
}

impl Deref for StepScope {
    type Target = StepHandle;

    fn deref(&self) -> &StepHandle {
        &self.handle
    }
}

impl Drop for StepScope {
    fn drop(&mut self) {
        if self.token.is_none() {
            return;
        }
        let outcome = if std::thread::panicking() {
            Outcome::Failure("panicked".to_string())
        } else {
            Outcome::Success
        };
        let _ = self.finish(&outcome);
    }
}

/// The JSON object held by `value`, replacing any non-object value
pub(super) fn object_mut(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced by an object"),
    }
}

fn count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
