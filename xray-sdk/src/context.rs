//! Current run / step propagation
//!
//! Every execution path has a frame holding the run and step that are
//! currently open on it. Synchronous code gets one frame per OS thread and
//! every spawned tokio task gets one frame per task id, so tasks sharing a
//! worker thread never see each other's run. [`scope`] gives any future its
//! own frame, and [`propagate`] carries the caller's frame into a spawned
//! task.
//!
//! Only the lifecycle types bind and unbind; application code reads the
//! frame through [`current_run`] and [`current_step`].

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{LazyLock, Mutex, PoisonError};
use std::thread::{self, ThreadId};
use tokio::runtime::Handle;
use tokio::task;
use tracing::warn;

use crate::lifecycle::{RunHandle, StepHandle};

#[derive(Clone, Default)]
struct Frame {
    run: Option<RunHandle>,
    step: Option<StepHandle>,
}

impl Frame {
    fn is_empty(&self) -> bool {
        self.run.is_none() && self.step.is_none()
    }
}

struct TaskFrame {
    id: u64,
    frame: RefCell<Frame>,
}

impl TaskFrame {
    fn new(frame: Frame) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            frame: RefCell::new(frame),
        }
    }
}

tokio::task_local! {
    static TASK_FRAME: TaskFrame;
}

thread_local! {
    static THREAD_FRAME: RefCell<Frame> = RefCell::new(Frame::default());
    static SHARED_FRAME_WARNED: Cell<bool> = const { Cell::new(false) };
}

/// Frames of spawned tasks running outside [`scope`], dropped once empty
static SPAWNED_FRAMES: LazyLock<Mutex<HashMap<task::Id, Frame>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Which frame a binding was made in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Thread(ThreadId),
    Task(u64),
    Spawned(task::Id),
}

/// Restores the frame that was current before a bind
///
/// Must be handed back to [`unbind`] on the same execution path.
#[must_use]
pub(crate) struct BindToken {
    origin: Origin,
    previous: Frame,
}

fn in_task_frame() -> bool {
    TASK_FRAME.try_with(|_| ()).is_ok()
}

fn with_frame<R>(f: impl FnOnce(Origin, &mut Frame) -> R) -> R {
    if in_task_frame() {
        return TASK_FRAME.with(|task| f(Origin::Task(task.id), &mut task.frame.borrow_mut()));
    }
    if let Some(id) = task::try_id() {
        let mut frames = SPAWNED_FRAMES.lock().unwrap_or_else(PoisonError::into_inner);
        let frame = frames.entry(id).or_default();
        let result = f(Origin::Spawned(id), frame);
        if frame.is_empty() {
            frames.remove(&id);
        }
        return result;
    }
    THREAD_FRAME.with(|frame| f(Origin::Thread(thread::current().id()), &mut frame.borrow_mut()))
}

// A future driven by `block_on` has no task id, so every future it joins
// shares the thread frame.
fn warn_if_frame_shared() {
    if in_task_frame() || task::try_id().is_some() || Handle::try_current().is_err() {
        return;
    }
    if !SHARED_FRAME_WARNED.replace(true) {
        warn!(
            "Run opened by a future running directly on a runtime's block_on thread; \
             futures joined there share one context. Wrap each in xray_sdk::context::scope"
        );
    }
}

/// Makes `run` current, with no current step
pub(crate) fn bind_run(run: RunHandle) -> BindToken {
    warn_if_frame_shared();
    with_frame(|origin, frame| {
        let previous = std::mem::replace(
            frame,
            Frame {
                run: Some(run),
                step: None,
            },
        );
        BindToken { origin, previous }
    })
}

/// Makes `step` current inside the current run
pub(crate) fn bind_step(step: StepHandle) -> BindToken {
    with_frame(|origin, frame| {
        let previous = frame.clone();
        frame.step = Some(step);
        BindToken { origin, previous }
    })
}

/// Restores the frame captured by `token`
///
/// A token presented on a different thread or task than the one it was
/// created on is ignored, leaving that path's frame untouched.
pub(crate) fn unbind(token: BindToken) {
    let BindToken { origin: opened_on, previous } = token;
    let closed_on = with_frame(|origin, frame| {
        if origin == opened_on {
            *frame = previous;
        }
        origin
    });

    if closed_on != opened_on {
        warn!(
            opened_on = %describe(opened_on),
            closed_on = %describe(closed_on),
            "Scope closed on a different execution path than it was opened on; context left unchanged"
        );
    }
}

fn describe(origin: Origin) -> String {
    match origin {
        Origin::Thread(id) => format!("{:?}", id),
        Origin::Task(id) => format!("task frame {}", id),
        Origin::Spawned(id) => format!("task {}", id),
    }
}

/// Run currently open on this thread or task
pub fn current_run() -> Option<RunHandle> {
    with_frame(|_, frame| frame.run.clone()).filter(|run| !run.is_closed())
}

/// Step currently open on this thread or task
pub fn current_step() -> Option<StepHandle> {
    with_frame(|_, frame| frame.step.clone()).filter(|step| !step.is_closed())
}

/// Runs `fut` with its own, initially empty, propagation frame
///
/// Runs and steps opened inside stay current for that future only, across
/// every `.await`, and never leak into other tasks.
pub fn scope<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    TASK_FRAME.scope(TaskFrame::new(Frame::default()), fut)
}

/// Runs `fut` in a new frame seeded with the caller's current run and step
///
/// Call it where the work is created, e.g. `tokio::spawn(propagate(work))`,
/// so steps opened by the spawned task attach to the caller's run.
pub fn propagate<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    let seeded = with_frame(|_, frame| frame.clone());
    TASK_FRAME.scope(TaskFrame::new(seeded), fut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::XrayConfig;
    use crate::lifecycle::{Outcome, Tracer};
    use crate::transport::InMemorySink;
    use serde_json::json;
    use std::sync::Arc;
    use xray_core::domain::step::StepType;

    fn tracer() -> Tracer {
        let config = XrayConfig::default().with_async_mode(false);
        Tracer::with_sink(config, Arc::new(InMemorySink::new())).unwrap()
    }

    #[test]
    fn test_nothing_bound_by_default() {
        assert!(current_run().is_none());
        assert!(current_step().is_none());
    }

    #[test]
    fn test_nested_binding_restores_in_order() {
        let tracer = tracer();
        let run = tracer.start_run("nesting", "1.0.0", json!({}));
        assert_eq!(current_run().unwrap().id(), run.id());

        let outer = run.step("outer", StepType::Custom).unwrap();
        assert_eq!(current_step().unwrap().id(), outer.id());

        let inner = run.step("inner", StepType::Custom).unwrap();
        assert_eq!(current_step().unwrap().id(), inner.id());

        inner.close(Outcome::Success).unwrap();
        assert_eq!(current_step().unwrap().id(), outer.id());

        outer.close(Outcome::Success).unwrap();
        assert!(current_step().is_none());
        assert_eq!(current_run().unwrap().id(), run.id());

        run.close(Outcome::Success).unwrap();
        assert!(current_run().is_none());
    }

    #[test]
    fn test_threads_do_not_share_frames() {
        let tracer = tracer();
        let run = tracer.start_run("main-thread", "1.0.0", json!({}));
        let step = run.step("main-step", StepType::Filter).unwrap();
        assert_eq!(current_step().unwrap().id(), step.id());

        let (seen_run, seen_step) = std::thread::spawn(|| {
            (current_run().map(|r| r.id()), current_step().map(|s| s.id()))
        })
        .join()
        .unwrap();
        assert!(seen_run.is_none());
        assert!(seen_step.is_none());

        step.close(Outcome::Success).unwrap();
        run.close(Outcome::Success).unwrap();
    }

    #[tokio::test]
    async fn test_spawned_tasks_without_scope_are_isolated() {
        use tokio::sync::oneshot;

        let tracer = tracer();
        let (a_opened_tx, a_opened_rx) = oneshot::channel::<()>();
        let (b_opened_tx, b_opened_rx) = oneshot::channel::<()>();
        let (a_closed_tx, a_closed_rx) = oneshot::channel::<()>();

        let tracer_a = tracer.clone();
        let task_a = tokio::spawn(async move {
            let run = tracer_a.start_run("A", "1.0.0", json!({}));
            let step = run.step("a-step", StepType::Filter).unwrap();
            a_opened_tx.send(()).unwrap();

            b_opened_rx.await.unwrap();
            assert_eq!(current_run().unwrap().pipeline_name(), "A");
            assert_eq!(current_step().unwrap().id(), step.id());

            step.close(Outcome::Success).unwrap();
            run.close_async(Outcome::Success).await.unwrap();
            assert!(current_run().is_none());
            a_closed_tx.send(()).unwrap();
        });

        let tracer_b = tracer.clone();
        let task_b = tokio::spawn(async move {
            a_opened_rx.await.unwrap();
            assert!(current_run().is_none());
            assert!(current_step().is_none());

            let run = tracer_b.start_run("B", "1.0.0", json!({}));
            b_opened_tx.send(()).unwrap();

            a_closed_rx.await.unwrap();
            assert_eq!(current_run().unwrap().pipeline_name(), "B");
            let step = crate::lifecycle::step("b-step", StepType::Rank).unwrap();
            assert_eq!(step.run_id(), run.id());
            step.close(Outcome::Success).unwrap();

            let trace = run.close_async(Outcome::Success).await.unwrap();
            assert!(!trace.is_scheduled());
        });

        task_a.await.unwrap();
        task_b.await.unwrap();
        // Not part of either task's frame
        assert!(current_run().is_none());
    }

    #[test]
    fn test_unbind_on_foreign_thread_is_ignored() {
        let tracer = tracer();
        let run = tracer.start_run("foreign", "1.0.0", json!({}));
        let run_id = run.id();

        let token = bind_run(run.handle());
        std::thread::spawn(move || unbind(token)).join().unwrap();

        // Our frame still holds the second binding.
        assert_eq!(current_run().unwrap().id(), run_id);
        run.close(Outcome::Success).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_tasks_are_isolated() {
        let tracer = tracer();
        let mut tasks = Vec::new();

        for i in 0..8 {
            let tracer = tracer.clone();
            tasks.push(tokio::spawn(scope(async move {
                let run = tracer.start_run(format!("pipeline-{}", i), "1.0.0", json!({}));
                let mine = run.id();
                for _ in 0..5 {
                    tokio::task::yield_now().await;
                    assert_eq!(current_run().unwrap().id(), mine);
                }
                run.close_async(Outcome::Success).await.unwrap();
                assert!(current_run().is_none());
                mine
            })));
        }

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 8);
    }

    #[tokio::test]
    async fn test_propagate_seeds_spawned_task() {
        let tracer = tracer();
        scope(async {
            let run = tracer.start_run("parent", "1.0.0", json!({}));
            let parent = run.id();

            let child = tokio::spawn(propagate(async { current_run().map(|r| r.id()) }))
                .await
                .unwrap();
            assert_eq!(child, Some(parent));

            let unrelated = tokio::spawn(scope(async { current_run().map(|r| r.id()) }))
                .await
                .unwrap();
            assert!(unrelated.is_none());

            run.close_async(Outcome::Success).await.unwrap();
        })
        .await;
    }
}
