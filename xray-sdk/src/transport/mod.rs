//! Trace delivery
//!
//! Ships finished traces to a [`TraceSink`] with a per-attempt timeout and
//! exponential backoff between attempts. Once the attempts are spent the
//! configured [`FallbackMode`] decides what happens to the trace.
//!
//! Delivery runs either on a background worker (`async_mode`, the default),
//! so closing a run never waits on the network, or on a helper thread that
//! the caller blocks on, bounded by the retry budget.

mod fallback;
mod sink;

pub use sink::{HttpSink, InMemorySink, TraceSink};

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tokio::runtime::{self, Handle, Runtime};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use xray_core::dto::ingest::IngestPayload;

use crate::config::{FallbackMode, XrayConfig};
use crate::error::{DeliveryError, TransportError};

/// Final fate of one trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Tracing is turned off; nothing was sent
    Disabled,
    /// The sink acknowledged the trace
    Delivered,
    /// Delivery failed and the trace was dropped (`silent` fallback)
    Discarded,
    /// Delivery failed and the trace was appended to this file (`log` fallback)
    Logged(PathBuf),
}

/// What [`Transport::dispatch`] did with a trace
#[derive(Debug)]
pub enum DispatchStatus {
    /// Delivery finished before dispatch returned
    Completed(DeliveryOutcome),
    /// Delivery continues on a background worker
    Scheduled(BackgroundDelivery),
}

impl DispatchStatus {
    pub fn is_scheduled(&self) -> bool {
        matches!(self, DispatchStatus::Scheduled(_))
    }

    /// Waits for the delivery to settle, if it has not already
    pub async fn wait(self) -> Result<DeliveryOutcome, TransportError> {
        match self {
            DispatchStatus::Completed(outcome) => Ok(outcome),
            DispatchStatus::Scheduled(delivery) => delivery.wait().await,
        }
    }
}

/// Handle on a delivery running in the background
///
/// Dropping it does not cancel the delivery.
pub struct BackgroundDelivery {
    run_id: Uuid,
    receiver: oneshot::Receiver<Result<DeliveryOutcome, TransportError>>,
}

impl BackgroundDelivery {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Waits for the background delivery to settle
    pub async fn wait(self) -> Result<DeliveryOutcome, TransportError> {
        self.receiver.await.unwrap_or_else(|_| Err(worker_lost()))
    }

    /// Blocking variant of [`BackgroundDelivery::wait`]
    ///
    /// Must not be called from within an async execution context.
    pub fn wait_blocking(self) -> Result<DeliveryOutcome, TransportError> {
        self.receiver.blocking_recv().unwrap_or_else(|_| Err(worker_lost()))
    }
}

impl fmt::Debug for BackgroundDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundDelivery")
            .field("run_id", &self.run_id)
            .finish()
    }
}

fn worker_lost() -> TransportError {
    TransportError {
        attempts: 0,
        last: DeliveryError::WorkerLost("delivery task ended without reporting".to_string()),
    }
}

/// Delivery pipeline shared by every run of a tracer
#[derive(Clone)]
pub struct Transport {
    config: Arc<XrayConfig>,
    sink: Arc<dyn TraceSink>,
}

impl Transport {
    pub fn new(config: Arc<XrayConfig>, sink: Arc<dyn TraceSink>) -> Self {
        Self { config, sink }
    }

    /// Delivers `payload`, retrying and then applying the fallback policy
    ///
    /// Returns an error only under [`FallbackMode::Raise`].
    pub async fn send(&self, payload: &IngestPayload) -> Result<DeliveryOutcome, TransportError> {
        if !self.config.enabled {
            return Ok(DeliveryOutcome::Disabled);
        }

        let run_id = payload.run.id;
        let max_attempts = self.config.attempts();
        let mut attempts = 0;

        let last = loop {
            let result = tokio::time::timeout(self.config.timeout, self.sink.deliver(payload)).await;
            attempts += 1;

            let err = match result {
                Ok(Ok(())) => {
                    debug!(%run_id, attempts, "Trace delivered");
                    return Ok(DeliveryOutcome::Delivered);
                }
                Ok(Err(e)) => e,
                Err(_) => DeliveryError::Timeout(self.config.timeout),
            };

            warn!(
                %run_id,
                attempt = attempts,
                max_attempts,
                error = %err,
                "Trace delivery attempt failed"
            );

            if !err.is_retryable() || attempts >= max_attempts {
                break err;
            }
            tokio::time::sleep(self.config.backoff_for(attempts - 1)).await;
        };

        self.resolve(payload, TransportError { attempts, last })
    }

    /// Hands `payload` off according to the delivery mode
    ///
    /// In `async_mode` this returns immediately with
    /// [`DispatchStatus::Scheduled`]. Otherwise it blocks until delivery
    /// settles; it is safe to call from inside or outside a tokio runtime.
    pub fn dispatch(&self, payload: IngestPayload) -> Result<DispatchStatus, TransportError> {
        if !self.config.enabled {
            debug!(run_id = %payload.run.id, "Tracing disabled; trace not sent");
            return Ok(DispatchStatus::Completed(DeliveryOutcome::Disabled));
        }
        if self.config.async_mode {
            return Ok(DispatchStatus::Scheduled(self.schedule(payload)));
        }
        self.send_blocking(payload).map(DispatchStatus::Completed)
    }

    /// Like [`Transport::dispatch`], but synchronous delivery is awaited
    /// on the current task instead of blocking a thread
    pub async fn dispatch_async(&self, payload: IngestPayload) -> Result<DispatchStatus, TransportError> {
        if !self.config.enabled {
            debug!(run_id = %payload.run.id, "Tracing disabled; trace not sent");
            return Ok(DispatchStatus::Completed(DeliveryOutcome::Disabled));
        }
        if self.config.async_mode {
            return Ok(DispatchStatus::Scheduled(self.schedule(payload)));
        }
        self.send(&payload).await.map(DispatchStatus::Completed)
    }

    /// Applies the fallback policy to a trace that could not be delivered
    fn resolve(&self, payload: &IngestPayload, failure: TransportError) -> Result<DeliveryOutcome, TransportError> {
        let run_id = payload.run.id;
        match self.config.fallback_mode {
            FallbackMode::Silent => {
                debug!(%run_id, error = %failure, "Trace discarded");
                Ok(DeliveryOutcome::Discarded)
            }
            FallbackMode::Log => {
                let path = &self.config.log_file_path;
                match fallback::append(path, payload) {
                    Ok(()) => {
                        info!(%run_id, path = %path.display(), "Trace written to fallback log");
                        Ok(DeliveryOutcome::Logged(path.clone()))
                    }
                    Err(e) => {
                        error!(%run_id, path = %path.display(), error = %e, "Failed to write fallback log; trace discarded");
                        Ok(DeliveryOutcome::Discarded)
                    }
                }
            }
            FallbackMode::Raise => Err(failure),
        }
    }

    /// Starts delivery on the ambient runtime, or on a dedicated thread
    fn schedule(&self, payload: IngestPayload) -> BackgroundDelivery {
        let run_id = payload.run.id;
        let (sender, receiver) = oneshot::channel();
        let transport = self.clone();

        let job = async move {
            let result = transport.send(&payload).await;
            if let Err(e) = &result {
                error!(%run_id, error = %e, "Background trace delivery failed");
            }
            let _ = sender.send(result);
        };

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(job);
            }
            Err(_) => {
                let spawned = thread::Builder::new()
                    .name("xray-delivery".to_string())
                    .spawn(move || match delivery_runtime() {
                        Ok(runtime) => runtime.block_on(job),
                        Err(e) => error!(%run_id, error = %e, "Failed to start delivery runtime"),
                    });
                if let Err(e) = spawned {
                    error!(%run_id, error = %e, "Failed to spawn delivery thread");
                }
            }
        }

        debug!(%run_id, "Trace scheduled for background delivery");
        BackgroundDelivery { run_id, receiver }
    }

    /// Delivers on a helper thread and waits for it
    fn send_blocking(&self, payload: IngestPayload) -> Result<DeliveryOutcome, TransportError> {
        let transport = self.clone();
        let worker = thread::Builder::new()
            .name("xray-delivery".to_string())
            .spawn(move || match delivery_runtime() {
                Ok(runtime) => runtime.block_on(transport.send(&payload)),
                Err(e) => transport.resolve(
                    &payload,
                    TransportError {
                        attempts: 0,
                        last: DeliveryError::WorkerLost(format!("failed to start delivery runtime: {}", e)),
                    },
                ),
            });

        match worker {
            Ok(handle) => handle.join().unwrap_or_else(|_| Err(worker_lost())),
            Err(e) => Err(TransportError {
                attempts: 0,
                last: DeliveryError::WorkerLost(format!("failed to spawn delivery thread: {}", e)),
            }),
        }
    }
}

fn delivery_runtime() -> std::io::Result<Runtime> {
    runtime::Builder::new_current_thread().enable_all().build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};
    use xray_core::domain::run::Run;

    /// Fails every attempt with a fixed error and counts the attempts
    struct FailingSink {
        calls: AtomicU32,
        error: DeliveryError,
    }

    impl FailingSink {
        fn new(error: DeliveryError) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                error,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TraceSink for FailingSink {
        async fn deliver(&self, _payload: &IngestPayload) -> Result<(), DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(self.error.clone())
        }
    }

    /// Succeeds once the given number of attempts has failed
    struct FlakySink {
        failures_left: AtomicU32,
        inner: InMemorySink,
    }

    #[async_trait]
    impl TraceSink for FlakySink {
        async fn deliver(&self, payload: &IngestPayload) -> Result<(), DeliveryError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(DeliveryError::Unreachable("connection refused".to_string()));
            }
            self.inner.deliver(payload).await
        }
    }

    struct SlowSink;

    #[async_trait]
    impl TraceSink for SlowSink {
        async fn deliver(&self, _payload: &IngestPayload) -> Result<(), DeliveryError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    fn payload() -> IngestPayload {
        IngestPayload::new(Run::start("transport", "1.0.0", json!({})), vec![])
    }

    fn sync_config(fallback: FallbackMode) -> XrayConfig {
        XrayConfig::default()
            .with_async_mode(false)
            .with_retries(3, Duration::from_millis(5))
            .with_fallback(fallback)
    }

    fn unreachable() -> DeliveryError {
        DeliveryError::Unreachable("connection refused".to_string())
    }

    #[tokio::test]
    async fn test_send_retries_then_raises() {
        let sink = FailingSink::new(unreachable());
        let transport = Transport::new(Arc::new(sync_config(FallbackMode::Raise)), sink.clone());

        let err = transport.send(&payload()).await.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.last, unreachable());
        assert_eq!(sink.calls(), 3);
    }

    #[tokio::test]
    async fn test_send_recovers_after_transient_failures() {
        let delivered = InMemorySink::new();
        let sink = Arc::new(FlakySink {
            failures_left: AtomicU32::new(2),
            inner: delivered.clone(),
        });
        let transport = Transport::new(Arc::new(sync_config(FallbackMode::Raise)), sink);

        let outcome = transport.send(&payload()).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered);
        assert_eq!(delivered.traces().len(), 1);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let sink = FailingSink::new(DeliveryError::Rejected {
            status: 400,
            message: "invalid run".to_string(),
        });
        let transport = Transport::new(Arc::new(sync_config(FallbackMode::Raise)), sink.clone());

        let err = transport.send(&payload()).await.unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(sink.calls(), 1);
    }

    #[tokio::test]
    async fn test_silent_fallback_discards() {
        let sink = FailingSink::new(unreachable());
        let transport = Transport::new(Arc::new(sync_config(FallbackMode::Silent)), sink);

        let outcome = transport.send(&payload()).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Discarded);
    }

    #[tokio::test]
    async fn test_log_fallback_appends_trace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".xray/failed_traces.jsonl");
        let config = sync_config(FallbackMode::Log).with_log_file_path(&path);
        let transport = Transport::new(Arc::new(config), FailingSink::new(unreachable()));

        let trace = payload();
        let outcome = transport.send(&trace).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Logged(path.clone()));

        let content = std::fs::read_to_string(&path).unwrap();
        let logged: IngestPayload = serde_json::from_str(content.trim_end()).unwrap();
        assert_eq!(logged, trace);
    }

    /// Records the level and message of every event
    #[derive(Clone, Default)]
    struct CapturedEvents(Arc<std::sync::Mutex<Vec<(tracing::Level, String)>>>);

    impl CapturedEvents {
        fn at(&self, level: tracing::Level) -> Vec<String> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter(|(l, _)| *l == level)
                .map(|(_, message)| message.clone())
                .collect()
        }
    }

    struct MessageVisitor(String);

    impl tracing::field::Visit for MessageVisitor {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
            if field.name() == "message" {
                self.0 = format!("{:?}", value);
            }
        }
    }

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for CapturedEvents {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
            let mut visitor = MessageVisitor(String::new());
            event.record(&mut visitor);
            self.0
                .lock()
                .unwrap()
                .push((*event.metadata().level(), visitor.0));
        }
    }

    #[tokio::test]
    async fn test_failed_attempts_and_fallback_are_logged() {
        use tracing_subscriber::layer::SubscriberExt;

        let events = CapturedEvents::default();
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(events.clone()));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed_traces.jsonl");
        let config = sync_config(FallbackMode::Log).with_log_file_path(&path);
        let transport = Transport::new(Arc::new(config), FailingSink::new(unreachable()));

        let outcome = transport.send(&payload()).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Logged(path));

        let warnings = events.at(tracing::Level::WARN);
        assert_eq!(warnings.len(), 3);
        assert!(warnings.iter().all(|m| m == "Trace delivery attempt failed"));
        assert_eq!(
            events.at(tracing::Level::INFO),
            vec!["Trace written to fallback log".to_string()]
        );
    }

    #[tokio::test]
    async fn test_attempt_timeout() {
        let config = sync_config(FallbackMode::Raise)
            .with_timeout(Duration::from_millis(100))
            .with_retries(2, Duration::from_millis(10));
        let transport = Transport::new(Arc::new(config), Arc::new(SlowSink));

        let err = transport.send(&payload()).await.unwrap_err();
        assert_eq!(err.attempts, 2);
        assert_eq!(err.last, DeliveryError::Timeout(Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn test_disabled_is_a_no_op() {
        let sink = FailingSink::new(unreachable());
        let config = sync_config(FallbackMode::Raise).with_enabled(false);
        let transport = Transport::new(Arc::new(config), sink.clone());

        let status = transport.dispatch(payload()).unwrap();
        assert!(matches!(status, DispatchStatus::Completed(DeliveryOutcome::Disabled)));
        assert_eq!(sink.calls(), 0);
    }

    #[test]
    fn test_sync_dispatch_outside_runtime_raises() {
        let sink = FailingSink::new(unreachable());
        let transport = Transport::new(Arc::new(sync_config(FallbackMode::Raise)), sink.clone());

        let err = transport.dispatch(payload()).unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(sink.calls(), 3);
    }

    #[test]
    fn test_sync_dispatch_to_unreachable_endpoint() {
        let config = XrayConfig::new("http://127.0.0.1:9")
            .with_async_mode(false)
            .with_timeout(Duration::from_secs(2))
            .with_retries(2, Duration::from_millis(10))
            .with_fallback(FallbackMode::Raise);
        let sink = HttpSink::new(&config).unwrap();
        let transport = Transport::new(Arc::new(config), Arc::new(sink));

        let err = transport.dispatch(payload()).unwrap_err();
        assert_eq!(err.attempts, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sync_dispatch_inside_runtime() {
        let delivered = InMemorySink::new();
        let config = sync_config(FallbackMode::Raise);
        let transport = Transport::new(Arc::new(config), Arc::new(delivered.clone()));

        let status = transport.dispatch(payload()).unwrap();
        assert!(matches!(status, DispatchStatus::Completed(DeliveryOutcome::Delivered)));
        assert_eq!(delivered.traces().len(), 1);
    }

    #[tokio::test]
    async fn test_async_dispatch_returns_before_delivery() {
        let config = XrayConfig::default()
            .with_timeout(Duration::from_secs(5))
            .with_fallback(FallbackMode::Raise);
        let transport = Transport::new(Arc::new(config), Arc::new(SlowSink));

        let started = Instant::now();
        let status = transport.dispatch(payload()).unwrap();
        assert!(status.is_scheduled());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_background_failure_surfaces_on_wait() {
        let sink = FailingSink::new(unreachable());
        let config = sync_config(FallbackMode::Raise).with_async_mode(true);
        let transport = Transport::new(Arc::new(config), sink.clone());

        let status = transport.dispatch(payload()).unwrap();
        let err = status.wait().await.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(sink.calls(), 3);
    }

    #[test]
    fn test_background_delivery_without_runtime() {
        let delivered = InMemorySink::new();
        let config = XrayConfig::default().with_fallback(FallbackMode::Raise);
        let transport = Transport::new(Arc::new(config), Arc::new(delivered.clone()));

        match transport.dispatch(payload()).unwrap() {
            DispatchStatus::Scheduled(delivery) => {
                assert_eq!(delivery.wait_blocking().unwrap(), DeliveryOutcome::Delivered);
            }
            other => panic!("expected scheduled delivery, got {:?}", other),
        }
        assert_eq!(delivered.traces().len(), 1);
    }
}
