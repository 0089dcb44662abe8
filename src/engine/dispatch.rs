//! Dispatch loop: poll the queue, deliver each claimed record to the sink,
//! report the outcome.
//!
//! Lifecycle is `Stopped -> Running -> Stopping -> Stopped`. Stopping is
//! cooperative: the loop only looks at its state between batches, so a
//! batch that has been claimed is always delivered and reported in full.
//!
//! A record whose delivery never returns stays `Processing`. Bounding the
//! delivery call is the sink's job (see `WebhookSink`'s client timeout).

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use super::queue::Queue;
use crate::error::{Error, Result};
use crate::model::queue::QueueRecord;
use crate::sink::{DeliveryError, ErrorChannel, LogErrorChannel, Sink};
use crate::store::QueueStore;
use crate::telemetry::delivery::{record_result, record_state_transition, start_delivery_span};
use crate::telemetry::metrics;

/// Configuration for a dispatch loop.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Pause between poll cycles.
    pub poll_interval: Duration,
    /// Maximum records claimed per cycle.
    pub batch_size: usize,
    /// Pause after a cycle fails outside per-record delivery. Shorter than
    /// `poll_interval`.
    pub error_backoff: Duration,
    /// When set, each cycle first requeues failed records under this retry
    /// budget.
    pub retry_sweep: Option<u32>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            batch_size: 10,
            error_backoff: Duration::from_secs(2),
            retry_sweep: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Stopped,
    Running,
    Stopping,
}

/// What one poll cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Failed records moved back to `Pending` by the retry sweep.
    pub requeued: u64,
    pub claimed: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// One consumer draining the queue into a sink.
///
/// Any number of these may run against the same store, in one process or
/// many.
pub struct DispatchLoop<S> {
    inner: Arc<Inner<S>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Inner<S> {
    queue: Arc<Queue<S>>,
    sink: Arc<dyn Sink>,
    errors: Arc<dyn ErrorChannel>,
    config: DispatchConfig,
    consumer_id: String,
    state: watch::Sender<LoopState>,
}

impl<S: QueueStore + 'static> DispatchLoop<S> {
    /// Dispatch loop whose delivery failures are only logged.
    pub fn new(queue: Arc<Queue<S>>, sink: Arc<dyn Sink>, config: DispatchConfig) -> Self {
        Self::with_error_channel(queue, sink, Arc::new(LogErrorChannel), config)
    }

    /// Dispatch loop that also reports delivery failures to `errors`.
    pub fn with_error_channel(
        queue: Arc<Queue<S>>,
        sink: Arc<dyn Sink>,
        errors: Arc<dyn ErrorChannel>,
        config: DispatchConfig,
    ) -> Self {
        let (state, _) = watch::channel(LoopState::Stopped);
        Self {
            inner: Arc::new(Inner {
                queue,
                sink,
                errors,
                config,
                consumer_id: Uuid::new_v4().to_string(),
                state,
            }),
            task: Mutex::new(None),
        }
    }

    pub fn consumer_id(&self) -> &str {
        &self.inner.consumer_id
    }

    pub fn state(&self) -> LoopState {
        *self.inner.state.borrow()
    }

    /// Watch lifecycle changes.
    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.inner.state.subscribe()
    }

    /// Move to `Running` and launch the poll cycle on the runtime.
    pub async fn start(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        if self.state() != LoopState::Stopped {
            return Err(Error::AlreadyRunning);
        }

        self.inner.state.send_replace(LoopState::Running);
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(inner.run()));
        Ok(())
    }

    /// Move to `Stopping`, wait for the in-flight batch, then `Stopped`.
    pub async fn stop(&self) {
        let mut task = self.task.lock().await;
        if self.state() == LoopState::Running {
            info!(consumer_id = %self.inner.consumer_id, "dispatch loop stopping");
            self.inner.state.send_replace(LoopState::Stopping);
        }

        if let Some(handle) = task.take()
            && let Err(e) = handle.await
        {
            error!(consumer_id = %self.inner.consumer_id, "dispatch loop task failed: {e}");
        }

        self.inner.state.send_replace(LoopState::Stopped);
    }

    /// Run a single poll cycle in the caller's task.
    pub async fn dispatch_once(&self) -> Result<BatchReport> {
        self.inner.dispatch_once().await
    }
}

impl<S: QueueStore + 'static> Inner<S> {
    async fn run(self: Arc<Self>) {
        let _exit = StoppedOnExit(&self.state);
        let mut state = self.state.subscribe();
        info!(
            consumer_id = %self.consumer_id,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "dispatch loop started"
        );

        loop {
            if *state.borrow_and_update() != LoopState::Running {
                break;
            }

            let pause = match self.dispatch_once().await {
                Ok(report) => {
                    if report.claimed > 0 {
                        info!(
                            consumer_id = %self.consumer_id,
                            claimed = report.claimed,
                            delivered = report.delivered,
                            failed = report.failed,
                            "batch dispatched"
                        );
                    }
                    self.config.poll_interval
                }
                Err(e) => {
                    error!(consumer_id = %self.consumer_id, error = %e, "dispatch cycle failed, backing off");
                    metrics::loop_errors().add(1, &[]);
                    self.config.error_backoff
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = state.changed() => {}
            }
        }

        info!(consumer_id = %self.consumer_id, "dispatch loop stopped");
    }

    async fn dispatch_once(&self) -> Result<BatchReport> {
        let mut report = BatchReport::default();

        if let Some(max_retries) = self.config.retry_sweep {
            report.requeued = self.queue.retry_eligible(max_retries).await?;
        }

        let batch = self.queue.claim(self.config.batch_size).await?;
        report.claimed = batch.len();

        for record in batch {
            if self.deliver(&record).await {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }

        Ok(report)
    }

    /// Deliver one record and report the outcome. Never fails: every error,
    /// including a panic inside the sink, is contained to this record.
    async fn deliver(&self, record: &QueueRecord) -> bool {
        let span = start_delivery_span(&record.id, &record.payload.platform, &self.consumer_id);

        async {
            let started = Instant::now();
            let sink = Arc::clone(&self.sink);
            let payload = record.payload.clone();
            // Own task so a panicking sink only fails this record.
            let delivery = tokio::spawn(async move { sink.deliver(&payload).await }.in_current_span());
            let outcome = match delivery.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => {
                    Err(DeliveryError::Panicked(panic_message(e.into_panic())))
                }
                Err(e) => Err(DeliveryError::Other(format!("delivery task failed: {e}"))),
            };
            metrics::delivery_duration_ms().record(started.elapsed().as_secs_f64() * 1000.0, &[]);

            match outcome {
                Ok(()) => {
                    record_result(&span, "delivered");
                    metrics::deliveries().add(1, &[KeyValue::new("result", "delivered")]);
                    match self.queue.mark_completed(&record.id).await {
                        Ok(true) => record_state_transition(&span, "processing", "completed"),
                        Ok(false) => {}
                        Err(e) => error!(
                            record_id = %record.id,
                            error = %e,
                            "delivered but could not mark completed"
                        ),
                    }
                    debug!(record_id = %record.id, "delivered");
                    true
                }
                Err(delivery_error) => {
                    record_result(&span, "failed");
                    metrics::deliveries().add(1, &[KeyValue::new("result", "failed")]);
                    warn!(record_id = %record.id, error = %delivery_error, "delivery failed");

                    match self
                        .queue
                        .mark_failed(&record.id, &delivery_error.to_string())
                        .await
                    {
                        Ok(true) => record_state_transition(&span, "processing", "failed"),
                        Ok(false) => {}
                        Err(e) => error!(
                            record_id = %record.id,
                            error = %e,
                            "could not mark record failed"
                        ),
                    }

                    if let Err(e) = self.errors.report(record, &delivery_error).await {
                        warn!(record_id = %record.id, error = %e, "could not notify error channel");
                    }
                    false
                }
            }
        }
        .instrument(span.clone())
        .await
    }
}

/// Leaves the lifecycle at `Stopped` if the run task ends while still
/// `Running`, including by unwinding.
struct StoppedOnExit<'a>(&'a watch::Sender<LoopState>);

impl Drop for StoppedOnExit<'_> {
    fn drop(&mut self) {
        self.0.send_if_modified(|state| {
            if *state == LoopState::Running {
                *state = LoopState::Stopped;
                true
            } else {
                false
            }
        });
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
