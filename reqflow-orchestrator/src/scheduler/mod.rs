//! Concurrency-capped priority scheduler.
//!
//! # Architecture
//!
//! ```text
//! enqueue(action, priority) ──► Ticket (await for the result)
//!              │
//!     ┌────────▼────────┐
//!     │  TieredQueue    │ ← critical > high > normal > low, FIFO per tier
//!     │  (backpressure) │   full: low/normal rejected, critical/high evict
//!     └────────┬────────┘
//!              │ tick(): while active < max_concurrent
//!     ┌────────▼────────┐
//!     │ spawned attempt │ ── failure with retries left ──► backoff,
//!     └────────┬────────┘    back to the front of its tier
//!              ▼
//!        resolve / reject
//! ```
//!
//! Dispatch is driven by [`QueueManager::tick`], called on an interval by
//! the [`Ticker`](crate::ticker::Ticker). Dropping a [`Ticket`] abandons the
//! request: it is discarded when it reaches the head of its tier. Attempts
//! already running finish and their result is dropped.

mod config;
mod metrics;
mod queue;

pub use config::{PriorityWeights, SchedulerConfig};
pub use metrics::SchedulerMetrics;
pub use queue::Priority;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use reqflow_core::{ReqflowError, Result};

use crate::guard::catch_panic;
use crate::metrics::prometheus;
use crate::ticker::Tick;
use queue::{Admission, TieredQueue};

type SharedAction<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

enum Attempt {
    /// Succeeded; calling the closure hands the value to the caller
    Done(Box<dyn FnOnce() + Send>),
    Failed(ReqflowError, Box<dyn Task>),
}

/// A queued action with its reply channel, erased over the result type
trait Task: Send {
    fn is_abandoned(&self) -> bool;

    fn attempt(self: Box<Self>) -> BoxFuture<'static, Attempt>;

    fn reject(self: Box<Self>, error: ReqflowError);
}

struct Pending<T> {
    action: SharedAction<T>,
    reply: oneshot::Sender<Result<T>>,
}

impl<T: Send + 'static> Task for Pending<T> {
    fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }

    fn attempt(self: Box<Self>) -> BoxFuture<'static, Attempt> {
        let this = *self;
        async move {
            let result = catch_panic(async { (this.action)().await }).await;
            match result {
                Ok(value) => {
                    let reply = this.reply;
                    Attempt::Done(Box::new(move || {
                        let _ = reply.send(Ok(value));
                    }))
                }
                Err(error) => Attempt::Failed(error, Box::new(this)),
            }
        }
        .boxed()
    }

    fn reject(self: Box<Self>, error: ReqflowError) {
        let _ = self.reply.send(Err(error));
    }
}

/// A request waiting in, or running from, the queue
struct QueuedRequest {
    id: Uuid,
    priority: Priority,
    enqueued_at: Instant,
    retries: u32,
    max_retries: u32,
    task: Box<dyn Task>,
}

/// Handle to an enqueued request. Resolves with the action's result.
pub struct Ticket<T> {
    id: Uuid,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Ticket<T> {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl<T> Future for Ticket<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.rx
            .poll_unpin(cx)
            .map(|received| received.unwrap_or(Err(ReqflowError::Cancelled)))
    }
}

/// Queued count per tier
#[derive(Debug, Clone, Default, Serialize)]
pub struct TierCounts {
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

/// Snapshot of scheduler statistics
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub processed: u64,
    pub failed: u64,
    pub dropped: u64,
    pub rejected: u64,
    pub retries: u64,
    pub cancelled: u64,
    pub immediate: u64,
    pub avg_wait_ms: f64,
    pub queued: TierCounts,
    pub total_queued: usize,
    pub active: usize,
}

struct SchedulerState {
    queue: TieredQueue<QueuedRequest>,
    active: usize,
}

struct SchedulerInner {
    state: Mutex<SchedulerState>,
    config: SchedulerConfig,
    metrics: SchedulerMetrics,
}

impl SchedulerInner {
    async fn run(self: Arc<Self>, request: QueuedRequest) {
        let QueuedRequest {
            id,
            priority,
            enqueued_at,
            retries,
            max_retries,
            task,
        } = request;

        let outcome = task.attempt().await;
        {
            let mut state = self.state.lock();
            state.active = state.active.saturating_sub(1);
            prometheus::set_active_requests(state.active as u64);
        }

        match outcome {
            Attempt::Done(deliver) => {
                self.metrics.record_processed();
                tracing::debug!(%id, %priority, "Request resolved");
                deliver();
            }
            Attempt::Failed(error, task) if retries < max_retries => {
                let retries = retries + 1;
                let delay = self.config.retry_delay * retries;
                self.metrics.record_retry();
                tracing::debug!(
                    %id,
                    %priority,
                    retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Request failed, retrying"
                );

                tokio::time::sleep(delay).await;
                self.state.lock().queue.push_front(
                    priority,
                    QueuedRequest {
                        id,
                        priority,
                        enqueued_at,
                        retries,
                        max_retries,
                        task,
                    },
                );
            }
            Attempt::Failed(error, task) => {
                self.metrics.record_failed();
                tracing::warn!(%id, %priority, attempts = retries + 1, error = %error, "Request failed");
                task.reject(ReqflowError::RetriesExhausted {
                    attempts: retries + 1,
                    last_error: error.to_string(),
                });
            }
        }
    }
}

/// Priority queue that runs at most `max_concurrent` actions at a time
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<SchedulerInner>,
}

impl QueueManager {
    pub fn new(config: SchedulerConfig) -> Self {
        let queue = TieredQueue::new(config.priority_weights.order(), config.max_queue_size);
        Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(SchedulerState { queue, active: 0 }),
                config,
                metrics: SchedulerMetrics::new(),
            }),
        }
    }

    /// Queue an action. It is retried on failure up to `max_retries` times
    /// (the configured default when `None`).
    ///
    /// The request is queued (or refused) before this returns; awaiting the
    /// ticket yields the action's result, `QueueFull`, `Dropped` or
    /// `RetriesExhausted`.
    pub fn enqueue<T, F, Fut>(&self, action: F, priority: Priority, max_retries: Option<u32>) -> Ticket<T>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        let action: SharedAction<T> = Arc::new(move || action().boxed());

        let request = QueuedRequest {
            id,
            priority,
            enqueued_at: Instant::now(),
            retries: 0,
            max_retries: max_retries.unwrap_or(self.inner.config.default_max_retries),
            task: Box::new(Pending { action, reply: tx }),
        };

        let (admission, queued) = {
            let mut state = self.inner.state.lock();
            let admission = state.queue.push(priority, request);
            (admission, state.queue.len_of(priority))
        };

        match admission {
            Admission::Accepted => {
                self.inner.metrics.record_enqueued();
                prometheus::set_queue_size(priority.as_str(), queued as u64);
                tracing::debug!(%id, %priority, "Request enqueued");
            }
            Admission::Evicted(victim) => {
                self.inner.metrics.record_enqueued();
                self.inner.metrics.record_dropped();
                tracing::warn!(
                    victim = %victim.id,
                    victim_priority = %victim.priority,
                    %priority,
                    "Queue full, dropped queued request"
                );
                victim
                    .task
                    .reject(ReqflowError::dropped(format!("displaced by {} request", priority)));
            }
            Admission::Rejected(request) => {
                self.inner.metrics.record_rejected();
                let max = self.inner.config.max_queue_size;
                tracing::warn!(%id, %priority, max, "Queue full, request rejected");
                request.task.reject(ReqflowError::QueueFull { max });
            }
        }

        Ticket { id, rx }
    }

    /// Run an action right away, bypassing the queue and the concurrency cap
    pub async fn execute_immediate<T, F, Fut>(&self, action: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.inner.metrics.record_immediate();
        action().await
    }

    /// Wrap an action so that every call enqueues it at `priority`
    pub fn queued<T, F, Fut>(
        &self,
        priority: Priority,
        max_retries: Option<u32>,
        action: F,
    ) -> impl Fn() -> Ticket<T> + Clone + Send + Sync + 'static
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let manager = self.clone();
        let action = Arc::new(action);
        move || {
            let action = Arc::clone(&action);
            manager.enqueue(move || (*action)(), priority, max_retries)
        }
    }

    /// Start queued requests while slots are free. Returns how many started.
    pub fn tick(&self) -> usize {
        let mut started = 0;

        loop {
            let request = {
                let mut state = self.inner.state.lock();
                if state.active >= self.inner.config.max_concurrent {
                    break;
                }
                let Some(request) = state.queue.pop() else {
                    break;
                };
                if request.task.is_abandoned() {
                    drop(state);
                    self.inner.metrics.record_cancelled();
                    tracing::debug!(id = %request.id, "Caller gone, discarding queued request");
                    continue;
                }
                state.active += 1;
                request
            };

            if request.retries == 0 {
                self.inner.metrics.record_started(request.enqueued_at.elapsed());
            }
            tracing::debug!(id = %request.id, priority = %request.priority, retries = request.retries, "Request started");
            tokio::spawn(Arc::clone(&self.inner).run(request));
            started += 1;
        }

        if started > 0 {
            self.publish_gauges();
        }
        started
    }

    fn publish_gauges(&self) {
        let state = self.inner.state.lock();
        for priority in Priority::ALL {
            prometheus::set_queue_size(priority.as_str(), state.queue.len_of(priority) as u64);
        }
        prometheus::set_active_requests(state.active as u64);
    }

    /// Reject every queued request with `Cancelled`
    pub fn clear(&self) -> usize {
        let drained = self.inner.state.lock().queue.drain();
        let count = drained.len();
        for request in drained {
            self.inner.metrics.record_cancelled();
            request.task.reject(ReqflowError::Cancelled);
        }
        if count > 0 {
            tracing::info!(count, "Cleared scheduler queue");
        }
        count
    }

    /// Total queued requests
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().queue.is_empty()
    }

    /// Requests currently executing
    pub fn active(&self) -> usize {
        self.inner.state.lock().active
    }

    pub fn stats(&self) -> QueueStats {
        let (queued, total_queued, active) = {
            let state = self.inner.state.lock();
            let queued = TierCounts {
                critical: state.queue.len_of(Priority::Critical),
                high: state.queue.len_of(Priority::High),
                normal: state.queue.len_of(Priority::Normal),
                low: state.queue.len_of(Priority::Low),
            };
            (queued, state.queue.len(), state.active)
        };
        let m = &self.inner.metrics;

        QueueStats {
            processed: m.requests_processed.load(Ordering::Relaxed),
            failed: m.requests_failed.load(Ordering::Relaxed),
            dropped: m.requests_dropped.load(Ordering::Relaxed),
            rejected: m.requests_rejected.load(Ordering::Relaxed),
            retries: m.retries.load(Ordering::Relaxed),
            cancelled: m.requests_cancelled.load(Ordering::Relaxed),
            immediate: m.immediate.load(Ordering::Relaxed),
            avg_wait_ms: m.avg_queue_wait_ms(),
            queued,
            total_queued,
            active,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }
}

#[async_trait]
impl Tick for QueueManager {
    fn name(&self) -> &'static str {
        "queue-manager"
    }

    async fn tick(&self) {
        QueueManager::tick(self);
    }
}
