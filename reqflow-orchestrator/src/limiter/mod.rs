//! Per-category fixed-window admission control.
//!
//! # Architecture
//!
//! ```text
//! execute(category, action)
//!        │
//!        ├── window open, queue empty ──► run now
//!        │
//!        └── otherwise ──► category FIFO ──► drain task
//!                                              │ sleeps out the window,
//!                                              ▼ then dispatches in order
//!                                          spawned action ──► caller
//! ```
//!
//! One drain task runs per category while its queue is non-empty. Items whose
//! caller stopped waiting are skipped without consuming admission.

mod config;

pub use config::{CategoryLimit, RateLimitConfig, DEFAULT_CATEGORY};

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use reqflow_core::{ReqflowError, Result};

use crate::metrics::prometheus;

/// Fixed-window admission counter for one category
#[derive(Debug, Clone, Copy)]
struct WindowRecord {
    count: u32,
    window_start: Instant,
}

impl WindowRecord {
    fn elapsed(&self, limit: &CategoryLimit, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) >= limit.window
    }

    fn can_admit(&self, limit: &CategoryLimit, now: Instant) -> bool {
        limit.max_requests > 0 && (self.elapsed(limit, now) || self.count < limit.max_requests)
    }

    fn record(&mut self, limit: &CategoryLimit, now: Instant) {
        if self.elapsed(limit, now) {
            self.count = 1;
            self.window_start = now;
        } else {
            self.count += 1;
        }
    }

    fn remaining(&self, limit: &CategoryLimit, now: Instant) -> u32 {
        if self.elapsed(limit, now) {
            limit.max_requests
        } else {
            limit.max_requests.saturating_sub(self.count)
        }
    }

    fn reset_in(&self, limit: &CategoryLimit, now: Instant) -> Duration {
        if self.elapsed(limit, now) {
            Duration::ZERO
        } else {
            limit.window - now.saturating_duration_since(self.window_start)
        }
    }
}

/// An action parked until its category admits it
trait Waiting: Send {
    fn is_abandoned(&self) -> bool;

    fn dispatch(self: Box<Self>);

    fn deny(self: Box<Self>, error: ReqflowError);
}

struct PendingAction<F, T> {
    action: F,
    reply: oneshot::Sender<Result<T>>,
}

impl<F, Fut, T> Waiting for PendingAction<F, T>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }

    fn dispatch(self: Box<Self>) {
        let PendingAction { action, reply } = *self;
        tokio::spawn(async move {
            let result = action().await;
            let _ = reply.send(result);
        });
    }

    fn deny(self: Box<Self>, error: ReqflowError) {
        let _ = self.reply.send(Err(error));
    }
}

enum Next {
    Ready(Box<dyn Waiting>),
    Wait(Duration),
    /// The category was closed (limit of zero) while these waited
    Denied(VecDeque<Box<dyn Waiting>>),
    Idle,
}

#[derive(Default)]
struct Counters {
    admitted: u64,
    queued: u64,
    denied: u64,
    skipped: u64,
}

struct LimiterState {
    config: RateLimitConfig,
    windows: HashMap<String, WindowRecord>,
    queues: HashMap<String, VecDeque<Box<dyn Waiting>>>,
    draining: HashSet<String>,
    counters: Counters,
}

impl LimiterState {
    fn can_admit(&self, category: &str, now: Instant) -> bool {
        let limit = self.config.limit_for(category);
        self.windows
            .get(category)
            .map_or(limit.max_requests > 0, |w| w.can_admit(&limit, now))
    }

    fn record(&mut self, category: &str, now: Instant) {
        let limit = self.config.limit_for(category);
        self.windows
            .entry(category.to_string())
            .or_insert(WindowRecord {
                count: 0,
                window_start: now,
            })
            .record(&limit, now);
        self.counters.admitted += 1;
    }

    fn queue_len(&self, category: &str) -> usize {
        self.queues.get(category).map_or(0, VecDeque::len)
    }

    fn reset_in(&self, category: &str, now: Instant) -> Duration {
        let limit = self.config.limit_for(category);
        self.windows
            .get(category)
            .map_or(Duration::ZERO, |w| w.reset_in(&limit, now))
    }

    /// Pop the next admissible item, or say how long to wait for one.
    /// Going idle clears the drain flag under the same lock as the emptiness check.
    fn next_ready(&mut self, category: &str, now: Instant) -> Next {
        loop {
            let Some(queue) = self.queues.get_mut(category) else {
                self.draining.remove(category);
                return Next::Idle;
            };
            match queue.front().map(|item| item.is_abandoned()) {
                None => {
                    self.queues.remove(category);
                    self.draining.remove(category);
                    return Next::Idle;
                }
                Some(true) => {
                    queue.pop_front();
                    self.counters.skipped += 1;
                    continue;
                }
                Some(false) => {}
            }

            if self.config.limit_for(category).max_requests == 0 {
                let denied = self.queues.remove(category).unwrap_or_default();
                self.draining.remove(category);
                self.counters.denied += denied.len() as u64;
                return Next::Denied(denied);
            }
            if !self.can_admit(category, now) {
                return Next::Wait(self.reset_in(category, now));
            }
            self.record(category, now);
            return match self.queues.get_mut(category).and_then(VecDeque::pop_front) {
                Some(item) => Next::Ready(item),
                None => Next::Idle,
            };
        }
    }
}

struct LimiterInner {
    state: Mutex<LimiterState>,
}

impl LimiterInner {
    async fn drain(self: Arc<Self>, category: String) {
        tracing::debug!(category = %category, "Rate limit drain started");
        loop {
            let next = self.state.lock().next_ready(&category, Instant::now());
            match next {
                Next::Ready(item) => {
                    prometheus::record_admission(&category, "admitted");
                    item.dispatch();
                }
                Next::Wait(delay) => {
                    tracing::debug!(category = %category, wait_ms = delay.as_millis() as u64, "Waiting for rate window");
                    tokio::time::sleep(delay.max(Duration::from_millis(1))).await;
                }
                Next::Denied(items) => {
                    tracing::warn!(category = %category, count = items.len(), "Rate limit is zero, denying queued requests");
                    for item in items {
                        prometheus::record_admission(&category, "denied");
                        item.deny(ReqflowError::admission_denied(category.as_str()));
                    }
                    prometheus::set_limiter_queue_size(&category, 0);
                    break;
                }
                Next::Idle => break,
            }
            let queued = self.state.lock().queue_len(&category);
            prometheus::set_limiter_queue_size(&category, queued as u64);
        }
        tracing::debug!(category = %category, "Rate limit drain finished");
    }
}

/// Per-category statistics
#[derive(Debug, Clone, Serialize)]
pub struct CategoryStats {
    pub max_requests: u32,
    pub window_ms: u64,
    pub remaining: u32,
    pub reset_in_ms: u64,
    pub queued: usize,
}

/// Snapshot of limiter statistics
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStats {
    pub admitted: u64,
    pub queued: u64,
    pub denied: u64,
    pub skipped: u64,
    pub categories: BTreeMap<String, CategoryStats>,
}

/// Fixed-window rate limiter with FIFO overflow queues
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                state: Mutex::new(LimiterState {
                    config,
                    windows: HashMap::new(),
                    queues: HashMap::new(),
                    draining: HashSet::new(),
                    counters: Counters::default(),
                }),
            }),
        }
    }

    /// Set or replace the limit of a category
    pub fn configure_limit(&self, category: impl Into<String>, max_requests: u32, window: Duration) {
        let category = category.into();
        tracing::debug!(category = %category, max_requests, window_ms = window.as_millis() as u64, "Rate limit configured");
        self.inner
            .state
            .lock()
            .config
            .limits
            .insert(category, CategoryLimit { max_requests, window });
    }

    /// Whether a request would be admitted right now. Does not record anything.
    pub fn can_make_request(&self, category: &str) -> bool {
        self.inner.state.lock().can_admit(category, Instant::now())
    }

    /// Count a request against the category's window
    pub fn record_request(&self, category: &str) {
        self.inner.state.lock().record(category, Instant::now());
    }

    /// Admissions left in the current window
    pub fn remaining(&self, category: &str) -> u32 {
        let state = self.inner.state.lock();
        let limit = state.config.limit_for(category);
        state
            .windows
            .get(category)
            .map_or(limit.max_requests, |w| w.remaining(&limit, Instant::now()))
    }

    /// Time until the current window resets
    pub fn reset_in(&self, category: &str) -> Duration {
        self.inner.state.lock().reset_in(category, Instant::now())
    }

    /// Actions waiting for admission in a category
    pub fn queue_len(&self, category: &str) -> usize {
        self.inner.state.lock().queue_len(category)
    }

    /// Run `action` once the category admits it.
    ///
    /// Runs immediately when the window has capacity and nothing is queued
    /// ahead; otherwise waits in the category's FIFO queue.
    pub async fn execute<T, F, Fut>(&self, category: &str, action: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let run_now = {
            let mut state = self.inner.state.lock();
            let now = Instant::now();
            let admit = state.queue_len(category) == 0 && state.can_admit(category, now);
            if admit {
                state.record(category, now);
            }
            admit
        };

        if run_now {
            prometheus::record_admission(category, "admitted");
            return action().await;
        }

        let rx = {
            let mut state = self.inner.state.lock();
            if state.config.limit_for(category).max_requests == 0 {
                state.counters.denied += 1;
                prometheus::record_admission(category, "denied");
                tracing::warn!(category = %category, "Rate limit is zero, request denied");
                return Err(ReqflowError::admission_denied(category));
            }
            if state.queue_len(category) >= state.config.max_queue_per_category {
                state.counters.denied += 1;
                prometheus::record_admission(category, "denied");
                tracing::warn!(category = %category, "Rate limit queue full, request denied");
                return Err(ReqflowError::admission_denied(category));
            }

            let (tx, rx) = oneshot::channel();
            state
                .queues
                .entry(category.to_string())
                .or_default()
                .push_back(Box::new(PendingAction { action, reply: tx }));
            state.counters.queued += 1;

            if state.draining.insert(category.to_string()) {
                tokio::spawn(Arc::clone(&self.inner).drain(category.to_string()));
            }
            rx
        };

        prometheus::record_admission(category, "queued");
        tracing::debug!(category = %category, "Request queued by rate limiter");
        rx.await.map_err(|_| ReqflowError::Cancelled)?
    }

    /// Run `action` only if it can be admitted right now
    pub async fn try_execute<T, F, Fut>(&self, category: &str, action: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        {
            let mut state = self.inner.state.lock();
            let now = Instant::now();
            if state.queue_len(category) > 0 || !state.can_admit(category, now) {
                state.counters.denied += 1;
                drop(state);
                prometheus::record_admission(category, "denied");
                return Err(ReqflowError::admission_denied(category));
            }
            state.record(category, now);
        }
        prometheus::record_admission(category, "admitted");
        action().await
    }

    pub fn stats(&self) -> LimiterStats {
        let state = self.inner.state.lock();
        let now = Instant::now();

        let mut names: Vec<&String> = state.config.limits.keys().collect();
        names.extend(state.windows.keys());

        let categories = names
            .into_iter()
            .map(|name| {
                let limit = state.config.limit_for(name);
                let window = state.windows.get(name.as_str());
                let stats = CategoryStats {
                    max_requests: limit.max_requests,
                    window_ms: limit.window.as_millis() as u64,
                    remaining: window.map_or(limit.max_requests, |w| w.remaining(&limit, now)),
                    reset_in_ms: window.map_or(0, |w| w.reset_in(&limit, now).as_millis() as u64),
                    queued: state.queue_len(name),
                };
                (name.clone(), stats)
            })
            .collect();

        LimiterStats {
            admitted: state.counters.admitted,
            queued: state.counters.queued,
            denied: state.counters.denied,
            skipped: state.counters.skipped,
            categories,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn limiter(category: &str, max: u32) -> RateLimiter {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        limiter.configure_limit(category, max, Duration::from_secs(1));
        limiter
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_accounting() {
        let limiter = limiter("ai", 2);
        assert!(limiter.can_make_request("ai"));
        assert_eq!(limiter.remaining("ai"), 2);

        limiter.record_request("ai");
        limiter.record_request("ai");
        assert!(!limiter.can_make_request("ai"));
        assert_eq!(limiter.remaining("ai"), 0);
        assert_eq!(limiter.reset_in("ai"), Duration::from_secs(1));

        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(limiter.reset_in("ai"), Duration::from_millis(600));

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(limiter.can_make_request("ai"));
        assert_eq!(limiter.remaining("ai"), 2);

        // A request after the window restarts it with a count of one
        limiter.record_request("ai");
        assert_eq!(limiter.remaining("ai"), 1);
    }

    #[tokio::test]
    async fn test_can_make_request_is_pure() {
        let limiter = limiter("ai", 1);
        for _ in 0..5 {
            assert!(limiter.can_make_request("ai"));
        }
        assert_eq!(limiter.remaining("ai"), 1);
    }

    #[tokio::test]
    async fn test_unknown_category_has_own_window() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        limiter.record_request("search");
        assert_eq!(limiter.remaining("search"), 99);
        assert_eq!(limiter.remaining("api"), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_waits_for_window() {
        let limiter = limiter("ai", 2);
        let start = Instant::now();

        for i in 0..2 {
            let v = limiter.execute("ai", move || async move { Ok(i) }).await.unwrap();
            assert_eq!(v, i);
        }

        let queued = limiter.execute("ai", || async { Ok(Instant::now()) }).await.unwrap();
        assert!(queued.duration_since(start) >= Duration::from_secs(1));
        assert_eq!(limiter.stats().queued, 1);
        assert_eq!(limiter.queue_len("ai"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_is_fifo() {
        let limiter = limiter("upload", 1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let limiter = limiter.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .execute("upload", move || async move {
                        order.lock().push(i);
                        Ok(())
                    })
                    .await
            }));
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_error_propagates() {
        let limiter = limiter("ai", 1);
        limiter.record_request("ai");

        let result: Result<()> = limiter
            .execute("ai", || async { Err(ReqflowError::backend("down")) })
            .await;
        assert_eq!(result, Err(ReqflowError::backend("down")));

        // The drain kept going for later work
        limiter.record_request("ai");
        let ok = limiter.execute("ai", || async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_bound_and_try_execute() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_queue_per_category: 1,
            ..Default::default()
        });
        limiter.configure_limit("ai", 1, Duration::from_secs(1));
        limiter.record_request("ai");

        let denied = limiter.try_execute("ai", || async { Ok(()) }).await;
        assert_eq!(denied, Err(ReqflowError::admission_denied("ai")));

        let waiting = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.execute("ai", || async { Ok(1) }).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(limiter.queue_len("ai"), 1);

        let overflow = limiter.execute("ai", || async { Ok(2) }).await;
        assert_eq!(overflow, Err(ReqflowError::admission_denied("ai")));

        assert_eq!(waiting.await.unwrap(), Ok(1));
        assert_eq!(limiter.stats().denied, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_limit_denies() {
        let blocked = limiter("blocked", 0);
        assert!(!blocked.can_make_request("blocked"));

        let result = blocked.execute("blocked", || async { Ok(()) }).await;
        assert_eq!(result, Err(ReqflowError::admission_denied("blocked")));
        assert_eq!(blocked.queue_len("blocked"), 0);

        // A category closed while requests wait rejects them on the next window
        let limiter = limiter("ai", 1);
        limiter.record_request("ai");
        let waiting = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.execute("ai", || async { Ok(1) }).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(limiter.queue_len("ai"), 1);

        limiter.configure_limit("ai", 0, Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(waiting.await.unwrap(), Err(ReqflowError::admission_denied("ai")));
        assert_eq!(limiter.queue_len("ai"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_item_skipped() {
        let limiter = limiter("ai", 1);
        limiter.record_request("ai");
        let runs = Arc::new(AtomicUsize::new(0));

        let counted = runs.clone();
        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            limiter.execute("ai", move || async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(limiter.stats().skipped, 1);
        // The skipped item did not use up the new window
        assert_eq!(limiter.remaining("ai"), 1);
    }
}
