//! Periodic driver for background maintenance.
//!
//! Components expose their timer-driven work (expiry sweeps, queue
//! processing, idle channel reaping) through [`Tick`]. A [`Ticker`] owns one
//! tokio interval task per registered component and aborts them all on
//! [`Ticker::shutdown`] or drop.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Periodic maintenance hook
#[async_trait]
pub trait Tick: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Run one round of maintenance
    async fn tick(&self);
}

/// Owns the interval tasks that call [`Tick::tick`]
#[derive(Default)]
pub struct Ticker {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Ticker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `target.tick()` every `period` until shut down.
    ///
    /// The first tick fires one period after spawning.
    pub fn spawn(&mut self, target: Arc<dyn Tick>, period: Duration) {
        let name = target.name();
        let period = period.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                target.tick().await;
            }
        });

        tracing::debug!(task = name, period_ms = period.as_millis() as u64, "Background tick started");
        self.handles.push((name, handle));
    }

    /// Number of running tick tasks
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop every tick task
    pub fn shutdown(&mut self) {
        for (name, handle) in self.handles.drain(..) {
            handle.abort();
            tracing::debug!(task = name, "Background tick stopped");
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    #[async_trait]
    impl Tick for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        async fn tick(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_shutdown() {
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let mut ticker = Ticker::new();
        ticker.spawn(counter.clone(), Duration::from_millis(100));
        assert_eq!(ticker.len(), 1);

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 3);

        ticker.shutdown();
        assert!(ticker.is_empty());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 3);
    }
}
