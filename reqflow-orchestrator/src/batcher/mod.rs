//! Request coalescing for table reads.
//!
//! # Architecture
//!
//! ```text
//! query(table, select, filters)
//!              │
//!     ┌────────▼────────┐
//!     │ pending batches │ ← keyed by (table, select)
//!     │  debounce timer │   flush after `debounce` or at `max_batch_size`
//!     └────────┬────────┘
//!              │
//!      every call is `id = x`?
//!        ├── yes ─► one select with `id IN (...)`, rows fanned out by id
//!        └── no ──► each call runs on its own, concurrently
//! ```
//!
//! # Features
//!
//! - **Id coalescing**: N lookups by id become one backend call
//! - **Count cache**: short-lived cached counts with in-flight deduplication
//! - **Failure isolation**: a failed id batch rejects its whole batch, a
//!   failed individual call only its own caller

mod config;
mod metrics;

pub use config::BatchConfig;
pub use metrics::{BatchStats, BatcherMetrics};

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::oneshot;

use reqflow_core::{value_key, DataSource, Filter, ReqflowError, Result, Row, SelectQuery};

use crate::cache::BoundedStore;
use crate::guard::catch_panic;
use crate::metrics::prometheus;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BatchKey {
    table: String,
    select: String,
}

struct BatchedQuery {
    filters: Vec<Filter>,
    reply: oneshot::Sender<Result<Vec<Row>>>,
}

struct PendingBatch {
    /// Distinguishes this batch from later ones under the same key
    generation: u64,
    calls: Vec<BatchedQuery>,
}

type CountFetch = Shared<BoxFuture<'static, Result<u64>>>;

struct BatchState {
    pending: HashMap<BatchKey, PendingBatch>,
    next_generation: u64,
    counts: BoundedStore<u64>,
    counts_in_flight: HashMap<String, CountFetch>,
}

struct BatcherInner {
    source: Arc<dyn DataSource>,
    config: BatchConfig,
    state: Mutex<BatchState>,
    metrics: BatcherMetrics,
}

impl BatcherInner {
    /// Flush a batch once its debounce window closes, unless it already went out
    async fn flush_after_debounce(self: Arc<Self>, key: BatchKey, generation: u64) {
        tokio::time::sleep(self.config.debounce).await;

        let batch = {
            let mut state = self.state.lock();
            let current = state.pending.get(&key).map(|b| b.generation) == Some(generation);
            if current {
                state.pending.remove(&key)
            } else {
                None
            }
        };

        if let Some(batch) = batch {
            self.dispatch(key, batch.calls).await;
        }
    }

    async fn dispatch(self: Arc<Self>, key: BatchKey, calls: Vec<BatchedQuery>) {
        let ids: Option<Vec<Value>> = calls.iter().map(|call| single_id(&call.filters)).collect();

        match ids {
            Some(ids) if !ids.is_empty() => self.dispatch_by_ids(key, calls, ids).await,
            _ => self.dispatch_individually(key, calls).await,
        }
    }

    async fn dispatch_by_ids(&self, key: BatchKey, calls: Vec<BatchedQuery>, ids: Vec<Value>) {
        let mut seen = HashSet::new();
        let unique: Vec<Value> = ids
            .iter()
            .filter(|id| seen.insert(value_key(id)))
            .cloned()
            .collect();

        tracing::debug!(
            table = %key.table,
            calls = calls.len(),
            ids = unique.len(),
            "Dispatching id batch"
        );
        self.metrics.record_id_batch(calls.len());
        prometheus::record_batch("ids");

        let query = SelectQuery::new(&key.table)
            .columns(with_id_column(&key.select))
            .filter(Filter::in_list("id", unique));

        match self.source.select(&query).await {
            Ok(result) => {
                let mut by_id: HashMap<String, Vec<Row>> = HashMap::new();
                for row in result.rows {
                    if let Some(id) = row.get("id") {
                        by_id.entry(value_key(id)).or_default().push(row);
                    }
                }
                for (call, id) in calls.into_iter().zip(ids.iter()) {
                    let rows = by_id.get(&value_key(id)).cloned().unwrap_or_default();
                    let _ = call.reply.send(Ok(rows));
                }
            }
            Err(e) => {
                self.metrics.record_batch_failure();
                tracing::warn!(table = %key.table, error = %e, "Id batch failed");
                for call in calls {
                    let _ = call.reply.send(Err(e.clone()));
                }
            }
        }
    }

    async fn dispatch_individually(&self, key: BatchKey, calls: Vec<BatchedQuery>) {
        tracing::debug!(table = %key.table, calls = calls.len(), "Dispatching calls individually");
        self.metrics.record_individual_batch(calls.len());
        prometheus::record_batch("individual");

        join_all(calls.into_iter().map(|call| {
            let query = SelectQuery::new(&key.table)
                .columns(key.select.clone())
                .filters(call.filters);
            let reply = call.reply;
            async move {
                let result = self.source.select(&query).await.map(|r| r.rows);
                let _ = reply.send(result);
            }
        }))
        .await;
    }

    fn settle_count(&self, key: &str, result: &Result<u64>) {
        let mut state = self.state.lock();
        state.counts_in_flight.remove(key);
        if let Ok(count) = result {
            state
                .counts
                .set(key.to_string(), *count, self.config.count_ttl);
        }
    }
}

/// Merges concurrent reads into batched backend calls
#[derive(Clone)]
pub struct RequestBatcher {
    inner: Arc<BatcherInner>,
}

impl RequestBatcher {
    pub fn new(source: Arc<dyn DataSource>, config: BatchConfig) -> Self {
        let counts = BoundedStore::new(config.count_capacity, 0.2);
        Self {
            inner: Arc::new(BatcherInner {
                source,
                config,
                state: Mutex::new(BatchState {
                    pending: HashMap::new(),
                    next_generation: 0,
                    counts,
                    counts_in_flight: HashMap::new(),
                }),
                metrics: BatcherMetrics::new(),
            }),
        }
    }

    /// Read rows, sharing a backend call with other reads of the same
    /// table and columns issued within the debounce window.
    pub async fn query(&self, table: &str, select: &str, filters: Vec<Filter>) -> Result<Vec<Row>> {
        self.inner.metrics.record_received();

        let key = BatchKey {
            table: table.to_string(),
            select: select.to_string(),
        };
        let (tx, rx) = oneshot::channel();
        let call = BatchedQuery { filters, reply: tx };

        let ready = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;

            let full = match state.pending.entry(key.clone()) {
                Entry::Occupied(mut entry) => {
                    entry.get_mut().calls.push(call);
                    entry.get().calls.len() >= self.inner.config.max_batch_size
                }
                Entry::Vacant(entry) => {
                    state.next_generation += 1;
                    let generation = state.next_generation;
                    entry.insert(PendingBatch {
                        generation,
                        calls: vec![call],
                    });
                    tokio::spawn(Arc::clone(&self.inner).flush_after_debounce(key.clone(), generation));
                    self.inner.config.max_batch_size <= 1
                }
            };

            if full {
                state.pending.remove(&key)
            } else {
                None
            }
        };

        // Dispatch on its own task so one caller going away can't stall the batch
        if let Some(batch) = ready {
            tokio::spawn(Arc::clone(&self.inner).dispatch(key, batch.calls));
        }

        rx.await.map_err(|_| ReqflowError::Cancelled)?
    }

    /// Count matching rows, cached for `count_ttl`
    pub async fn count(&self, table: &str, filters: &[Filter]) -> Result<u64> {
        let key = format!("{}:{}", table, serde_json::to_string(filters)?);

        let pending = {
            let mut state = self.inner.state.lock();

            if let Some(count) = state.counts.get(&key) {
                self.inner.metrics.record_count_hit();
                prometheus::record_cache_hit("count");
                return Ok(count);
            }

            if let Some(existing) = state.counts_in_flight.get(&key) {
                self.inner.metrics.record_count_deduplicated();
                existing.clone()
            } else {
                self.inner.metrics.record_count_fetch();
                prometheus::record_cache_miss("count");

                let inner = Arc::clone(&self.inner);
                let table = table.to_string();
                let filters = filters.to_vec();
                let owned_key = key.clone();
                let handle = tokio::spawn(async move {
                    let result = catch_panic(inner.source.count(&table, &filters)).await;
                    inner.settle_count(&owned_key, &result);
                    result
                });

                let shared = async move {
                    handle
                        .await
                        .unwrap_or_else(|e| Err(ReqflowError::internal(format!("count task failed: {}", e))))
                }
                .boxed()
                .shared();
                state.counts_in_flight.insert(key, shared.clone());
                shared
            }
        };

        pending.await
    }

    /// Drop expired counts
    pub fn sweep_expired(&self) -> usize {
        self.inner.state.lock().counts.evict_expired()
    }

    pub fn stats(&self) -> BatchStats {
        let state = self.inner.state.lock();
        let pending = state.pending.values().map(|b| b.calls.len()).sum();
        self.inner.metrics.snapshot(pending, state.counts.len())
    }

    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }
}

/// The id of a call that filters by exactly one `id = x`
fn single_id(filters: &[Filter]) -> Option<Value> {
    match filters {
        [Filter::Eq { column, value }] if column == "id" => Some(value.clone()),
        _ => None,
    }
}

/// Make sure `id` is selected so rows can be matched back to callers
pub(crate) fn with_id_column(select: &str) -> String {
    let select = select.trim();
    if select.is_empty() || select == "*" {
        return "*".to_string();
    }
    if select.split(',').any(|column| column.trim() == "id") {
        select.to_string()
    } else {
        format!("{},id", select)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqflow_core::MemoryDataSource;
    use serde_json::json;
    use std::time::Duration;

    fn seeded() -> Arc<MemoryDataSource> {
        let source = Arc::new(MemoryDataSource::new());
        source.insert(
            "products",
            (1..=5).map(|i| json!({"id": i, "name": format!("p{}", i), "stock": i * 10})),
        );
        source
    }

    fn batcher(source: Arc<MemoryDataSource>) -> RequestBatcher {
        RequestBatcher::new(source, BatchConfig::default())
    }

    #[test]
    fn test_with_id_column() {
        assert_eq!(with_id_column("*"), "*");
        assert_eq!(with_id_column("name,stock"), "name,stock,id");
        assert_eq!(with_id_column("id, name"), "id, name");
    }

    #[test]
    fn test_single_id() {
        assert_eq!(single_id(&[Filter::eq("id", 3)]), Some(json!(3)));
        assert_eq!(single_id(&[Filter::eq("sku", 3)]), None);
        assert_eq!(single_id(&[Filter::eq("id", 3), Filter::eq("x", 1)]), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_id_lookups_coalesce() {
        let source = seeded();
        let batcher = batcher(source.clone());

        let lookups = (1..=4).map(|i| batcher.query("products", "name", vec![Filter::eq("id", i)]));
        let results = join_all(lookups).await;

        assert_eq!(source.select_calls(), 1);
        let query = &source.select_log()[0];
        assert_eq!(query.columns, "name,id");
        assert_eq!(
            query.filters,
            vec![Filter::in_list("id", vec![json!(1), json!(2), json!(3), json!(4)])]
        );

        for (i, rows) in results.into_iter().enumerate() {
            let rows = rows.unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0]["name"], json!(format!("p{}", i + 1)));
        }
        assert_eq!(batcher.stats().calls_saved, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_and_missing_ids() {
        let source = seeded();
        let batcher = batcher(source.clone());

        let (a, b, missing) = tokio::join!(
            batcher.query("products", "*", vec![Filter::eq("id", 2)]),
            batcher.query("products", "*", vec![Filter::eq("id", 2)]),
            batcher.query("products", "*", vec![Filter::eq("id", 99)]),
        );

        assert_eq!(a.unwrap(), b.unwrap());
        assert!(missing.unwrap().is_empty());
        assert_eq!(
            source.select_log()[0].filters,
            vec![Filter::in_list("id", vec![json!(2), json!(99)])]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixed_filters_run_individually() {
        let source = seeded();
        let batcher = batcher(source.clone());

        let (by_id, by_stock) = tokio::join!(
            batcher.query("products", "*", vec![Filter::eq("id", 1)]),
            batcher.query("products", "*", vec![Filter::gte("stock", 40)]),
        );

        assert_eq!(by_id.unwrap().len(), 1);
        assert_eq!(by_stock.unwrap().len(), 2);
        assert_eq!(source.select_calls(), 2);
        assert_eq!(batcher.stats().individual_batches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_columns_are_separate_batches() {
        let source = seeded();
        let batcher = batcher(source.clone());

        let (a, b) = tokio::join!(
            batcher.query("products", "name", vec![Filter::eq("id", 1)]),
            batcher.query("products", "stock", vec![Filter::eq("id", 1)]),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(source.select_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_batch_size_flushes_early() {
        let source = seeded();
        let batcher = RequestBatcher::new(
            source.clone(),
            BatchConfig {
                max_batch_size: 2,
                debounce: Duration::from_secs(60),
                ..Default::default()
            },
        );

        let start = tokio::time::Instant::now();
        let (a, b) = tokio::join!(
            batcher.query("products", "*", vec![Filter::eq("id", 1)]),
            batcher.query("products", "*", vec![Filter::eq("id", 2)]),
        );
        a.unwrap();
        b.unwrap();
        assert!(start.elapsed() < Duration::from_secs(60));
        assert_eq!(source.select_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_failure_rejects_all_callers() {
        let source = seeded();
        source.fail_next(1);
        let batcher = batcher(source.clone());

        let (a, b) = tokio::join!(
            batcher.query("products", "*", vec![Filter::eq("id", 1)]),
            batcher.query("products", "*", vec![Filter::eq("id", 2)]),
        );
        assert!(matches!(a, Err(ReqflowError::Backend(_))));
        assert!(matches!(b, Err(ReqflowError::Backend(_))));
        assert_eq!(batcher.stats().batch_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_individual_failure_rejects_one_caller() {
        let source = seeded();
        source.fail_next(1);
        let batcher = batcher(source.clone());

        let (a, b) = tokio::join!(
            batcher.query("products", "*", vec![Filter::gte("stock", 10)]),
            batcher.query("products", "*", vec![Filter::lte("stock", 20)]),
        );
        let failures = [&a, &b].iter().filter(|r| r.is_err()).count();
        assert_eq!(failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_count_is_cached_and_deduplicated() {
        let source = seeded();
        source.set_latency(Duration::from_millis(20));
        let batcher = batcher(source.clone());
        let filters = vec![Filter::gte("stock", 30)];

        let (a, b) = tokio::join!(
            batcher.count("products", &filters),
            batcher.count("products", &filters),
        );
        assert_eq!(a, Ok(3));
        assert_eq!(b, Ok(3));
        assert_eq!(source.count_calls(), 1);

        assert_eq!(batcher.count("products", &filters).await, Ok(3));
        assert_eq!(source.count_calls(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(batcher.count("products", &filters).await, Ok(3));
        assert_eq!(source.count_calls(), 2);

        let stats = batcher.stats();
        assert_eq!(stats.count_hits, 1);
        assert_eq!(stats.count_deduplicated, 1);
    }

    /// Panics on its first count, then counts nothing
    struct BrokenCounter {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl DataSource for BrokenCounter {
        async fn select(&self, _query: &SelectQuery) -> Result<reqflow_core::QueryResult> {
            Ok(reqflow_core::QueryResult::default())
        }

        async fn count(&self, _table: &str, _filters: &[Filter]) -> Result<u64> {
            if self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                panic!("count exploded");
            }
            Ok(0)
        }

        async fn rpc(&self, _function: &str, _args: &Value) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_count_releases_marker() {
        let source = Arc::new(BrokenCounter {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let batcher = RequestBatcher::new(source, BatchConfig::default());

        let first = batcher.count("products", &[]).await;
        assert!(matches!(first, Err(ReqflowError::Internal(_))));
        assert_eq!(batcher.count("products", &[]).await, Ok(0));
    }
}
