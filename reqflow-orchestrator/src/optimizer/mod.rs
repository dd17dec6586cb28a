//! Cached, batched read API over a [`DataSource`].
//!
//! Single-row lookups go through a [`RequestBatcher`] so that concurrent
//! `get_by_id` calls for one table collapse into one `id IN (...)` select.
//! Rows and list pages are cached with their own TTLs and can be invalidated
//! per table or per row.

mod config;
mod metrics;

pub use config::OptimizerConfig;
pub use metrics::{OptimizerMetrics, QueryMetrics};

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use reqflow_core::{value_key, DataSource, Filter, Order, QueryResult, Result, Row, SelectQuery};

use crate::batcher::{with_id_column, BatchConfig, RequestBatcher};
use crate::cache::BoundedStore;
use crate::metrics::QueryTimer;
use crate::ticker::Tick;

/// Parameters of a list read
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListOptions {
    /// Column list, `*` when unset
    pub select: Option<String>,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    /// 1-based page number
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(mut self, columns: impl Into<String>) -> Self {
        self.select = Some(columns.into());
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order = Some(Order {
            column: column.into(),
            ascending,
        });
        self
    }

    pub fn page(mut self, page: usize, page_size: usize) -> Self {
        self.page = Some(page);
        self.page_size = Some(page_size);
        self
    }

    /// Inclusive row range of the requested page
    fn range(&self) -> Option<(usize, usize)> {
        let size = self.page_size.filter(|s| *s > 0)?;
        let page = self.page.unwrap_or(1).max(1);
        let from = (page - 1) * size;
        Some((from, from + size - 1))
    }

    fn to_query(&self, table: &str) -> SelectQuery {
        let mut query = SelectQuery::new(table)
            .columns(self.select.clone().unwrap_or_else(|| "*".to_string()))
            .filters(self.filters.iter().cloned())
            .with_count();
        if let Some(order) = &self.order {
            query = query.order(order.column.clone(), order.ascending);
        }
        if let Some((from, to)) = self.range() {
            query = query.range(from, to);
        }
        query
    }
}

#[derive(Clone)]
enum Cached {
    Row(Row),
    List(QueryResult),
}

/// The id segment is a quoted JSON string, so no id can extend another's prefix
fn row_prefix(table: &str, id: &Value) -> String {
    format!("{}/row/{}/", table, Value::String(value_key(id)))
}

fn row_key(table: &str, id: &Value, select: &str) -> String {
    format!("{}{}", row_prefix(table, id), select)
}

fn list_key(table: &str, options: &ListOptions) -> Result<String> {
    Ok(format!("{}/list/{}", table, serde_json::to_string(options)?))
}

struct OptimizerInner {
    source: Arc<dyn DataSource>,
    batcher: RequestBatcher,
    cache: Mutex<BoundedStore<Cached>>,
    metrics: OptimizerMetrics,
    config: OptimizerConfig,
}

/// Read API composing batching, caching and query metrics
#[derive(Clone)]
pub struct DatabaseOptimizer {
    inner: Arc<OptimizerInner>,
}

impl DatabaseOptimizer {
    pub fn new(source: Arc<dyn DataSource>, config: OptimizerConfig, batch: BatchConfig) -> Self {
        let batcher = RequestBatcher::new(Arc::clone(&source), batch);
        Self {
            inner: Arc::new(OptimizerInner {
                source,
                batcher,
                cache: Mutex::new(BoundedStore::new(config.cache_capacity, 0.2)),
                metrics: OptimizerMetrics::new(),
                config,
            }),
        }
    }

    /// Fetch one row by id. A missing row is `None` and is not cached.
    pub async fn get_by_id(
        &self,
        table: &str,
        id: impl Into<Value>,
        select: &str,
        ttl: Option<Duration>,
    ) -> Result<Option<Row>> {
        let id = id.into();
        let key = row_key(table, &id, select);
        self.inner.metrics.record_query();

        if let Some(Cached::Row(row)) = self.inner.cache.lock().get(&key) {
            self.inner.metrics.record_cached();
            return Ok(Some(row));
        }

        self.inner.metrics.record_batched();
        let timer = QueryTimer::new(table);
        let started = Instant::now();
        let result = self
            .inner
            .batcher
            .query(table, select, vec![Filter::eq("id", id)])
            .await;
        self.observe(table, "get_by_id", started.elapsed());

        let rows = match result {
            Ok(rows) => {
                timer.record_success();
                rows
            }
            Err(e) => {
                timer.record_failure();
                return Err(e);
            }
        };

        let row = rows.into_iter().next();
        if let Some(row) = &row {
            let ttl = ttl.unwrap_or(self.inner.config.default_ttl);
            self.inner
                .cache
                .lock()
                .set(key, Cached::Row(row.clone()), ttl);
        }
        Ok(row)
    }

    /// Read one page of a table with an exact total count
    pub async fn get_list(&self, table: &str, options: &ListOptions) -> Result<QueryResult> {
        let key = list_key(table, options)?;
        self.inner.metrics.record_query();

        if let Some(Cached::List(result)) = self.inner.cache.lock().get(&key) {
            self.inner.metrics.record_cached();
            return Ok(result);
        }

        let query = options.to_query(table);
        let timer = QueryTimer::new(table);
        let started = Instant::now();
        let result = self.inner.source.select(&query).await;
        self.observe(table, "get_list", started.elapsed());

        match result {
            Ok(result) => {
                timer.record_success();
                self.inner.cache.lock().set(
                    key,
                    Cached::List(result.clone()),
                    self.inner.config.list_ttl,
                );
                Ok(result)
            }
            Err(e) => {
                timer.record_failure();
                Err(e)
            }
        }
    }

    /// Drop cached rows and pages of a table, or only the rows of one id
    pub fn invalidate(&self, table: &str, id: Option<&Value>) -> usize {
        let prefix = match id {
            Some(id) => row_prefix(table, id),
            None => format!("{}/", table),
        };
        let pattern = match Regex::new(&format!("^{}", regex::escape(&prefix))) {
            Ok(pattern) => pattern,
            Err(e) => {
                warn!(table = %table, error = %e, "Could not build invalidation pattern");
                return 0;
            }
        };

        let removed = self.inner.cache.lock().clear_by_pattern(&pattern);
        debug!(table = %table, removed, "Invalidated cache entries");
        removed
    }

    /// Load uncached rows in one `IN` select and cache each of them.
    ///
    /// Failures are logged, never returned.
    pub async fn prefetch(&self, table: &str, ids: &[Value], select: &str, ttl: Option<Duration>) {
        let missing: Vec<Value> = {
            let mut cache = self.inner.cache.lock();
            let mut seen = HashSet::new();
            ids.iter()
                .filter(|id| seen.insert(value_key(id)))
                .filter(|id| !cache.has(&row_key(table, id, select)))
                .cloned()
                .collect()
        };
        if missing.is_empty() {
            return;
        }

        let count = missing.len();
        let query = SelectQuery::new(table)
            .columns(with_id_column(select))
            .filter(Filter::in_list("id", missing));

        let timer = QueryTimer::new(table);
        let started = Instant::now();
        let result = self.inner.source.select(&query).await;
        self.observe(table, "prefetch", started.elapsed());

        match result {
            Ok(result) => {
                timer.record_success();
                let ttl = ttl.unwrap_or(self.inner.config.default_ttl);
                let mut cache = self.inner.cache.lock();
                for row in result.rows {
                    if let Some(id) = row.get("id").cloned() {
                        cache.set(row_key(table, &id, select), Cached::Row(row), ttl);
                    }
                }
                debug!(table = %table, requested = count, "Prefetched rows");
            }
            Err(e) => {
                timer.record_failure();
                warn!(table = %table, error = %e, "Prefetch failed");
            }
        }
    }

    pub fn get_metrics(&self) -> QueryMetrics {
        let cached = self.inner.cache.lock().len();
        self.inner.metrics.snapshot(cached)
    }

    /// Drop expired rows, pages and counts
    pub fn sweep_expired(&self) -> usize {
        let removed = self.inner.cache.lock().evict_expired();
        removed + self.inner.batcher.sweep_expired()
    }

    /// The batcher used for id lookups
    pub fn batcher(&self) -> &RequestBatcher {
        &self.inner.batcher
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.inner.config
    }

    fn observe(&self, table: &str, operation: &str, latency: Duration) {
        let slow = self
            .inner
            .metrics
            .record_latency(latency, self.inner.config.slow_query_threshold);
        if slow {
            warn!(
                table = %table,
                operation = %operation,
                latency_ms = latency.as_millis() as u64,
                "Slow query"
            );
        }
    }
}

#[async_trait]
impl Tick for DatabaseOptimizer {
    fn name(&self) -> &'static str {
        "database-optimizer"
    }

    async fn tick(&self) {
        let removed = self.sweep_expired();
        if removed > 0 {
            debug!(removed, "Swept expired query cache entries");
        }
    }
}
