//! Remote data service interface.
//!
//! The orchestration layer never talks to the network directly; it reads
//! through a [`DataSource`]. [`MemoryDataSource`] is a complete in-process
//! implementation used by tests and the simulator.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::error::{ReqflowError, Result};
use crate::types::{compare_values, Filter, QueryResult, Row, SelectQuery};

/// Read/RPC surface of the remote service
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Filtered, ordered, ranged table read
    async fn select(&self, query: &SelectQuery) -> Result<QueryResult>;

    /// Exact number of rows matching the filters
    async fn count(&self, table: &str, filters: &[Filter]) -> Result<u64>;

    /// Opaque remote function call
    async fn rpc(&self, function: &str, args: &Value) -> Result<Value>;
}

type RpcHandler = Box<dyn Fn(&Value) -> Result<Value> + Send + Sync>;

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, Vec<Row>>,
    select_log: Vec<SelectQuery>,
    failures_pending: usize,
    latency: Option<Duration>,
}

/// In-memory data source with call recording and failure injection
#[derive(Default)]
pub struct MemoryDataSource {
    state: Mutex<MemoryState>,
    functions: Mutex<HashMap<String, RpcHandler>>,
    count_calls: AtomicUsize,
    rpc_calls: AtomicUsize,
}

impl MemoryDataSource {
    /// Create an empty data source
    pub fn new() -> Self {
        Self::default()
    }

    /// Append rows to a table, creating it if needed
    pub fn insert(&self, table: &str, rows: impl IntoIterator<Item = Row>) {
        let mut state = self.state.lock();
        state.tables.entry(table.to_string()).or_default().extend(rows);
    }

    /// Replace fields of every row whose `id` matches
    pub fn update(&self, table: &str, id: &Value, patch: &Value) -> usize {
        let mut state = self.state.lock();
        let Some(rows) = state.tables.get_mut(table) else {
            return 0;
        };
        let matcher = Filter::Eq {
            column: "id".to_string(),
            value: id.clone(),
        };
        let mut updated = 0;
        for row in rows.iter_mut().filter(|r| matcher.matches(r)) {
            if let (Some(target), Some(fields)) = (row.as_object_mut(), patch.as_object()) {
                for (k, v) in fields {
                    target.insert(k.clone(), v.clone());
                }
                updated += 1;
            }
        }
        updated
    }

    /// Register a handler for [`DataSource::rpc`]
    pub fn register_function<F>(&self, name: &str, handler: F)
    where
        F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.functions
            .lock()
            .insert(name.to_string(), Box::new(handler));
    }

    /// Make the next `n` calls fail with a backend error
    pub fn fail_next(&self, n: usize) {
        self.state.lock().failures_pending = n;
    }

    /// Delay every call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = Some(latency);
    }

    /// Every select issued so far, in order
    pub fn select_log(&self) -> Vec<SelectQuery> {
        self.state.lock().select_log.clone()
    }

    /// Number of selects issued so far
    pub fn select_calls(&self) -> usize {
        self.state.lock().select_log.len()
    }

    /// Number of counts issued so far
    pub fn count_calls(&self) -> usize {
        self.count_calls.load(Ordering::Relaxed)
    }

    /// Number of rpc calls issued so far
    pub fn rpc_calls(&self) -> usize {
        self.rpc_calls.load(Ordering::Relaxed)
    }

    async fn simulate_call(&self) -> Result<()> {
        let (latency, fail) = {
            let mut state = self.state.lock();
            let fail = state.failures_pending > 0;
            if fail {
                state.failures_pending -= 1;
            }
            (state.latency, fail)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if fail {
            return Err(ReqflowError::backend("injected failure"));
        }
        Ok(())
    }

    fn matching_rows(&self, table: &str, filters: &[Filter]) -> Vec<Row> {
        let state = self.state.lock();
        state
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| filters.iter().all(|f| f.matches(row)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl DataSource for MemoryDataSource {
    async fn select(&self, query: &SelectQuery) -> Result<QueryResult> {
        self.state.lock().select_log.push(query.clone());
        self.simulate_call().await?;

        let mut rows = self.matching_rows(&query.table, &query.filters);

        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let ord = match (a.get(&order.column), b.get(&order.column)) {
                    (Some(x), Some(y)) => compare_values(x, y).unwrap_or(std::cmp::Ordering::Equal),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                };
                if order.ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }

        let count = query.count.then_some(rows.len() as u64);

        if let Some((from, to)) = query.range {
            rows = rows
                .into_iter()
                .skip(from)
                .take(to.saturating_sub(from) + 1)
                .collect();
        }

        let rows = rows
            .into_iter()
            .map(|row| project(row, &query.columns))
            .collect();

        debug!(table = %query.table, "Memory select");
        Ok(QueryResult { rows, count })
    }

    async fn count(&self, table: &str, filters: &[Filter]) -> Result<u64> {
        self.count_calls.fetch_add(1, Ordering::Relaxed);
        self.simulate_call().await?;
        Ok(self.matching_rows(table, filters).len() as u64)
    }

    async fn rpc(&self, function: &str, args: &Value) -> Result<Value> {
        self.rpc_calls.fetch_add(1, Ordering::Relaxed);
        self.simulate_call().await?;
        let functions = self.functions.lock();
        match functions.get(function) {
            Some(handler) => handler(args),
            None => Err(ReqflowError::backend(format!(
                "function '{}' not found",
                function
            ))),
        }
    }
}

/// Keep only the requested columns of a row
fn project(row: Row, columns: &str) -> Row {
    if columns.trim() == "*" {
        return row;
    }
    let Value::Object(fields) = row else {
        return row;
    };
    let mut projected = Map::new();
    for column in columns.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        if let Some(v) = fields.get(column) {
            projected.insert(column.to_string(), v.clone());
        }
    }
    Value::Object(projected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seeded() -> MemoryDataSource {
        let source = MemoryDataSource::new();
        source.insert(
            "orders",
            vec![
                json!({"id": 1, "total": 30, "status": "paid"}),
                json!({"id": 2, "total": 10, "status": "open"}),
                json!({"id": 3, "total": 20, "status": "paid"}),
            ],
        );
        source
    }

    #[tokio::test]
    async fn test_select_filter_order_range() {
        let source = seeded();
        let query = SelectQuery::new("orders")
            .filter(Filter::eq("status", "paid"))
            .order("total", true)
            .range(0, 0)
            .with_count();

        let result = source.select(&query).await.unwrap();
        assert_eq!(result.count, Some(2));
        assert_eq!(result.rows, vec![json!({"id": 3, "total": 20, "status": "paid"})]);
        assert_eq!(source.select_calls(), 1);
    }

    #[tokio::test]
    async fn test_projection() {
        let source = seeded();
        let query = SelectQuery::new("orders")
            .columns("id, status")
            .filter(Filter::eq("id", 2));
        let result = source.select(&query).await.unwrap();
        assert_eq!(result.rows, vec![json!({"id": 2, "status": "open"})]);
        assert_eq!(result.count, None);
    }

    #[tokio::test]
    async fn test_count_and_failure_injection() {
        let source = seeded();
        source.fail_next(1);
        assert!(source.count("orders", &[]).await.is_err());
        assert_eq!(source.count("orders", &[]).await.unwrap(), 3);
        assert_eq!(source.count_calls(), 2);
    }

    #[tokio::test]
    async fn test_update_and_rpc() {
        let source = seeded();
        assert_eq!(source.update("orders", &json!(2), &json!({"status": "paid"})), 1);
        let paid = source.count("orders", &[Filter::eq("status", "paid")]).await.unwrap();
        assert_eq!(paid, 3);

        source.register_function("echo", |args| Ok(args.clone()));
        assert_eq!(source.rpc("echo", &json!({"a": 1})).await.unwrap(), json!({"a": 1}));
        assert!(source.rpc("missing", &json!(null)).await.is_err());
        assert_eq!(source.rpc_calls(), 2);
    }
}
