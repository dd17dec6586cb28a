//! Query types shared by every data source implementation.
//!
//! These mirror the read surface of the remote service: a table select with
//! `eq`/`in`/`gte`/`lte`/`ilike` filters, ordering, an inclusive row range and
//! an optional exact count.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// A single row returned by the remote service (a JSON object)
pub type Row = Value;

/// Row filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    /// `column = value`
    Eq { column: String, value: Value },
    /// `column IN (values)`
    In { column: String, values: Vec<Value> },
    /// `column >= value`
    Gte { column: String, value: Value },
    /// `column <= value`
    Lte { column: String, value: Value },
    /// Case-insensitive `LIKE` with `%` and `_` wildcards
    #[serde(rename = "ilike")]
    ILike { column: String, pattern: String },
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn in_list(column: impl Into<String>, values: Vec<Value>) -> Self {
        Self::In {
            column: column.into(),
            values,
        }
    }

    pub fn gte(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gte {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn lte(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lte {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn ilike(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::ILike {
            column: column.into(),
            pattern: pattern.into(),
        }
    }

    /// Column this filter applies to
    pub fn column(&self) -> &str {
        match self {
            Self::Eq { column, .. }
            | Self::In { column, .. }
            | Self::Gte { column, .. }
            | Self::Lte { column, .. }
            | Self::ILike { column, .. } => column,
        }
    }

    /// Evaluate the filter against a row
    pub fn matches(&self, row: &Row) -> bool {
        let Some(field) = row.get(self.column()) else {
            return false;
        };
        match self {
            Self::Eq { value, .. } => value_key(field) == value_key(value),
            Self::In { values, .. } => {
                let key = value_key(field);
                values.iter().any(|v| value_key(v) == key)
            }
            Self::Gte { value, .. } => {
                matches!(compare_values(field, value), Some(Ordering::Greater | Ordering::Equal))
            }
            Self::Lte { value, .. } => {
                matches!(compare_values(field, value), Some(Ordering::Less | Ordering::Equal))
            }
            Self::ILike { pattern, .. } => match field {
                Value::String(s) => like_match(&s.to_lowercase(), &pattern.to_lowercase()),
                _ => false,
            },
        }
    }
}

/// Sort order for a select
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// A table read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectQuery {
    pub table: String,
    /// Comma-separated column list, `*` for all
    pub columns: String,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    /// Inclusive row range `(from, to)`
    pub range: Option<(usize, usize)>,
    /// Request an exact total count alongside the rows
    pub count: bool,
}

impl SelectQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: "*".to_string(),
            filters: Vec::new(),
            order: None,
            range: None,
            count: false,
        }
    }

    pub fn columns(mut self, columns: impl Into<String>) -> Self {
        self.columns = columns.into();
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn filters(mut self, filters: impl IntoIterator<Item = Filter>) -> Self {
        self.filters.extend(filters);
        self
    }

    pub fn order(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order = Some(Order {
            column: column.into(),
            ascending,
        });
        self
    }

    pub fn range(mut self, from: usize, to: usize) -> Self {
        self.range = Some((from, to));
        self
    }

    pub fn with_count(mut self) -> Self {
        self.count = true;
        self
    }
}

/// Rows plus the exact count when one was requested
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub count: Option<u64>,
}

/// Canonical string form of a scalar used for id matching.
///
/// Strings compare by content and everything else by its JSON text, so the
/// id `5` and the id `"5"` are the same row.
pub fn value_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Order two JSON scalars of the same kind
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// SQL `LIKE` matching: `%` matches any run, `_` matches one character
fn like_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();

    // dp[j] = pattern[..i] matches text[..j]
    let mut dp = vec![false; text.len() + 1];
    dp[0] = true;
    for p in &pattern {
        let mut next = vec![false; text.len() + 1];
        match p {
            '%' => {
                let mut seen = false;
                for j in 0..=text.len() {
                    seen |= dp[j];
                    next[j] = seen;
                }
            }
            '_' => {
                for j in 1..=text.len() {
                    next[j] = dp[j - 1];
                }
            }
            c => {
                for j in 1..=text.len() {
                    next[j] = dp[j - 1] && text[j - 1] == *c;
                }
            }
        }
        dp = next;
    }
    dp[text.len()]
}
