//! HTTP data source speaking PostgREST query conventions.
//!
//! Tables live under `{base_url}/rest/v1/{table}`, filters are encoded as
//! `column=op.value` query parameters, the row range travels in the `Range`
//! header and an exact count is requested with `Prefer: count=exact` and read
//! back from `Content-Range`.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_RANGE};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info, instrument};

use reqflow_core::{value_key, DataSource, Filter, QueryResult, ReqflowError, Result, Row, SelectQuery};

use crate::config::env_secs;

/// Connection settings for [`RestDataSource`]
#[derive(Debug, Clone)]
pub struct RestConfig {
    pub base_url: String,

    /// Sent as `apikey` and as a bearer token
    pub api_key: Option<String>,

    pub timeout: Duration,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:54321".to_string(),
            api_key: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl RestConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("REQFLOW_REST_URL") {
            config.base_url = url;
        }
        config.api_key = std::env::var("REQFLOW_REST_KEY").ok();
        if let Some(timeout) = env_secs("REQFLOW_REST_TIMEOUT_SECS") {
            config.timeout = timeout;
        }

        config
    }
}

/// [`DataSource`] backed by a PostgREST-compatible HTTP API
#[derive(Clone)]
pub struct RestDataSource {
    client: Client,
    base_url: String,
}

impl RestDataSource {
    pub fn new(config: RestConfig) -> Result<Self> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        info!(url = %base_url, "Creating REST data source");

        let mut headers = HeaderMap::new();
        if let Some(key) = &config.api_key {
            let apikey = HeaderValue::from_str(key)
                .map_err(|e| ReqflowError::invalid(format!("invalid api key: {}", e)))?;
            let bearer = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| ReqflowError::invalid(format!("invalid api key: {}", e)))?;
            headers.insert("apikey", apikey);
            headers.insert(AUTHORIZATION, bearer);
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| ReqflowError::internal(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await.map_err(|e| {
            error!(error = %e, "Request to data service failed");
            ReqflowError::backend(e.to_string())
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Data service returned error");
            return Err(ReqflowError::backend(format!("status {}: {}", status, body)));
        }
        Ok(response)
    }
}

#[async_trait]
impl DataSource for RestDataSource {
    #[instrument(skip(self, query), fields(table = %query.table, filters = query.filters.len()))]
    async fn select(&self, query: &SelectQuery) -> Result<QueryResult> {
        let mut builder = self
            .client
            .get(self.table_url(&query.table))
            .query(&select_params(query));

        if let Some((from, to)) = query.range {
            builder = builder
                .header("Range-Unit", "items")
                .header("Range", format!("{}-{}", from, to));
        }
        if query.count {
            builder = builder.header("Prefer", "count=exact");
        }

        let response = self.send(builder).await?;
        let count = if query.count {
            response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range)
        } else {
            None
        };

        let rows: Vec<Row> = response
            .json()
            .await
            .map_err(|e| ReqflowError::backend(format!("invalid response body: {}", e)))?;
        debug!(rows = rows.len(), count = ?count, "Select complete");

        Ok(QueryResult { rows, count })
    }

    #[instrument(skip(self, filters), fields(filters = filters.len()))]
    async fn count(&self, table: &str, filters: &[Filter]) -> Result<u64> {
        let mut params = vec![("select".to_string(), "id".to_string())];
        params.extend(filters.iter().map(filter_param));

        let builder = self
            .client
            .head(self.table_url(table))
            .query(&params)
            .header("Prefer", "count=exact");

        let response = self.send(builder).await?;
        response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range)
            .ok_or_else(|| ReqflowError::backend("response carried no count"))
    }

    #[instrument(skip(self, args))]
    async fn rpc(&self, function: &str, args: &Value) -> Result<Value> {
        let url = format!("{}/rest/v1/rpc/{}", self.base_url, function);
        let response = self.send(self.client.post(&url).json(args)).await?;

        response
            .json()
            .await
            .map_err(|e| ReqflowError::backend(format!("invalid response body: {}", e)))
    }
}

/// Query string of a select
fn select_params(query: &SelectQuery) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), query.columns.clone())];
    params.extend(query.filters.iter().map(filter_param));

    if let Some(order) = &query.order {
        let direction = if order.ascending { "asc" } else { "desc" };
        params.push(("order".to_string(), format!("{}.{}", order.column, direction)));
    }
    params
}

/// `column=op.value` parameter of one filter
fn filter_param(filter: &Filter) -> (String, String) {
    let column = filter.column().to_string();
    let value = match filter {
        Filter::Eq { value, .. } => format!("eq.{}", value_key(value)),
        Filter::Gte { value, .. } => format!("gte.{}", value_key(value)),
        Filter::Lte { value, .. } => format!("lte.{}", value_key(value)),
        Filter::ILike { pattern, .. } => format!("ilike.{}", pattern),
        Filter::In { values, .. } => {
            let items: Vec<String> = values.iter().map(list_item).collect();
            format!("in.({})", items.join(","))
        }
    };
    (column, value)
}

/// Quote list items that would break the `in.(...)` syntax
fn list_item(value: &Value) -> String {
    let raw = value_key(value);
    if raw.contains([',', '(', ')', '"']) {
        format!("\"{}\"", raw.replace('"', "\\\""))
    } else {
        raw
    }
}

/// Total from a `Content-Range` header such as `0-24/3573` or `*/0`
fn parse_content_range(header: &str) -> Option<u64> {
    header.rsplit_once('/')?.1.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_base_url_is_normalized() {
        let source = RestDataSource::new(RestConfig {
            base_url: "http://localhost:54321/".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(source.base_url(), "http://localhost:54321");
        assert_eq!(source.table_url("orders"), "http://localhost:54321/rest/v1/orders");
    }

    #[test]
    fn test_filter_params() {
        assert_eq!(filter_param(&Filter::eq("status", "paid")), ("status".into(), "eq.paid".into()));
        assert_eq!(filter_param(&Filter::gte("total", 100)), ("total".into(), "gte.100".into()));
        assert_eq!(filter_param(&Filter::lte("total", 2.5)), ("total".into(), "lte.2.5".into()));
        assert_eq!(
            filter_param(&Filter::ilike("name", "%widget%")),
            ("name".into(), "ilike.%widget%".into())
        );
        assert_eq!(
            filter_param(&Filter::in_list("id", vec![json!(1), json!("a,b"), json!(3)])),
            ("id".into(), "in.(1,\"a,b\",3)".into())
        );
    }

    #[test]
    fn test_select_params() {
        let query = SelectQuery::new("orders")
            .columns("id,total")
            .filter(Filter::eq("status", "open"))
            .order("total", false);

        assert_eq!(
            select_params(&query),
            vec![
                ("select".to_string(), "id,total".to_string()),
                ("status".to_string(), "eq.open".to_string()),
                ("order".to_string(), "total.desc".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("0-24/3573"), Some(3573));
        assert_eq!(parse_content_range("*/0"), Some(0));
        assert_eq!(parse_content_range("0-24/*"), None);
        assert_eq!(parse_content_range("garbage"), None);
    }

    #[test]
    fn test_invalid_api_key_is_rejected() {
        let result = RestDataSource::new(RestConfig {
            api_key: Some("bad\nkey".to_string()),
            ..Default::default()
        });
        assert!(matches!(result, Err(ReqflowError::InvalidRequest(_))));
    }
}
