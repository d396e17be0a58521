use reqwest::Url;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde_json::Value;

use super::{NetworkClient, endpoint};
use crate::error::{Result, SyncError};

/// A select/filter/order/limit query against the managed backend's REST
/// interface (`/rest/v1/<table>?select=..&col=eq.val&order=col.desc&limit=n`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableQuery {
    table: String,
    columns: Vec<String>,
    filters: Vec<(String, String)>,
    order: Option<(String, bool)>,
    limit: Option<usize>,
}

impl TableQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl ToString) -> Self {
        self.filters.push((column.into(), value.to_string()));
        self
    }

    pub fn order(mut self, column: impl Into<String>, descending: bool) -> Self {
        self.order = Some((column.into(), descending));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Render onto the backend base URL.
    pub fn url(&self, base: &str) -> Result<Url> {
        let mut url = endpoint(base, &["rest", "v1", &self.table])?;
        {
            let mut query = url.query_pairs_mut();
            let select = if self.columns.is_empty() {
                "*".to_owned()
            } else {
                self.columns.join(",")
            };
            query.append_pair("select", &select);
            for (column, value) in &self.filters {
                query.append_pair(column, &format!("eq.{value}"));
            }
            if let Some((column, descending)) = &self.order {
                let direction = if *descending { "desc" } else { "asc" };
                query.append_pair("order", &format!("{column}.{direction}"));
            }
            if let Some(limit) = self.limit {
                query.append_pair("limit", &limit.to_string());
            }
        }
        Ok(url)
    }

    /// The filter part only, for updates that target the same rows.
    fn filter_url(&self, base: &str) -> Result<Url> {
        let mut url = endpoint(base, &["rest", "v1", &self.table])?;
        {
            let mut query = url.query_pairs_mut();
            for (column, value) in &self.filters {
                query.append_pair(column, &format!("eq.{value}"));
            }
        }
        Ok(url)
    }
}

/// Authenticated access to the managed backend's tables.
#[derive(Clone)]
pub struct BackendClient {
    net: NetworkClient,
    base_url: String,
    api_key: String,
}

impl BackendClient {
    pub fn new(net: NetworkClient, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            net,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if self.api_key.is_empty() {
            return Ok(headers);
        }
        let key = HeaderValue::from_str(&self.api_key)
            .map_err(|_| SyncError::Config("backend key is not a valid header value".into()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|_| SyncError::Config("backend key is not a valid header value".into()))?;
        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);
        Ok(headers)
    }

    /// Run a select and return its rows.
    pub async fn select(&self, query: &TableQuery) -> Result<Vec<Value>> {
        let url = query.url(&self.base_url)?;
        match self.net.get_json(url, self.headers()?).await? {
            Value::Array(rows) => Ok(rows),
            other => Err(SyncError::transient(format!(
                "table {} returned {} instead of rows",
                query.table(),
                json_kind(&other)
            ))),
        }
    }

    /// PATCH the rows matched by the query's filters.
    pub async fn update(&self, query: &TableQuery, body: &Value) -> Result<()> {
        let url = query.filter_url(&self.base_url)?;
        self.net.patch_json(url, self.headers()?, body).await
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
