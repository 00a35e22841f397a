// PostgREST-compatible HTTP store (hosted Postgres REST endpoint)

use super::{schema, value_text, Filter, Row, ScheduleStore};
use crate::config::StoreConfig;
use crate::errors::StoreError;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Rows fetched per select request
const PAGE_SIZE: usize = 1000;

pub struct RestStore {
    client: Client,
    base_url: String,
    api_key: String,
}

impl RestStore {
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.connect_timeout_seconds))
            .build()
            .map_err(|e| {
                StoreError::ConnectionFailed(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().unwrap_or_default(),
        })
    }

    fn table_url(&self, table: &str) -> Result<String, StoreError> {
        if schema::table(table).is_none() {
            return Err(StoreError::UnknownTable(table.to_string()));
        }
        Ok(format!("{}/rest/v1/{}", self.base_url, table))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn read_rows(table: &str, response: Response) -> Result<Vec<Row>, StoreError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(table, status, body));
        }

        let body: Value = response.json().await?;
        match body {
            Value::Array(items) => Ok(items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(row) => Some(row),
                    _ => None,
                })
                .collect()),
            other => Err(StoreError::InvalidResponse(format!(
                "expected a JSON array from {}, got {}",
                table, other
            ))),
        }
    }
}

/// Query parameters for a filter set, in PostgREST operator syntax
pub fn filter_params(filters: &[Filter]) -> Vec<(String, String)> {
    filters
        .iter()
        .map(|filter| match filter {
            Filter::Eq(column, value) => (column.clone(), format!("eq.{}", value_text(value))),
            Filter::In(column, values) => {
                let quoted: Vec<String> = values.iter().map(|v| quote(&value_text(v))).collect();
                (column.clone(), format!("in.({})", quoted.join(",")))
            }
        })
        .collect()
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn status_error(table: &str, status: StatusCode, body: String) -> StoreError {
    let auth_failure = status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN;
    if status.is_client_error() && !auth_failure {
        StoreError::Rejected {
            table: table.to_string(),
            reason: format!("{}: {}", status, body),
        }
    } else {
        StoreError::RequestFailed(format!("{} responded {}: {}", table, status, body))
    }
}

#[async_trait]
impl ScheduleStore for RestStore {
    #[instrument(skip(self, filters), fields(filters = filters.len()))]
    async fn select(
        &self,
        table: &str,
        columns: &[&str],
        filters: &[Filter],
    ) -> Result<Vec<Row>, StoreError> {
        let url = self.table_url(table)?;
        let select = if columns.is_empty() {
            "*".to_string()
        } else {
            columns.join(",")
        };
        let order = schema::table(table)
            .map(|t| t.order_column())
            .unwrap_or("id");

        let mut rows = Vec::new();
        let mut offset = 0;
        loop {
            let mut params = vec![
                ("select".to_string(), select.clone()),
                ("order".to_string(), format!("{}.asc", order)),
                ("limit".to_string(), PAGE_SIZE.to_string()),
                ("offset".to_string(), offset.to_string()),
            ];
            params.extend(filter_params(filters));

            let response = self
                .authorize(self.client.get(&url))
                .query(&params)
                .send()
                .await?;
            let page = Self::read_rows(table, response).await?;
            let fetched = page.len();
            rows.extend(page);

            if fetched < PAGE_SIZE {
                break;
            }
            offset += fetched;
        }

        debug!(table = table, rows = rows.len(), "Select completed");
        Ok(rows)
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.table_url(table)?;
        let response = self
            .authorize(self.client.post(&url))
            .header("Prefer", "return=representation")
            .json(&rows)
            .send()
            .await?;
        Self::read_rows(table, response).await
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn upsert(
        &self,
        table: &str,
        rows: Vec<Row>,
        conflict_keys: &[&str],
    ) -> Result<Vec<Row>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.table_url(table)?;
        let response = self
            .authorize(self.client.post(&url))
            .query(&[("on_conflict", conflict_keys.join(","))])
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(&rows)
            .send()
            .await?;

        let stored = Self::read_rows(table, response).await;
        if let Err(e) = &stored {
            warn!(table = table, error = %e, "Upsert rejected by store");
        }
        stored
    }

    #[instrument(skip(self, row, filters))]
    async fn update(&self, table: &str, row: Row, filters: &[Filter]) -> Result<u64, StoreError> {
        let url = self.table_url(table)?;
        let response = self
            .authorize(self.client.patch(&url))
            .query(&filter_params(filters))
            .header("Prefer", "return=representation")
            .json(&row)
            .send()
            .await?;
        let updated = Self::read_rows(table, response).await?;
        Ok(updated.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreBackend;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(url: &str) -> StoreConfig {
        StoreConfig {
            backend: StoreBackend::Rest,
            url: url.to_string(),
            api_key: Some("service-key".to_string()),
            max_connections: 1,
            min_connections: 1,
            connect_timeout_seconds: 5,
            run_migrations: false,
        }
    }

    #[test]
    fn test_filter_params_syntax() {
        let params = filter_params(&[
            Filter::eq("natural_key", "12"),
            Filter::in_list("reconciliation_key", vec![json!("uid:a"), json!("h:\"b\"")]),
        ]);
        assert_eq!(params[0], ("natural_key".to_string(), "eq.12".to_string()));
        assert_eq!(
            params[1],
            (
                "reconciliation_key".to_string(),
                r#"in.("uid:a","h:\"b\"")"#.to_string()
            )
        );
    }

    #[tokio::test]
    async fn test_upsert_sends_conflict_target_and_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/groups"))
            .and(query_param("on_conflict", "natural_key"))
            .and(header("apikey", "service-key"))
            .and(header("Authorization", "Bearer service-key"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!([
                {"id": "0b6f8a5e-8f5c-4c1e-9a57-1e2c3d4f5a6b", "natural_key": "7"}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let store = RestStore::new(&config(&server.uri())).unwrap();
        let row = json!({"natural_key": "7", "display_name": "21INF-SP"})
            .as_object()
            .cloned()
            .unwrap();
        let stored = store.upsert("groups", vec![row], &["natural_key"]).await.unwrap();

        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0]["natural_key"], "7");
    }

    #[tokio::test]
    async fn test_validation_failure_maps_to_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/class_sessions"))
            .respond_with(ResponseTemplate::new(400).set_body_string("value too long"))
            .mount(&server)
            .await;

        let store = RestStore::new(&config(&server.uri())).unwrap();
        let row = json!({"reconciliation_key": "uid:x"}).as_object().cloned().unwrap();
        let result = store
            .upsert("class_sessions", vec![row], &["reconciliation_key"])
            .await;

        assert!(matches!(result, Err(StoreError::Rejected { .. })));
    }

    #[tokio::test]
    async fn test_select_pages_until_short_page() {
        let server = MockServer::start().await;
        let full_page: Vec<Value> = (0..PAGE_SIZE)
            .map(|i| json!({"id": format!("id-{}", i), "natural_key": i.to_string()}))
            .collect();

        Mock::given(method("GET"))
            .and(path("/rest/v1/instructors"))
            .and(query_param("offset", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(Value::Array(full_page)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/instructors"))
            .and(query_param("offset", PAGE_SIZE.to_string()))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{"id": "last", "natural_key": "x"}])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let store = RestStore::new(&config(&server.uri())).unwrap();
        let rows = store
            .select("instructors", &["id", "natural_key"], &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), PAGE_SIZE + 1);
    }

    #[tokio::test]
    async fn test_unknown_table_is_refused_locally() {
        let store = RestStore::new(&config("http://localhost:1")).unwrap();
        let result = store.select("users", &[], &[]).await;
        assert!(matches!(result, Err(StoreError::UnknownTable(_))));
    }
}
