// Table-oriented persistence API used by the identity cache and batch writer

pub mod memory;
pub mod postgres;
pub mod rest;
pub mod schema;

use crate::config::{StoreBackend, StoreConfig};
use crate::errors::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use rest::RestStore;

/// One table row as column → JSON value
pub type Row = serde_json::Map<String, Value>;

/// Row filter understood by every backend
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    In(String, Vec<Value>),
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(column.into(), value.into())
    }

    pub fn in_list(column: impl Into<String>, values: Vec<Value>) -> Self {
        Filter::In(column.into(), values)
    }

    pub fn column(&self) -> &str {
        match self {
            Filter::Eq(column, _) | Filter::In(column, _) => column,
        }
    }

    /// Evaluate the filter against an in-memory row
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::Eq(column, value) => row
                .get(column)
                .map(|v| value_text(v) == value_text(value))
                .unwrap_or(false),
            Filter::In(column, values) => row
                .get(column)
                .map(|v| {
                    let text = value_text(v);
                    values.iter().any(|candidate| value_text(candidate) == text)
                })
                .unwrap_or(false),
        }
    }
}

/// Text form of a value as the store compares it
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Persistence store operations
///
/// Writes return the stored rows, including store-assigned ids.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn select(
        &self,
        table: &str,
        columns: &[&str],
        filters: &[Filter],
    ) -> Result<Vec<Row>, StoreError>;

    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, StoreError>;

    async fn upsert(
        &self,
        table: &str,
        rows: Vec<Row>,
        conflict_keys: &[&str],
    ) -> Result<Vec<Row>, StoreError>;

    /// Returns the number of rows updated
    async fn update(&self, table: &str, row: Row, filters: &[Filter]) -> Result<u64, StoreError>;
}

/// Build the configured store backend
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn ScheduleStore>, StoreError> {
    let store: Arc<dyn ScheduleStore> = match config.backend {
        StoreBackend::Rest => Arc::new(RestStore::new(config)?),
        StoreBackend::Postgres => Arc::new(PgStore::connect(config).await?),
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    };
    Ok(store)
}
