// Direct PostgreSQL store over a sqlx connection pool

use super::{schema, value_text, Filter, Row, ScheduleStore};
use crate::config::StoreConfig;
use crate::errors::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row as _;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{info, instrument};

/// Store backed by a PostgreSQL connection pool
///
/// Identifiers are checked against the known schema before they are
/// interpolated; values always travel as bind parameters.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create the connection pool
    #[instrument(skip(config), fields(max_connections = config.max_connections))]
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        info!("Initializing database connection pool");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .connect(&config.url)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to create database pool");
                StoreError::ConnectionFailed(e.to_string())
            })?;

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Database connection pool initialized"
        );

        let store = Self { pool };
        if config.run_migrations {
            store.migrate().await?;
        }
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    #[instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("Migration failed: {}", e)))?;
        info!("Database migrations applied");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(|e| {
            tracing::error!(error = %e, "Database health check failed");
            StoreError::ConnectionFailed(e.to_string())
        })?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn close(&self) {
        info!("Closing database connection pool");
        self.pool.close().await;
    }
}

fn known_table(table: &str) -> Result<&'static schema::Table, StoreError> {
    schema::table(table).ok_or_else(|| StoreError::UnknownTable(table.to_string()))
}

fn quoted_column(table: &schema::Table, column: &str) -> Result<String, StoreError> {
    if table.has_column(column) {
        Ok(format!("\"{}\"", column))
    } else {
        Err(StoreError::QueryFailed(format!(
            "Unknown column {}.{}",
            table.name, column
        )))
    }
}

/// Columns present in any of the rows, in a stable order
fn row_columns(table: &schema::Table, rows: &[Row]) -> Result<Vec<String>, StoreError> {
    let names: BTreeSet<&str> = rows.iter().flat_map(|r| r.keys().map(String::as_str)).collect();
    names
        .into_iter()
        .map(|name| quoted_column(table, name))
        .collect()
}

/// WHERE clause comparing text forms; bind parameters start at `first_param`
fn where_clause(
    table: &schema::Table,
    filters: &[Filter],
    first_param: usize,
) -> Result<(String, Vec<FilterBind>), StoreError> {
    if filters.is_empty() {
        return Ok((String::new(), Vec::new()));
    }

    let mut clauses = Vec::with_capacity(filters.len());
    let mut binds = Vec::with_capacity(filters.len());
    for (offset, filter) in filters.iter().enumerate() {
        let column = quoted_column(table, filter.column())?;
        let param = first_param + offset;
        match filter {
            Filter::Eq(_, value) => {
                clauses.push(format!("{}::text = ${}", column, param));
                binds.push(FilterBind::One(value_text(value)));
            }
            Filter::In(_, values) => {
                clauses.push(format!("{}::text = ANY(${})", column, param));
                binds.push(FilterBind::Many(values.iter().map(value_text).collect()));
            }
        }
    }
    Ok((format!(" WHERE {}", clauses.join(" AND ")), binds))
}

enum FilterBind {
    One(String),
    Many(Vec<String>),
}

fn bind_filters<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    binds: Vec<FilterBind>,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    for bind in binds {
        query = match bind {
            FilterBind::One(value) => query.bind(value),
            FilterBind::Many(values) => query.bind(values),
        };
    }
    query
}

fn json_rows(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<Row>, StoreError> {
    rows.into_iter()
        .map(|row| {
            let value: Value = row.try_get(0)?;
            match value {
                Value::Object(map) => Ok(map),
                other => Err(StoreError::InvalidResponse(format!(
                    "expected a JSON object row, got {}",
                    other
                ))),
            }
        })
        .collect()
}

#[async_trait]
impl ScheduleStore for PgStore {
    #[instrument(skip(self, filters), fields(filters = filters.len()))]
    async fn select(
        &self,
        table: &str,
        columns: &[&str],
        filters: &[Filter],
    ) -> Result<Vec<Row>, StoreError> {
        let table = known_table(table)?;
        let projection = if columns.is_empty() {
            "*".to_string()
        } else {
            columns
                .iter()
                .map(|c| quoted_column(table, c))
                .collect::<Result<Vec<_>, _>>()?
                .join(", ")
        };
        let (where_sql, binds) = where_clause(table, filters, 1)?;

        let sql = format!(
            "SELECT to_jsonb(t) FROM (SELECT {} FROM {}{}) t",
            projection, table.name, where_sql
        );
        let rows = bind_filters(sqlx::query(&sql), binds)
            .fetch_all(&self.pool)
            .await?;
        json_rows(rows)
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let table = known_table(table)?;
        let columns = row_columns(table, &rows)?.join(", ");

        let sql = format!(
            "INSERT INTO {name} ({cols}) \
             SELECT {cols} FROM jsonb_populate_recordset(NULL::{name}, $1) \
             RETURNING to_jsonb({name})",
            name = table.name,
            cols = columns
        );
        let payload = Value::Array(rows.into_iter().map(Value::Object).collect());
        let stored = sqlx::query(&sql).bind(payload).fetch_all(&self.pool).await?;
        json_rows(stored)
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
        let table = known_table(table)?;
        let columns = row_columns(table, &rows)?;
        let keys = conflict_keys
            .iter()
            .map(|k| quoted_column(table, k))
            .collect::<Result<Vec<_>, _>>()?;

        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !keys.contains(*c) && c.as_str() != "\"id\"")
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect();
        // Junction rows have nothing to update; touch a key so RETURNING still yields them
        let action = if updates.is_empty() {
            format!("UPDATE SET {k} = EXCLUDED.{k}", k = keys[0])
        } else {
            format!("UPDATE SET {}", updates.join(", "))
        };

        let sql = format!(
            "INSERT INTO {name} ({cols}) \
             SELECT {cols} FROM jsonb_populate_recordset(NULL::{name}, $1) \
             ON CONFLICT ({keys}) DO {action} \
             RETURNING to_jsonb({name})",
            name = table.name,
            cols = columns.join(", "),
            keys = keys.join(", "),
            action = action
        );
        let payload = Value::Array(rows.into_iter().map(Value::Object).collect());
        let stored = sqlx::query(&sql).bind(payload).fetch_all(&self.pool).await?;
        json_rows(stored)
    }

    #[instrument(skip(self, row, filters))]
    async fn update(&self, table: &str, row: Row, filters: &[Filter]) -> Result<u64, StoreError> {
        let table = known_table(table)?;
        let columns = row_columns(table, std::slice::from_ref(&row))?;
        if columns.is_empty() {
            return Ok(0);
        }
        let (where_sql, binds) = where_clause(table, filters, 2)?;

        let sql = format!(
            "UPDATE {name} SET ({cols}) = (SELECT {cols} FROM jsonb_populate_record(NULL::{name}, $1)){filter}",
            name = table.name,
            cols = columns.join(", "),
            filter = where_sql
        );
        let query = sqlx::query(&sql).bind(Value::Object(row));
        let result = bind_filters(query, binds).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
