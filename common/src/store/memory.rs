// In-process store for dry runs and tests

use super::{schema, Filter, Row, ScheduleStore};
use crate::errors::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use tracing::debug;
use uuid::Uuid;

type RejectRule = Box<dyn Fn(&Row) -> bool + Send + Sync>;

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, Vec<Row>>,
    write_calls: HashMap<String, usize>,
    reject_rules: HashMap<String, RejectRule>,
    unavailable: bool,
}

/// Store that keeps rows in memory
///
/// Writes are all-or-nothing per call, like a single SQL statement: one
/// rejected row fails the whole call.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put rows into a table without validation
    pub fn seed(&self, table: &str, rows: Vec<Value>) {
        let mut state = self.lock();
        let target = state.tables.entry(table.to_string()).or_default();
        target.extend(rows.into_iter().filter_map(|v| v.as_object().cloned()));
    }

    /// Reject every write to `table` that contains a row matching `rule`
    pub fn reject_when<F>(&self, table: &str, rule: F)
    where
        F: Fn(&Row) -> bool + Send + Sync + 'static,
    {
        self.lock()
            .reject_rules
            .insert(table.to_string(), Box::new(rule));
    }

    /// Make every operation fail as if the store were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    pub fn count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map(Vec::len).unwrap_or(0)
    }

    /// Number of insert/upsert calls issued against a table
    pub fn write_calls(&self, table: &str) -> usize {
        self.lock().write_calls.get(table).copied().unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(state: &MemoryState) -> Result<(), StoreError> {
        if state.unavailable {
            return Err(StoreError::ConnectionFailed(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn check_rows(state: &MemoryState, table: &str, rows: &[Row]) -> Result<(), StoreError> {
        if let Some(rule) = state.reject_rules.get(table) {
            if let Some(position) = rows.iter().position(|row| rule(row)) {
                return Err(StoreError::Rejected {
                    table: table.to_string(),
                    reason: format!("row {} failed validation", position),
                });
            }
        }
        Ok(())
    }

    fn with_id(table: &str, mut row: Row) -> Row {
        let has_id = schema::table(table).map(|t| t.has_id).unwrap_or(false);
        if has_id && !row.contains_key("id") {
            row.insert("id".to_string(), Value::String(Uuid::new_v4().to_string()));
        }
        row
    }
}

fn conflict_signature(row: &Row, conflict_keys: &[&str]) -> Vec<String> {
    conflict_keys
        .iter()
        .map(|key| row.get(*key).map(super::value_text).unwrap_or_default())
        .collect()
}

fn project(row: &Row, columns: &[&str]) -> Row {
    if columns.is_empty() || columns.contains(&"*") {
        return row.clone();
    }
    columns
        .iter()
        .filter_map(|column| row.get(*column).map(|v| (column.to_string(), v.clone())))
        .collect()
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn select(
        &self,
        table: &str,
        columns: &[&str],
        filters: &[Filter],
    ) -> Result<Vec<Row>, StoreError> {
        let state = self.lock();
        Self::check_available(&state)?;

        let rows = state
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| filters.iter().all(|f| f.matches(row)))
                    .map(|row| project(row, columns))
                    .collect()
            })
            .unwrap_or_default();
        Ok(rows)
    }

    async fn insert(&self, table: &str, rows: Vec<Row>) -> Result<Vec<Row>, StoreError> {
        let mut state = self.lock();
        Self::check_available(&state)?;
        *state.write_calls.entry(table.to_string()).or_default() += 1;
        Self::check_rows(&state, table, &rows)?;

        let stored: Vec<Row> = rows
            .into_iter()
            .map(|row| Self::with_id(table, row))
            .collect();
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(stored.iter().cloned());
        Ok(stored)
    }

    async fn upsert(
        &self,
        table: &str,
        rows: Vec<Row>,
        conflict_keys: &[&str],
    ) -> Result<Vec<Row>, StoreError> {
        let mut state = self.lock();
        Self::check_available(&state)?;
        *state.write_calls.entry(table.to_string()).or_default() += 1;
        Self::check_rows(&state, table, &rows)?;

        let mut seen = HashSet::new();
        for row in &rows {
            if !seen.insert(conflict_signature(row, conflict_keys)) {
                return Err(StoreError::Rejected {
                    table: table.to_string(),
                    reason: "duplicate conflict key within one upsert".to_string(),
                });
            }
        }

        let existing = state.tables.entry(table.to_string()).or_default();
        let mut stored = Vec::with_capacity(rows.len());
        for row in rows {
            let signature = conflict_signature(&row, conflict_keys);
            match existing
                .iter_mut()
                .find(|current| conflict_signature(current, conflict_keys) == signature)
            {
                Some(current) => {
                    for (column, value) in row {
                        if column != "id" {
                            current.insert(column, value);
                        }
                    }
                    stored.push(current.clone());
                }
                None => {
                    let row = Self::with_id(table, row);
                    existing.push(row.clone());
                    stored.push(row);
                }
            }
        }

        debug!(table = table, rows = stored.len(), "Memory upsert applied");
        Ok(stored)
    }

    async fn update(&self, table: &str, row: Row, filters: &[Filter]) -> Result<u64, StoreError> {
        let mut state = self.lock();
        Self::check_available(&state)?;
        Self::check_rows(&state, table, std::slice::from_ref(&row))?;

        let mut updated = 0;
        if let Some(rows) = state.tables.get_mut(table) {
            for current in rows
                .iter_mut()
                .filter(|current| filters.iter().all(|f| f.matches(current)))
            {
                for (column, value) in &row {
                    current.insert(column.clone(), value.clone());
                }
                updated += 1;
            }
        }
        Ok(updated)
    }
}
