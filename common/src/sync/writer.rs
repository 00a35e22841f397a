// Reconciliation and batch writes of entities, sessions and junction links

use crate::errors::{StoreError, SyncIssue};
use crate::identity::IdentityCache;
use crate::models::{
    ClassSession, Entity, EntityKind, EntityRef, NaturalKey, PersistedId, RawCalendarDocument,
    SessionLink,
};
use crate::store::{schema, value_text, Filter, Row, ScheduleStore};
use crate::sync::SyncSummary;
use crate::telemetry;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Keys per re-select request; bounded by URL length on the REST backend
const LOOKUP_CHUNK: usize = 200;

/// Foreign keys that stay fixed once a feed resolved them
const RESOLVED_COLUMNS: [&str; 2] = ["group_id", "instructor_id"];

/// Columns describing a session as its group feed publishes it
const GROUP_VIEW_COLUMNS: [&str; 4] = ["subgroup", "counterpart", "source_kind", "source_key"];

/// Junction link whose target had no persisted id when it was written
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingLink {
    pub session_id: PersistedId,
    pub link: SessionLink,
}

#[derive(Debug, Default)]
pub struct EntityWriteReport {
    pub written: usize,
    pub conflicts: Vec<SyncIssue>,
    pub truncations: usize,
}

#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Sessions handed in, before dedup
    pub received: usize,
    /// Later duplicates folded into an earlier session
    pub merged: usize,
    /// Session rows the store acknowledged
    pub written: usize,
    pub links_written: usize,
    pub conflicts: Vec<SyncIssue>,
    pub truncations: usize,
    pub deferred: Vec<PendingLink>,
}

#[derive(Debug, Default)]
pub struct DeferredReport {
    pub written: usize,
    pub remaining: Vec<PendingLink>,
    pub conflicts: Vec<SyncIssue>,
}

/// Row to write plus the key it is reported under
struct KeyedRow {
    key: String,
    row: Row,
}

/// Single writer for everything the pipeline persists
pub struct BatchWriter {
    store: Arc<dyn ScheduleStore>,
    chunk_size: usize,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn ScheduleStore>, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Upsert seed entities keyed by natural key, then learn their ids
    #[instrument(skip(self, entities, cache), fields(count = entities.len()))]
    pub async fn write_entities(
        &self,
        kind: EntityKind,
        entities: &[Entity],
        cache: &IdentityCache,
    ) -> EntityWriteReport {
        let mut report = EntityWriteReport::default();
        let table = kind.table();

        let rows: Vec<KeyedRow> = entities
            .iter()
            .map(|entity| {
                let mut row = entity_row(entity);
                report.truncations += truncate_row(table, entity.natural_key.as_str(), &mut row);
                KeyedRow {
                    key: entity.natural_key.as_str().to_string(),
                    row,
                }
            })
            .collect();

        let (stored, conflicts) = self.upsert_salvaging(table, rows, &["natural_key"]).await;
        report.conflicts = conflicts;

        for row in &stored {
            let natural_key = row.get("natural_key").map(value_text).and_then(NaturalKey::new);
            let Some(natural_key) = natural_key else {
                continue;
            };
            let Some(id) = row_id(row) else {
                warn!(kind = %kind, natural_key = %natural_key, "Store returned entity row without id");
                continue;
            };
            for &column in schema::alias_columns(kind) {
                if let Some(alias) = row.get(column).and_then(Value::as_str) {
                    cache.learn_alias(kind, alias, &natural_key);
                }
            }
            cache.learn(kind, natural_key, id);
            report.written += 1;
        }

        info!(
            kind = %kind,
            written = report.written,
            conflicts = report.conflicts.len(),
            "Entity seed rows written"
        );
        report
    }

    /// Persist one batch of sessions and their junction links
    #[instrument(skip(self, sessions, cache), fields(sessions = sessions.len()))]
    pub async fn reconcile(
        &self,
        sessions: Vec<ClassSession>,
        cache: &IdentityCache,
    ) -> ReconcileReport {
        let mut report = ReconcileReport {
            received: sessions.len(),
            ..ReconcileReport::default()
        };

        let unique = dedup_sessions(sessions);
        report.merged = report.received - unique.len();

        let mut rows = Vec::with_capacity(unique.len());
        for (key, session) in &unique {
            let mut row = session_row(key, session, cache);
            report.truncations += truncate_row(schema::CLASS_SESSIONS, key, &mut row);
            rows.push(KeyedRow {
                key: key.clone(),
                row,
            });
        }
        self.carry_forward(&mut rows).await;

        let (stored, conflicts) = self
            .upsert_salvaging(schema::CLASS_SESSIONS, rows, &[schema::RECONCILIATION_KEY])
            .await;
        report.written = stored.len();
        report.conflicts = conflicts;
        telemetry::record_sessions_written(report.written);

        let written_keys: Vec<String> = stored
            .iter()
            .filter_map(|row| row.get(schema::RECONCILIATION_KEY).map(value_text))
            .collect();
        let session_ids = match self.lookup_session_ids(&written_keys).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Session id lookup failed; using ids returned by the upsert");
                stored
                    .iter()
                    .filter_map(|row| {
                        let key = row.get(schema::RECONCILIATION_KEY).map(value_text)?;
                        Some((key, row_id(row)?))
                    })
                    .collect()
            }
        };

        let mut pending = Vec::new();
        for (key, session) in &unique {
            let Some(session_id) = session_ids.get(key) else {
                continue;
            };
            for link in &session.links {
                pending.push(PendingLink {
                    session_id: *session_id,
                    link: link.clone(),
                });
            }
        }

        let links = self.write_links(pending, cache).await;
        report.links_written = links.written;
        report.conflicts.extend(links.conflicts);
        report.deferred = links.remaining;

        for issue in &report.conflicts {
            if let SyncIssue::WriteConflict { table, .. } = issue {
                let table = schema::table(table).map(|t| t.name).unwrap_or("unknown");
                telemetry::record_write_conflicts(table, 1);
            }
        }

        info!(
            received = report.received,
            merged = report.merged,
            written = report.written,
            links_written = report.links_written,
            conflicts = report.conflicts.len(),
            truncations = report.truncations,
            deferred = report.deferred.len(),
            "Batch reconciled"
        );
        report
    }

    /// Later pass over links whose counterpart was unknown at first write
    #[instrument(skip(self, links, cache), fields(links = links.len()))]
    pub async fn retry_deferred(
        &self,
        links: Vec<PendingLink>,
        cache: &IdentityCache,
    ) -> DeferredReport {
        let unique: Vec<PendingLink> = links
            .into_iter()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let report = self.write_links(unique, cache).await;

        for link in &report.remaining {
            debug!(
                session_id = %link.session_id,
                kind = %link.link.kind,
                target = ?link.link.target,
                "Junction link target still unknown"
            );
        }
        info!(
            written = report.written,
            remaining = report.remaining.len(),
            "Deferred junction links processed"
        );
        telemetry::set_deferred_links(report.remaining.len());
        report
    }

    /// Record where each fetched calendar was found
    #[instrument(skip(self, documents), fields(documents = documents.len()))]
    pub async fn mark_synced(&self, documents: &[RawCalendarDocument]) -> usize {
        let synced_at = Utc::now().to_rfc3339();
        let mut updated = 0;

        for document in documents {
            let Some(url) = document.source_url.as_deref() else {
                continue;
            };
            let entity = &document.entity;
            let mut row = Row::new();
            row.insert("calendar_url".to_string(), json!(url));
            row.insert("synced_at".to_string(), json!(synced_at));

            match self
                .store
                .update(
                    entity.kind.table(),
                    row,
                    &[Filter::eq("natural_key", entity.natural_key.as_str())],
                )
                .await
            {
                Ok(count) => updated += count as usize,
                Err(e) => warn!(
                    kind = %entity.kind,
                    natural_key = %entity.natural_key,
                    error = %e,
                    "Failed to record calendar source"
                ),
            }
        }
        updated
    }

    /// Append an audit row for the run
    #[instrument(skip(self, summary))]
    pub async fn record_run(&self, summary: &SyncSummary) -> Result<(), StoreError> {
        let row = json!({
            "started_at": summary.started_at.to_rfc3339(),
            "finished_at": summary.finished_at.unwrap_or_else(Utc::now).to_rfc3339(),
            "interrupted": summary.interrupted,
            "entities_fetched": summary.entities_fetched(),
            "sessions_written": summary.sessions_written(),
            "write_conflicts": summary.write_conflicts(),
            "deferred_links": summary.deferred_remaining,
        });
        let Value::Object(row) = row else {
            return Ok(());
        };
        self.store.insert(schema::SYNC_RUNS, vec![row]).await?;
        Ok(())
    }

    /// Chunked upsert; a rejected chunk is retried row by row
    async fn upsert_salvaging(
        &self,
        table: &str,
        rows: Vec<KeyedRow>,
        conflict_keys: &[&str],
    ) -> (Vec<Row>, Vec<SyncIssue>) {
        let mut stored = Vec::with_capacity(rows.len());
        let mut conflicts = Vec::new();

        let mut remaining = rows.into_iter().peekable();
        while remaining.peek().is_some() {
            let chunk: Vec<KeyedRow> = remaining.by_ref().take(self.chunk_size).collect();
            let payload: Vec<Row> = chunk.iter().map(|r| r.row.clone()).collect();

            match self.store.upsert(table, payload, conflict_keys).await {
                Ok(rows) => stored.extend(rows),
                Err(e) => {
                    warn!(
                        table = table,
                        rows = chunk.len(),
                        error = %e,
                        "Chunk rejected, retrying rows individually"
                    );
                    for keyed in chunk {
                        match self.store.upsert(table, vec![keyed.row], conflict_keys).await {
                            Ok(rows) => stored.extend(rows),
                            Err(e) => {
                                warn!(table = table, key = %keyed.key, error = %e, "Row rejected");
                                conflicts.push(SyncIssue::WriteConflict {
                                    table: table.to_string(),
                                    key: keyed.key,
                                    reason: e.to_string(),
                                });
                            }
                        }
                    }
                }
            }
        }

        (stored, conflicts)
    }

    /// Keep what earlier feeds resolved for sessions already in the store
    async fn carry_forward(&self, rows: &mut [KeyedRow]) {
        let keys: Vec<String> = rows.iter().map(|r| r.key.clone()).collect();
        let mut columns = vec![schema::RECONCILIATION_KEY];
        columns.extend(RESOLVED_COLUMNS);
        columns.extend(GROUP_VIEW_COLUMNS);

        let existing = match self.select_sessions(&keys, &columns).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!(error = %e, "Existing session lookup failed; writing rows as extracted");
                return;
            }
        };
        for keyed in rows.iter_mut() {
            if let Some(previous) = existing.get(&keyed.key) {
                merge_previous(&mut keyed.row, previous);
            }
        }
    }

    /// Re-read `reconciliation_key → id` for persisted sessions
    async fn lookup_session_ids(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, PersistedId>, StoreError> {
        let rows = self
            .select_sessions(keys, &["id", schema::RECONCILIATION_KEY])
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(key, row)| Some((key, row_id(&row)?)))
            .collect())
    }

    /// Session rows by reconciliation key, selected in bounded chunks
    async fn select_sessions(
        &self,
        keys: &[String],
        columns: &[&str],
    ) -> Result<HashMap<String, Row>, StoreError> {
        let mut found = HashMap::with_capacity(keys.len());
        for chunk in keys.chunks(LOOKUP_CHUNK.min(self.chunk_size)) {
            let values = chunk.iter().map(|k| json!(k)).collect();
            let rows = self
                .store
                .select(
                    schema::CLASS_SESSIONS,
                    columns,
                    &[Filter::in_list(schema::RECONCILIATION_KEY, values)],
                )
                .await?;
            for row in rows {
                if let Some(key) = row.get(schema::RECONCILIATION_KEY).map(value_text) {
                    found.insert(key, row);
                }
            }
        }
        Ok(found)
    }

    /// Resolve link targets and upsert junction rows; unknown targets are returned
    async fn write_links(&self, links: Vec<PendingLink>, cache: &IdentityCache) -> DeferredReport {
        let mut report = DeferredReport::default();
        let mut by_kind: HashMap<EntityKind, BTreeSet<(PersistedId, PersistedId)>> = HashMap::new();

        for pending in links {
            match cache.resolve_ref(pending.link.kind, &pending.link.target) {
                Some(target_id) => {
                    by_kind
                        .entry(pending.link.kind)
                        .or_default()
                        .insert((pending.session_id, target_id));
                }
                None => report.remaining.push(pending),
            }
        }

        for kind in EntityKind::ALL {
            let Some(pairs) = by_kind.remove(&kind) else {
                continue;
            };
            let rows: Vec<KeyedRow> = pairs
                .into_iter()
                .map(|(session_id, target_id)| {
                    let mut row = Row::new();
                    row.insert("session_id".to_string(), json!(session_id.0.to_string()));
                    row.insert(kind.id_column().to_string(), json!(target_id.0.to_string()));
                    KeyedRow {
                        key: format!("{}/{}", session_id, target_id),
                        row,
                    }
                })
                .collect();

            let keys = schema::link_conflict_keys(kind);
            let (stored, conflicts) = self.upsert_salvaging(kind.link_table(), rows, &keys).await;
            report.written += stored.len();
            report.conflicts.extend(conflicts);
        }

        report
    }
}

fn row_id(row: &Row) -> Option<PersistedId> {
    row.get("id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .map(PersistedId)
}

fn opt_text(value: Option<&str>) -> Value {
    value.map(|v| json!(v)).unwrap_or(Value::Null)
}

fn entity_row(entity: &Entity) -> Row {
    let mut row = Row::new();
    row.insert("natural_key".to_string(), json!(entity.natural_key.as_str()));
    row.insert("display_name".to_string(), json!(entity.display_name));
    match entity.kind {
        EntityKind::Group => {
            row.insert("code".to_string(), opt_text(entity.code.as_deref()));
            row.insert("department".to_string(), opt_text(entity.department.as_deref()));
            row.insert("study_mode".to_string(), opt_text(entity.study_mode.as_deref()));
            row.insert("semester".to_string(), opt_text(entity.semester.as_deref()));
        }
        EntityKind::Instructor => {
            row.insert("institute".to_string(), opt_text(entity.institute.as_deref()));
            row.insert("email".to_string(), opt_text(entity.email.as_deref()));
        }
    }
    row
}

/// Owner of the feed a session came from
fn source_entity(session: &ClassSession) -> Option<(EntityKind, &NaturalKey)> {
    session.links.iter().find_map(|link| match &link.target {
        EntityRef::Natural(key) => Some((link.kind, key)),
        EntityRef::Alias(_) => None,
    })
}

fn resolved_id(cache: &IdentityCache, kind: EntityKind, target: Option<&EntityRef>) -> Value {
    target
        .and_then(|t| cache.resolve_ref(kind, t))
        .map(|id| json!(id.0.to_string()))
        .unwrap_or(Value::Null)
}

fn session_row(key: &str, session: &ClassSession, cache: &IdentityCache) -> Row {
    let (source_kind, source_key) = source_entity(session)
        .map(|(kind, key)| (kind.as_str(), key.as_str()))
        .unwrap_or(("unknown", ""));

    let mut row = Row::new();
    row.insert(schema::RECONCILIATION_KEY.to_string(), json!(key));
    row.insert("uid".to_string(), opt_text(session.uid.as_deref()));
    row.insert("subject".to_string(), json!(session.subject));
    row.insert("class_type".to_string(), opt_text(session.class_type.as_deref()));
    row.insert(
        "starts_at".to_string(),
        session.starts_at.map(|t| json!(t.to_rfc3339())).unwrap_or(Value::Null),
    );
    row.insert(
        "ends_at".to_string(),
        session.ends_at.map(|t| json!(t.to_rfc3339())).unwrap_or(Value::Null),
    );
    row.insert("location".to_string(), opt_text(session.location.as_deref()));
    row.insert("subgroup".to_string(), opt_text(session.subgroup.as_deref()));
    row.insert("counterpart".to_string(), opt_text(session.counterpart.as_deref()));
    row.insert(
        "group_id".to_string(),
        resolved_id(cache, EntityKind::Group, session.group.as_ref()),
    );
    row.insert(
        "instructor_id".to_string(),
        resolved_id(cache, EntityKind::Instructor, session.instructor.as_ref()),
    );
    row.insert("source_kind".to_string(), json!(source_kind));
    row.insert("source_key".to_string(), json!(source_key));
    row.insert("updated_at".to_string(), json!(Utc::now().to_rfc3339()));
    row
}

/// Fold the stored copy of a session into the row about to be written
///
/// Resolved foreign keys are never replaced. A group feed's view of the
/// session wins over an instructor feed's, and a known subgroup is never
/// cleared.
fn merge_previous(row: &mut Row, previous: &Row) {
    for column in RESOLVED_COLUMNS {
        if let Some(value) = previous.get(column).filter(|v| !v.is_null()) {
            row.insert(column.to_string(), value.clone());
        }
    }

    let group_kind = json!(EntityKind::Group.as_str());
    let from_group = |r: &Row| r.get("source_kind") == Some(&group_kind);
    if from_group(previous) && !from_group(row) {
        for column in GROUP_VIEW_COLUMNS {
            if let Some(value) = previous.get(column) {
                row.insert(column.to_string(), value.clone());
            }
        }
    } else if row.get("subgroup").map_or(true, Value::is_null) {
        if let Some(value) = previous.get("subgroup").filter(|v| !v.is_null()) {
            row.insert("subgroup".to_string(), value.clone());
        }
    }
}

/// Dedup by reconciliation key, first occurrence wins
///
/// Links and missing foreign-key context of later duplicates are merged
/// into the survivor.
fn dedup_sessions(sessions: Vec<ClassSession>) -> Vec<(String, ClassSession)> {
    let mut index: HashMap<String, usize> = HashMap::with_capacity(sessions.len());
    let mut unique: Vec<(String, ClassSession)> = Vec::with_capacity(sessions.len());

    for session in sessions {
        let key = session.reconciliation_key().storage_key();
        match index.get(&key) {
            Some(&position) => {
                let survivor = &mut unique[position].1;
                survivor.links.extend(session.links);
                if survivor.group.is_none() {
                    survivor.group = session.group;
                }
                if survivor.instructor.is_none() {
                    survivor.instructor = session.instructor;
                }
            }
            None => {
                index.insert(key.clone(), unique.len());
                unique.push((key, session));
            }
        }
    }
    unique
}

/// Truncate text columns to their limits; returns the number truncated
fn truncate_row(table: &str, key: &str, row: &mut Row) -> usize {
    let Some(definition) = schema::table(table) else {
        return 0;
    };

    let mut truncated = 0;
    for column in definition.columns {
        let Some(limit) = column.max_chars else {
            continue;
        };
        let Some(Value::String(text)) = row.get_mut(column.name) else {
            continue;
        };
        let original = text.chars().count();
        if original <= limit {
            continue;
        }

        *text = text.chars().take(limit).collect();
        let issue = SyncIssue::Truncation {
            table: definition.name.to_string(),
            column: column.name.to_string(),
            original,
            limit,
        };
        warn!(key = key, "{}", issue);
        telemetry::record_truncation(definition.name, column.name);
        truncated += 1;
    }
    truncated
}
