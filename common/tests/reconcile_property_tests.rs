// Reconciliation properties: idempotence, convergence and partial chunk failure

use chrono::{Duration, TimeZone, Utc};
use common::errors::SyncIssue;
use common::identity::IdentityCache;
use common::models::{ClassSession, Entity, EntityKind, EntityRef, NaturalKey, SessionLink};
use common::store::{MemoryStore, Row};
use common::sync::BatchWriter;
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;

fn session(index: usize, uid: bool) -> ClassSession {
    let owner = NaturalKey::new("27341").unwrap();
    let starts_at = Utc.with_ymd_and_hms(2024, 10, 7, 6, 0, 0).unwrap() + Duration::hours(index as i64);
    let mut links = BTreeSet::new();
    links.insert(SessionLink {
        kind: EntityKind::Group,
        target: EntityRef::Natural(owner.clone()),
    });

    ClassSession {
        subject: format!("Przedmiot {}", index),
        class_type: Some("W".to_string()),
        starts_at: Some(starts_at),
        ends_at: Some(starts_at + Duration::minutes(90)),
        location: Some("A-29".to_string()),
        subgroup: None,
        counterpart: None,
        uid: uid.then(|| format!("{}@plan", index)),
        group_code: Some("21INF-SP".to_string()),
        group: Some(EntityRef::Natural(owner)),
        instructor: None,
        links,
    }
}

async fn setup(chunk_size: usize) -> (Arc<MemoryStore>, BatchWriter, IdentityCache) {
    let store = Arc::new(MemoryStore::new());
    let writer = BatchWriter::new(store.clone(), chunk_size);
    let cache = IdentityCache::new();
    let mut group = Entity::new(EntityKind::Group, NaturalKey::new("27341").unwrap(), "21INF-SP");
    group.code = Some("21INF-SP".to_string());
    writer.write_entities(EntityKind::Group, &[group], &cache).await;
    (store, writer, cache)
}

fn keys(rows: &[Row]) -> BTreeSet<String> {
    rows.iter()
        .map(|r| r["reconciliation_key"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[test]
fn reconciling_a_doubled_set_equals_reconciling_it_once() {
    proptest!(ProptestConfig::with_cases(32), |(count in 1usize..40, with_uid in any::<bool>())| {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let sessions: Vec<ClassSession> = (0..count).map(|i| session(i, with_uid)).collect();

            let (once_store, once_writer, once_cache) = setup(7).await;
            let once = once_writer.reconcile(sessions.clone(), &once_cache).await;

            let (twice_store, twice_writer, twice_cache) = setup(7).await;
            let mut doubled = sessions.clone();
            doubled.extend(sessions);
            let twice = twice_writer.reconcile(doubled, &twice_cache).await;

            assert_eq!(once.written, count);
            assert_eq!(twice.written, count);
            assert_eq!(twice.merged, count);
            assert_eq!(
                keys(&once_store.rows("class_sessions")),
                keys(&twice_store.rows("class_sessions"))
            );
            assert_eq!(
                once_store.count("session_groups"),
                twice_store.count("session_groups")
            );
        });
    });
}

#[tokio::test]
async fn second_run_against_unchanged_source_adds_no_rows() {
    let (store, writer, cache) = setup(1000).await;
    let sessions: Vec<ClassSession> = (0..25).map(|i| session(i, i % 2 == 0)).collect();

    writer.reconcile(sessions.clone(), &cache).await;
    let sessions_after_first = store.count("class_sessions");
    let links_after_first = store.count("session_groups");
    let ids_after_first: Vec<Row> = store.rows("class_sessions");

    let second = writer.reconcile(sessions, &cache).await;

    assert_eq!(second.written, 25);
    assert!(second.conflicts.is_empty());
    assert_eq!(store.count("class_sessions"), sessions_after_first);
    assert_eq!(store.count("session_groups"), links_after_first);
    for (before, after) in ids_after_first.iter().zip(store.rows("class_sessions")) {
        assert_eq!(before["id"], after["id"]);
    }
}

#[tokio::test]
async fn three_bad_rows_in_a_thousand_are_isolated() {
    let (store, writer, cache) = setup(1000).await;
    store.reject_when("class_sessions", |row| {
        row["subject"]
            .as_str()
            .map(|s| s.ends_with("-bad"))
            .unwrap_or(false)
    });

    let sessions: Vec<ClassSession> = (0..1000)
        .map(|i| {
            let mut s = session(i, true);
            if i == 10 || i == 500 || i == 999 {
                s.subject = format!("{}-bad", s.subject);
            }
            s
        })
        .collect();

    let report = writer.reconcile(sessions, &cache).await;

    assert_eq!(report.written, 997);
    assert_eq!(store.count("class_sessions"), 997);
    let conflicts: Vec<&SyncIssue> = report
        .conflicts
        .iter()
        .filter(|c| matches!(c, SyncIssue::WriteConflict { table, .. } if table == "class_sessions"))
        .collect();
    assert_eq!(conflicts.len(), 3);
    assert_eq!(store.count("session_groups"), 997);
}

#[tokio::test]
async fn unresolved_references_are_written_as_null() {
    let (store, writer, cache) = setup(1000).await;
    let mut orphan = session(0, true);
    orphan.group = Some(EntityRef::Alias("99XYZ".to_string()));
    orphan.instructor = Some(EntityRef::Alias("dr Nieznany".to_string()));

    let report = writer.reconcile(vec![orphan], &cache).await;

    assert_eq!(report.written, 1);
    let row = &store.rows("class_sessions")[0];
    assert_eq!(row["group_id"], json!(null));
    assert_eq!(row["instructor_id"], json!(null));
}
