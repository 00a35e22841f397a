// Summary grammar and event extraction properties

use common::calendar::{extract, parse_summary, ExtractionContext};
use common::models::{Entity, EntityKind, FetchOutcome, NaturalKey, RawCalendarDocument};
use proptest::prelude::*;

fn group_document(body: String) -> RawCalendarDocument {
    let mut entity = Entity::new(EntityKind::Group, NaturalKey::new("27341").unwrap(), "21INF-SP");
    entity.code = Some("21INF-SP".to_string());
    RawCalendarDocument {
        entity,
        body,
        source_url: Some("https://plan.example.edu/grupy_ics.php?ID=27341".to_string()),
        outcome: FetchOutcome::Success,
        attempts: 1,
    }
}

fn calendar_with_summaries(summaries: &[String]) -> String {
    let mut body = String::from("BEGIN:VCALENDAR\r\nVERSION:2.0\r\n");
    for (i, summary) in summaries.iter().enumerate() {
        body.push_str(&format!(
            "BEGIN:VEVENT\r\nUID:{}@plan\r\nDTSTART:20241007T{:02}0000\r\nDTEND:20241007T{:02}3000\r\nSUMMARY:{}\r\nEND:VEVENT\r\n",
            i,
            8 + i % 10,
            8 + i % 10,
            summary
        ));
    }
    body.push_str("END:VCALENDAR\r\n");
    body
}

#[test]
fn documented_summary_example() {
    let parts = parse_summary("Database Systems (L): Dr. Smith (PG: G2)");
    assert_eq!(parts.subject, "Database Systems");
    assert_eq!(parts.class_type.as_deref(), Some("L"));
    assert_eq!(parts.counterpart.as_deref(), Some("Dr. Smith"));
    assert_eq!(parts.subgroup.as_deref(), Some("G2"));
}

#[test]
fn summary_without_parenthetical_degrades_to_subject() {
    proptest!(|(summary in "[A-Za-ząćęłńóśźż0-9 .,-]{1,60}")| {
        prop_assume!(!summary.trim().is_empty());

        let parts = parse_summary(&summary);
        prop_assert_eq!(parts.subject, summary.trim().to_string());
        prop_assert!(parts.class_type.is_none());
        prop_assert!(parts.counterpart.is_none());
        prop_assert!(parts.subgroup.is_none());
    });
}

#[test]
fn typed_summary_splits_into_fields() {
    proptest!(|(
        subject in "[A-Za-z][A-Za-z ]{0,30}[A-Za-z]",
        class_type in "[A-Z][a-z]{0,3}",
        counterpart in "[A-Z][a-z]{2,10} [A-Z][a-z]{2,12}",
    )| {
        let parts = parse_summary(&format!("{} ({}): {}", subject, class_type, counterpart));
        prop_assert_eq!(parts.subject, subject.trim().to_string());
        prop_assert_eq!(parts.class_type, Some(class_type));
        prop_assert_eq!(parts.counterpart, Some(counterpart));
    });
}

#[test]
fn every_event_yields_one_session() {
    proptest!(|(summaries in proptest::collection::vec("[A-Za-z ():]{0,40}", 0..12))| {
        let document = group_document(calendar_with_summaries(&summaries));
        let sessions = extract(&document, &ExtractionContext::default());

        prop_assert_eq!(sessions.len(), summaries.len());
        for session in &sessions {
            prop_assert!(session.starts_at.is_some());
            prop_assert!(session.links.iter().any(|l| l.kind == EntityKind::Group));
            prop_assert_eq!(session.group_code.as_deref(), Some("21INF-SP"));
        }
    });
}

#[test]
fn failed_documents_yield_nothing() {
    for outcome in [FetchOutcome::NotFound, FetchOutcome::Empty, FetchOutcome::Error] {
        let mut document = group_document(calendar_with_summaries(&["Fizyka (L): dr X".to_string()]));
        document.outcome = outcome;
        assert!(extract(&document, &ExtractionContext::default()).is_empty());
    }
}
