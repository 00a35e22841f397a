// Event extraction: calendar document → normalized class sessions

use super::ics::{self, Component, Property};
use crate::errors::SyncIssue;
use crate::identity::split_counterparts;
use crate::models::{
    ClassSession, EntityKind, EntityRef, FetchOutcome, RawCalendarDocument, SessionLink,
};
use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// Settings the extractor needs besides the document itself
#[derive(Debug, Clone, Copy)]
pub struct ExtractionContext {
    /// Zone for floating times and unknown TZIDs
    pub timezone: Tz,
}

impl Default for ExtractionContext {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::Europe::Warsaw,
        }
    }
}

/// Sessions plus the degradations met while producing them
#[derive(Debug, Default)]
pub struct Extraction {
    pub sessions: Vec<ClassSession>,
    pub issues: Vec<SyncIssue>,
}

/// Structured fields of a free-text summary
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SummaryParts {
    pub subject: String,
    pub class_type: Option<String>,
    pub counterpart: Option<String>,
    pub subgroup: Option<String>,
}

fn subgroup_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"(?i)\(\s*PG\s*:\s*([^)]*)\)").expect("Invalid subgroup regex"))
}

fn typed_colon_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    // subject (type): counterpart; the parenthetical must sit right before the colon
    REGEX.get_or_init(|| {
        Regex::new(r"(?s)^(.*?)\s*\(([^():]{1,10})\)\s*:\s*(.*)$").expect("Invalid summary regex")
    })
}

fn trailing_type_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?s)^(.*?)\s*\(([^():]{1,10})\)\s*$").expect("Invalid trailing type regex")
    })
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parse `subject (type): counterpart (PG: subgroup)`
///
/// Every branch is best effort. A summary that fits no pattern becomes the
/// subject with the other fields left empty.
pub fn parse_summary(summary: &str) -> SummaryParts {
    let trimmed = summary.trim();

    let subgroup = subgroup_regex()
        .captures(trimmed)
        .and_then(|caps| caps.get(1))
        .and_then(|m| non_empty(m.as_str()));
    let text = if subgroup_regex().is_match(trimmed) {
        let stripped = subgroup_regex().replace_all(trimmed, " ");
        stripped.split_whitespace().collect::<Vec<_>>().join(" ")
    } else {
        trimmed.to_string()
    };

    // Without a subject the parenthetical is not a class type
    if let Some(caps) = typed_colon_regex().captures(&text) {
        let subject = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        if !subject.is_empty() {
            return SummaryParts {
                subject: subject.to_string(),
                class_type: caps.get(2).and_then(|m| non_empty(m.as_str())),
                counterpart: caps.get(3).and_then(|m| non_empty(m.as_str())),
                subgroup,
            };
        }
    }

    if let Some(caps) = trailing_type_regex().captures(&text) {
        let subject = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        if !subject.is_empty() {
            return SummaryParts {
                subject: subject.to_string(),
                class_type: caps.get(2).and_then(|m| non_empty(m.as_str())),
                counterpart: None,
                subgroup,
            };
        }
    }

    SummaryParts {
        subject: text,
        class_type: None,
        counterpart: None,
        subgroup,
    }
}

/// Parse a DATE or DATE-TIME property into UTC
///
/// `Z` suffix is UTC, `TZID` names the zone, anything else is floating time
/// in the context zone. Date-only values are local midnight.
pub fn parse_timestamp(property: &Property, default_tz: Tz) -> Option<DateTime<Utc>> {
    let value = property.value.trim();
    let tz = property
        .param("TZID")
        .and_then(|name| name.trim().trim_start_matches('/').parse::<Tz>().ok())
        .unwrap_or(default_tz);

    let is_date = property
        .param("VALUE")
        .map(|v| v.eq_ignore_ascii_case("DATE"))
        .unwrap_or(false)
        || (value.len() == 8 && value.chars().all(|c| c.is_ascii_digit()));
    if is_date {
        let date = NaiveDate::parse_from_str(value, "%Y%m%d").ok()?;
        return localize(tz, date.and_hms_opt(0, 0, 0)?);
    }

    if let Some(utc) = value.strip_suffix(['Z', 'z']) {
        return parse_naive(utc).map(|naive| Utc.from_utc_datetime(&naive));
    }

    localize(tz, parse_naive(value)?)
}

fn parse_naive(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M"))
        .ok()
}

fn localize(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        // Inside a DST gap: the wall clock skipped forward
        LocalResult::None => tz
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .map(|t| t.with_timezone(&Utc)),
    }
}

/// Extract class sessions from one calendar document
pub fn extract(document: &RawCalendarDocument, context: &ExtractionContext) -> Vec<ClassSession> {
    extract_with_issues(document, context).sessions
}

/// Like [`extract`], also reporting malformed records
pub fn extract_with_issues(
    document: &RawCalendarDocument,
    context: &ExtractionContext,
) -> Extraction {
    let mut extraction = Extraction::default();
    if document.outcome != FetchOutcome::Success {
        return extraction;
    }

    let entity_label = format!("{} {}", document.entity.kind, document.entity.natural_key);
    let parsed = ics::parse(&document.body);
    for issue in &parsed.issues {
        extraction.issues.push(SyncIssue::MalformedRecord {
            entity: entity_label.clone(),
            detail: issue.to_string(),
        });
    }

    for event in parsed.events() {
        let (session, problems) = session_from_event(event, document, context);
        for detail in problems {
            extraction.issues.push(SyncIssue::MalformedRecord {
                entity: entity_label.clone(),
                detail,
            });
        }
        extraction.sessions.push(session);
    }

    extraction
}

fn session_from_event(
    event: &Component,
    document: &RawCalendarDocument,
    context: &ExtractionContext,
) -> (ClassSession, Vec<String>) {
    let mut problems = Vec::new();
    let entity = &document.entity;

    let summary = event.property("SUMMARY").map(Property::text).unwrap_or_else(|| {
        problems.push("event without SUMMARY".to_string());
        String::new()
    });
    let parts = parse_summary(&summary);

    let mut timestamp = |name: &str| match event.property(name) {
        Some(property) => {
            let parsed = parse_timestamp(property, context.timezone);
            if parsed.is_none() {
                problems.push(format!("unparseable {} value '{}'", name, property.value));
            }
            parsed
        }
        None => {
            problems.push(format!("event without {}", name));
            None
        }
    };
    let starts_at = timestamp("DTSTART");
    let ends_at = timestamp("DTEND");

    // CATEGORIES wins over the summary parenthetical
    let class_type = event
        .property("CATEGORIES")
        .and_then(|p| p.text().split(',').find_map(non_empty))
        .or(parts.class_type);

    let counterparts = parts
        .counterpart
        .as_deref()
        .map(split_counterparts)
        .unwrap_or_default();

    let own_ref = EntityRef::Natural(entity.natural_key.clone());
    let counterpart_kind = entity.kind.counterpart();
    let first_counterpart = counterparts.first().cloned().map(EntityRef::Alias);

    let mut links = BTreeSet::new();
    links.insert(SessionLink {
        kind: entity.kind,
        target: own_ref.clone(),
    });
    for name in &counterparts {
        links.insert(SessionLink {
            kind: counterpart_kind,
            target: EntityRef::Alias(name.clone()),
        });
    }

    let (group, instructor, group_code) = match entity.kind {
        EntityKind::Group => (
            Some(own_ref),
            first_counterpart,
            Some(entity.label().to_string()),
        ),
        EntityKind::Instructor => (first_counterpart, Some(own_ref), counterparts.first().cloned()),
    };

    let session = ClassSession {
        subject: parts.subject,
        class_type,
        starts_at,
        ends_at,
        location: event.property("LOCATION").and_then(|p| non_empty(&p.text())),
        subgroup: parts.subgroup,
        counterpart: parts.counterpart,
        uid: event.property("UID").and_then(|p| non_empty(&p.value)),
        group_code,
        group,
        instructor,
        links,
    };
    (session, problems)
}
