// Core data models for the schedule synchronization pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Kind of schedule entity that owns a calendar feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Group,
    Instructor,
}

impl EntityKind {
    pub const ALL: [EntityKind; 2] = [EntityKind::Group, EntityKind::Instructor];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Group => "group",
            EntityKind::Instructor => "instructor",
        }
    }

    /// Store table holding entities of this kind
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Group => "groups",
            EntityKind::Instructor => "instructors",
        }
    }

    /// Calendar export script on the publishing service
    pub fn calendar_script(&self) -> &'static str {
        match self {
            EntityKind::Group => "grupy_ics.php",
            EntityKind::Instructor => "nauczyciel_ics.php",
        }
    }

    /// Junction table linking sessions to entities of this kind
    pub fn link_table(&self) -> &'static str {
        match self {
            EntityKind::Group => "session_groups",
            EntityKind::Instructor => "session_instructors",
        }
    }

    /// Foreign key column referencing this kind
    pub fn id_column(&self) -> &'static str {
        match self {
            EntityKind::Group => "group_id",
            EntityKind::Instructor => "instructor_id",
        }
    }

    /// The kind named by the counterpart text of this kind's feed
    pub fn counterpart(&self) -> EntityKind {
        match self {
            EntityKind::Group => EntityKind::Instructor,
            EntityKind::Instructor => EntityKind::Group,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier assigned by the remote source
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKey(String);

impl NaturalKey {
    /// Returns None for blank keys
    pub fn new(raw: impl AsRef<str>) -> Option<Self> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier assigned by the store on first insert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PersistedId(pub Uuid);

impl fmt::Display for PersistedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A student group or instructor as published by the remote source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub kind: EntityKind,
    pub natural_key: NaturalKey,
    pub display_name: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub study_mode: Option<String>,
    #[serde(default)]
    pub semester: Option<String>,
    #[serde(default)]
    pub institute: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// Client hint sent as `KIND=`
    #[serde(default)]
    pub calendar_hint: Option<String>,
    /// Explicit calendar endpoint published on the entity page
    #[serde(default)]
    pub calendar_url: Option<String>,
}

impl Entity {
    pub fn new(kind: EntityKind, natural_key: NaturalKey, display_name: impl Into<String>) -> Self {
        Self {
            kind,
            natural_key,
            display_name: display_name.into(),
            code: None,
            department: None,
            study_mode: None,
            semester: None,
            institute: None,
            email: None,
            calendar_hint: None,
            calendar_url: None,
        }
    }

    /// Label other feeds use to refer to this entity
    pub fn label(&self) -> &str {
        match self.kind {
            EntityKind::Group => self.code.as_deref().unwrap_or(&self.display_name),
            EntityKind::Instructor => &self.display_name,
        }
    }
}

/// Result of fetching one entity's calendar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchOutcome {
    Success,
    NotFound,
    Empty,
    Error,
}

impl FetchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchOutcome::Success => "success",
            FetchOutcome::NotFound => "not_found",
            FetchOutcome::Empty => "empty",
            FetchOutcome::Error => "error",
        }
    }
}

/// Unparsed calendar text for one entity
#[derive(Debug, Clone)]
pub struct RawCalendarDocument {
    pub entity: Entity,
    pub body: String,
    pub source_url: Option<String>,
    pub outcome: FetchOutcome,
    /// HTTP attempts spent across all candidates
    pub attempts: u32,
}

impl RawCalendarDocument {
    pub fn failed(entity: Entity, outcome: FetchOutcome, attempts: u32) -> Self {
        Self {
            entity,
            body: String::new(),
            source_url: None,
            outcome,
            attempts,
        }
    }
}

/// Reference to an entity that may not have a persisted id yet
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "by", content = "value")]
pub enum EntityRef {
    /// Natural key of the feed owner
    Natural(NaturalKey),
    /// Display name or group code taken from summary text
    Alias(String),
}

/// Junction link between a session and a group or instructor
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionLink {
    pub kind: EntityKind,
    pub target: EntityRef,
}

/// Normalized class session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassSession {
    pub subject: String,
    pub class_type: Option<String>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub location: Option<String>,
    pub subgroup: Option<String>,
    /// Counterpart party text after the summary colon
    pub counterpart: Option<String>,
    pub uid: Option<String>,
    /// Owning group code, part of the heuristic key
    pub group_code: Option<String>,
    /// Group context, at most one per extraction
    pub group: Option<EntityRef>,
    /// Instructor context, at most one per extraction
    pub instructor: Option<EntityRef>,
    /// Every entity this session should be linked to
    pub links: BTreeSet<SessionLink>,
}

impl ClassSession {
    pub fn reconciliation_key(&self) -> ReconciliationKey {
        ReconciliationKey::for_session(self)
    }
}

/// Identity of a session across feeds and runs
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReconciliationKey {
    Uid(String),
    Heuristic {
        subject: String,
        starts_at: Option<DateTime<Utc>>,
        ends_at: Option<DateTime<Utc>>,
        location: String,
        group_code: String,
    },
}

impl ReconciliationKey {
    pub fn for_session(session: &ClassSession) -> Self {
        if let Some(uid) = session.uid.as_deref().map(str::trim) {
            if !uid.is_empty() {
                return ReconciliationKey::Uid(uid.to_string());
            }
        }

        ReconciliationKey::Heuristic {
            subject: normalize_component(&session.subject),
            starts_at: session.starts_at,
            ends_at: session.ends_at,
            location: normalize_component(session.location.as_deref().unwrap_or("")),
            group_code: normalize_component(session.group_code.as_deref().unwrap_or("")),
        }
    }

    /// Value stored in the `reconciliation_key` column
    pub fn storage_key(&self) -> String {
        match self {
            ReconciliationKey::Uid(uid) => format!("uid:{}", uid),
            ReconciliationKey::Heuristic {
                subject,
                starts_at,
                ends_at,
                location,
                group_code,
            } => {
                let start = starts_at.map(|t| t.to_rfc3339()).unwrap_or_default();
                let end = ends_at.map(|t| t.to_rfc3339()).unwrap_or_default();
                let parts: [&str; 5] = [subject, &start, &end, location, group_code];

                let mut hasher = Sha256::new();
                for part in parts {
                    hasher.update(part.as_bytes());
                    hasher.update([0x1f]);
                }
                format!("h:{}", hex::encode(hasher.finalize()))
            }
        }
    }
}

fn normalize_component(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Natural key to persisted id mapping held by the identity cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityCacheEntry {
    pub kind: EntityKind,
    pub natural_key: NaturalKey,
    pub id: PersistedId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn session(subject: &str, uid: Option<&str>) -> ClassSession {
        ClassSession {
            subject: subject.to_string(),
            class_type: None,
            starts_at: Some(Utc.with_ymd_and_hms(2024, 10, 7, 6, 0, 0).unwrap()),
            ends_at: Some(Utc.with_ymd_and_hms(2024, 10, 7, 7, 30, 0).unwrap()),
            location: Some("A-29 s. 102".to_string()),
            subgroup: None,
            counterpart: None,
            uid: uid.map(str::to_string),
            group_code: Some("21INF-SP".to_string()),
            group: None,
            instructor: None,
            links: BTreeSet::new(),
        }
    }

    #[test]
    fn test_natural_key_rejects_blank() {
        assert!(NaturalKey::new("   ").is_none());
        assert_eq!(NaturalKey::new(" 1234 ").unwrap().as_str(), "1234");
    }

    #[test]
    fn test_uid_is_preferred() {
        let key = session("Algebra", Some("abc@plan")).reconciliation_key();
        assert_eq!(key, ReconciliationKey::Uid("abc@plan".to_string()));
        assert_eq!(key.storage_key(), "uid:abc@plan");
    }

    #[test]
    fn test_blank_uid_falls_back_to_heuristic() {
        let key = session("Algebra", Some("  ")).reconciliation_key();
        assert!(matches!(key, ReconciliationKey::Heuristic { .. }));
    }

    #[test]
    fn test_heuristic_key_ignores_case_and_spacing() {
        let a = session("Database  Systems", None);
        let mut b = session("database systems", None);
        b.group_code = Some("21inf-sp".to_string());

        assert_eq!(
            a.reconciliation_key().storage_key(),
            b.reconciliation_key().storage_key()
        );
    }

    #[test]
    fn test_heuristic_key_distinguishes_times() {
        let a = session("Algebra", None);
        let mut b = session("Algebra", None);
        b.starts_at = Some(Utc.with_ymd_and_hms(2024, 10, 14, 6, 0, 0).unwrap());

        assert_ne!(
            a.reconciliation_key().storage_key(),
            b.reconciliation_key().storage_key()
        );
        assert!(a.reconciliation_key().storage_key().starts_with("h:"));
    }

    #[test]
    fn test_group_label_prefers_code() {
        let mut group = Entity::new(EntityKind::Group, NaturalKey::new("7").unwrap(), "Informatyka");
        assert_eq!(group.label(), "Informatyka");
        group.code = Some("21INF-SP".to_string());
        assert_eq!(group.label(), "21INF-SP");
    }
}
