// Entity seed lists: which groups and instructors a run synchronizes

use crate::errors::SeedError;
use crate::models::{Entity, EntityKind, NaturalKey};
use crate::store::{value_text, Row, ScheduleStore};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Producer of the entity list for one kind
#[async_trait]
pub trait SeedSource: Send + Sync {
    async fn entities(&self, kind: EntityKind) -> Result<Vec<Entity>, SeedError>;
}

/// One entry of a seed document
///
/// Listing scrapers emit the key as `id` and the name as `name`; both
/// spellings are accepted.
#[derive(Debug, Clone, Deserialize)]
struct SeedRecord {
    #[serde(alias = "id")]
    natural_key: Value,
    #[serde(alias = "name", default)]
    display_name: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    department: Option<String>,
    #[serde(default)]
    study_mode: Option<String>,
    #[serde(default)]
    semester: Option<String>,
    #[serde(default)]
    institute: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    calendar_hint: Option<String>,
    #[serde(default, alias = "ics_link")]
    calendar_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SeedDocument {
    #[serde(default)]
    groups: Vec<SeedRecord>,
    #[serde(default)]
    instructors: Vec<SeedRecord>,
}

fn into_entity(kind: EntityKind, record: SeedRecord) -> Result<Entity, SeedError> {
    let natural_key = NaturalKey::new(value_text(&record.natural_key)).ok_or_else(|| {
        SeedError::MissingNaturalKey(record.display_name.clone().unwrap_or_default())
    })?;

    let display_name = record
        .display_name
        .filter(|name| !name.trim().is_empty())
        .or_else(|| record.code.clone())
        .unwrap_or_else(|| natural_key.as_str().to_string());

    let mut entity = Entity::new(kind, natural_key, display_name.trim());
    entity.code = record.code;
    entity.department = record.department;
    entity.study_mode = record.study_mode;
    entity.semester = record.semester;
    entity.institute = record.institute;
    entity.email = record.email;
    entity.calendar_hint = record.calendar_hint;
    entity.calendar_url = record.calendar_url;
    Ok(entity)
}

/// Keep the first entity per natural key
fn dedup(kind: EntityKind, entities: Vec<Entity>) -> Vec<Entity> {
    let before = entities.len();
    let mut seen = HashSet::new();
    let unique: Vec<Entity> = entities
        .into_iter()
        .filter(|e| seen.insert(e.natural_key.clone()))
        .collect();
    if unique.len() < before {
        warn!(
            kind = %kind,
            duplicates = before - unique.len(),
            "Dropped duplicate seed entries"
        );
    }
    unique
}

/// Seed list stored as JSON: `{"groups": [...], "instructors": [...]}`
pub struct JsonSeedFile {
    path: PathBuf,
}

impl JsonSeedFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn parse(kind: EntityKind, text: &str) -> Result<Vec<Entity>, SeedError> {
        let document: SeedDocument = serde_json::from_str(text)?;
        let records = match kind {
            EntityKind::Group => document.groups,
            EntityKind::Instructor => document.instructors,
        };
        let entities = records
            .into_iter()
            .map(|record| into_entity(kind, record))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(dedup(kind, entities))
    }
}

#[async_trait]
impl SeedSource for JsonSeedFile {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn entities(&self, kind: EntityKind) -> Result<Vec<Entity>, SeedError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| SeedError::Io {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            })?;
        let entities = Self::parse(kind, &text)?;
        info!(kind = %kind, count = entities.len(), "Loaded seed entities from file");
        Ok(entities)
    }
}

/// Re-synchronize the entities already present in the store
pub struct StoreSeedSource {
    store: Arc<dyn ScheduleStore>,
}

impl StoreSeedSource {
    pub fn new(store: Arc<dyn ScheduleStore>) -> Self {
        Self { store }
    }
}

fn text_column(row: &Row, column: &str) -> Option<String> {
    row.get(column)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn entity_from_row(kind: EntityKind, row: &Row) -> Option<Entity> {
    let natural_key = row.get("natural_key").map(value_text).and_then(NaturalKey::new)?;
    let display_name =
        text_column(row, "display_name").unwrap_or_else(|| natural_key.as_str().to_string());

    let mut entity = Entity::new(kind, natural_key, display_name);
    entity.code = text_column(row, "code");
    entity.department = text_column(row, "department");
    entity.study_mode = text_column(row, "study_mode");
    entity.semester = text_column(row, "semester");
    entity.institute = text_column(row, "institute");
    entity.email = text_column(row, "email");
    entity.calendar_url = text_column(row, "calendar_url");
    Some(entity)
}

#[async_trait]
impl SeedSource for StoreSeedSource {
    #[instrument(skip(self))]
    async fn entities(&self, kind: EntityKind) -> Result<Vec<Entity>, SeedError> {
        let rows = self.store.select(kind.table(), &[], &[]).await?;
        let entities: Vec<Entity> = rows
            .iter()
            .filter_map(|row| entity_from_row(kind, row))
            .collect();
        info!(kind = %kind, count = entities.len(), "Loaded seed entities from store");
        Ok(dedup(kind, entities))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    const DOCUMENT: &str = r#"{
        "groups": [
            {"id": 27341, "name": "21INF-SP", "code": "21INF-SP", "department": "WIEA", "ics_link": "grupy_ics.php?ID=27341&KIND=GG"},
            {"natural_key": "27342", "display_name": "22INF-SP"},
            {"natural_key": "27341", "display_name": "duplicate"}
        ],
        "instructors": [
            {"natural_key": "501", "display_name": "dr Jan Kowalski", "institute": "Instytut Informatyki"}
        ]
    }"#;

    #[test]
    fn test_parse_groups_with_aliases_and_dedup() {
        let groups = JsonSeedFile::parse(EntityKind::Group, DOCUMENT).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].natural_key.as_str(), "27341");
        assert_eq!(groups[0].display_name, "21INF-SP");
        assert_eq!(
            groups[0].calendar_url.as_deref(),
            Some("grupy_ics.php?ID=27341&KIND=GG")
        );
        assert_eq!(groups[1].display_name, "22INF-SP");
    }

    #[test]
    fn test_parse_instructors() {
        let instructors = JsonSeedFile::parse(EntityKind::Instructor, DOCUMENT).unwrap();
        assert_eq!(instructors.len(), 1);
        assert_eq!(instructors[0].kind, EntityKind::Instructor);
        assert_eq!(instructors[0].institute.as_deref(), Some("Instytut Informatyki"));
    }

    #[test]
    fn test_missing_key_is_an_error() {
        let text = r#"{"groups": [{"natural_key": "  ", "display_name": "X"}]}"#;
        assert!(matches!(
            JsonSeedFile::parse(EntityKind::Group, text),
            Err(SeedError::MissingNaturalKey(_))
        ));
        assert!(matches!(
            JsonSeedFile::parse(EntityKind::Group, "not json"),
            Err(SeedError::InvalidJson(_))
        ));
    }

    #[tokio::test]
    async fn test_json_seed_file_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seeds.json");
        std::fs::write(&path, DOCUMENT).unwrap();

        let source = JsonSeedFile::new(&path);
        assert_eq!(source.entities(EntityKind::Group).await.unwrap().len(), 2);

        let missing = JsonSeedFile::new(dir.path().join("absent.json"));
        assert!(matches!(
            missing.entities(EntityKind::Group).await,
            Err(SeedError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn test_store_seed_source_reads_entity_table() {
        let store = Arc::new(MemoryStore::new());
        store.seed(
            "instructors",
            vec![
                json!({"id": "6f1c8f0e-3c5d-4a43-9a55-0d6f0b1b2a10", "natural_key": "501", "display_name": "dr Jan Kowalski", "calendar_url": "https://plan.example.edu/nauczyciel_ics.php?ID=501"}),
                json!({"id": "6f1c8f0e-3c5d-4a43-9a55-0d6f0b1b2a11", "display_name": "no key"}),
            ],
        );

        let source = StoreSeedSource::new(store);
        let instructors = source.entities(EntityKind::Instructor).await.unwrap();
        assert_eq!(instructors.len(), 1);
        assert!(instructors[0].calendar_url.is_some());
    }

    #[tokio::test]
    async fn test_store_seed_source_propagates_store_errors() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let source = StoreSeedSource::new(store);
        assert!(matches!(
            source.entities(EntityKind::Group).await,
            Err(SeedError::Store(_))
        ));
    }
}
