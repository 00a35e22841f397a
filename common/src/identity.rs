// Identity cache: natural key → persisted id, seeded from the store and updated after writes

use crate::errors::StoreError;
use crate::models::{EntityKind, EntityRef, IdentityCacheEntry, NaturalKey, PersistedId};
use crate::store::{schema, ScheduleStore};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{OnceLock, PoisonError, RwLock};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Academic titles dropped when matching instructor names
const TITLES: &[&str] = &[
    "dr", "mgr", "prof", "hab", "inż", "inz", "doc", "lic", "licencjat", "phd",
];

#[derive(Default)]
struct CacheState {
    ids: HashMap<(EntityKind, NaturalKey), PersistedId>,
    aliases: HashMap<(EntityKind, String), NaturalKey>,
}

/// In-memory identity map shared by the controller, writer and workers
///
/// Single-writer discipline: workers only call the `resolve*` methods; the
/// pipeline controller and batch writer are the only callers of `learn*`
/// and `bulk_load`, and they call `learn` only after the store acknowledged
/// the write that assigned the id. Lookups never block on the network and
/// return `None` for anything not learned yet.
#[derive(Default)]
pub struct IdentityCache {
    state: RwLock<CacheState>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, kind: EntityKind, natural_key: &NaturalKey) -> Option<PersistedId> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.ids.get(&(kind, natural_key.clone())).copied()
    }

    /// Resolve a display name or group code seen in summary text
    pub fn resolve_alias(&self, kind: EntityKind, alias: &str) -> Option<PersistedId> {
        let normalized = normalize_alias(alias);
        if normalized.is_empty() {
            return None;
        }
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .aliases
            .get(&(kind, normalized))
            .and_then(|key| state.ids.get(&(kind, key.clone())))
            .copied()
    }

    pub fn resolve_ref(&self, kind: EntityKind, target: &EntityRef) -> Option<PersistedId> {
        match target {
            EntityRef::Natural(key) => self.resolve(kind, key),
            EntityRef::Alias(alias) => self.resolve_alias(kind, alias),
        }
    }

    /// Record an id acknowledged by the store; the first learned id wins
    pub fn learn(&self, kind: EntityKind, natural_key: NaturalKey, id: PersistedId) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let existing = state.ids.entry((kind, natural_key.clone())).or_insert(id);
        if *existing != id {
            warn!(
                kind = %kind,
                natural_key = %natural_key,
                known_id = %existing,
                offered_id = %id,
                "Ignoring conflicting persisted id for known entity"
            );
        }
    }

    pub fn learn_alias(&self, kind: EntityKind, alias: &str, natural_key: &NaturalKey) {
        let normalized = normalize_alias(alias);
        if normalized.is_empty() {
            return;
        }
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state
            .aliases
            .entry((kind, normalized))
            .or_insert_with(|| natural_key.clone());
    }

    /// Seed the cache for one kind from a single paged read of its table
    #[instrument(skip(self, store))]
    pub async fn bulk_load(
        &self,
        kind: EntityKind,
        store: &dyn ScheduleStore,
    ) -> Result<usize, StoreError> {
        let alias_columns = schema::alias_columns(kind);
        let mut columns = vec!["id", "natural_key"];
        columns.extend_from_slice(alias_columns);

        let rows = store.select(kind.table(), &columns, &[]).await?;

        let mut loaded = 0;
        for row in rows {
            let natural_key = row
                .get("natural_key")
                .and_then(|v| v.as_str())
                .and_then(NaturalKey::new);
            let id = row
                .get("id")
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())
                .map(PersistedId);

            let (Some(natural_key), Some(id)) = (natural_key, id) else {
                warn!(kind = %kind, row = ?row, "Skipping entity row without usable id or natural key");
                continue;
            };

            for &column in alias_columns {
                if let Some(alias) = row.get(column).and_then(|v| v.as_str()) {
                    self.learn_alias(kind, alias, &natural_key);
                }
            }
            self.learn(kind, natural_key, id);
            loaded += 1;
        }

        info!(kind = %kind, loaded = loaded, "Identity cache seeded from store");
        Ok(loaded)
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.ids.keys().filter(|(k, _)| *k == kind).count()
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.ids.is_empty()
    }

    pub fn entries(&self, kind: EntityKind) -> Vec<IdentityCacheEntry> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .ids
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|((k, key), id)| IdentityCacheEntry {
                kind: *k,
                natural_key: key.clone(),
                id: *id,
            })
            .collect()
    }
}

fn honorific_suffix_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        // ", prof. UZ" style affiliation suffix
        Regex::new(r",\s*(?i:prof)\.?\s*\p{Lu}{1,6}\.?\s*$").expect("Invalid suffix regex")
    })
}

/// Normalize a person name or group code for alias lookups
///
/// Lower-cases, drops academic titles and punctuation, collapses whitespace.
pub fn normalize_alias(raw: &str) -> String {
    let without_suffix = honorific_suffix_regex().replace(raw.trim(), "");
    let cleaned: String = without_suffix
        .chars()
        .map(|c| if c == '.' || c == ',' || c == ';' { ' ' } else { c })
        .collect();

    cleaned
        .to_lowercase()
        .split_whitespace()
        .filter(|token| !TITLES.contains(token))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split counterpart text into individual names or codes
pub fn split_counterparts(raw: &str) -> Vec<String> {
    let without_suffix = honorific_suffix_regex().replace(raw.trim(), "");
    without_suffix
        .split([',', ';'])
        .map(str::trim)
        .filter(|part| !part.is_empty() && !normalize_alias(part).is_empty())
        .map(str::to_string)
        .collect()
}
