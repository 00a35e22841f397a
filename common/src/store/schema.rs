// Store table layout: known tables, their columns and text length limits

use crate::models::EntityKind;

pub const GROUPS: &str = "groups";
pub const INSTRUCTORS: &str = "instructors";
pub const CLASS_SESSIONS: &str = "class_sessions";
pub const SESSION_GROUPS: &str = "session_groups";
pub const SESSION_INSTRUCTORS: &str = "session_instructors";
pub const SYNC_RUNS: &str = "sync_runs";

/// Conflict target for session upserts
pub const RECONCILIATION_KEY: &str = "reconciliation_key";

/// Column definition; `max_chars` is set for length-limited text columns
#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub max_chars: Option<usize>,
}

const fn text(name: &'static str, max_chars: usize) -> Column {
    Column {
        name,
        max_chars: Some(max_chars),
    }
}

const fn plain(name: &'static str) -> Column {
    Column {
        name,
        max_chars: None,
    }
}

#[derive(Debug)]
pub struct Table {
    pub name: &'static str,
    /// Whether the store assigns a uuid `id` on insert
    pub has_id: bool,
    pub columns: &'static [Column],
}

const TABLES: &[Table] = &[
    Table {
        name: GROUPS,
        has_id: true,
        columns: &[
            plain("id"),
            text("natural_key", 64),
            text("display_name", 255),
            text("code", 64),
            text("department", 255),
            text("study_mode", 64),
            text("semester", 32),
            plain("calendar_url"),
            plain("synced_at"),
            plain("created_at"),
        ],
    },
    Table {
        name: INSTRUCTORS,
        has_id: true,
        columns: &[
            plain("id"),
            text("natural_key", 64),
            text("display_name", 255),
            text("institute", 255),
            text("email", 255),
            plain("calendar_url"),
            plain("synced_at"),
            plain("created_at"),
        ],
    },
    Table {
        name: CLASS_SESSIONS,
        has_id: true,
        columns: &[
            plain("id"),
            text("reconciliation_key", 160),
            text("uid", 255),
            text("subject", 255),
            text("class_type", 16),
            plain("starts_at"),
            plain("ends_at"),
            text("location", 255),
            text("subgroup", 64),
            text("counterpart", 512),
            plain("group_id"),
            plain("instructor_id"),
            text("source_kind", 16),
            text("source_key", 64),
            plain("updated_at"),
        ],
    },
    Table {
        name: SESSION_GROUPS,
        has_id: false,
        columns: &[plain("session_id"), plain("group_id")],
    },
    Table {
        name: SESSION_INSTRUCTORS,
        has_id: false,
        columns: &[plain("session_id"), plain("instructor_id")],
    },
    Table {
        name: SYNC_RUNS,
        has_id: true,
        columns: &[
            plain("id"),
            plain("started_at"),
            plain("finished_at"),
            plain("interrupted"),
            plain("entities_fetched"),
            plain("sessions_written"),
            plain("write_conflicts"),
            plain("deferred_links"),
        ],
    },
];

pub fn table(name: &str) -> Option<&'static Table> {
    TABLES.iter().find(|t| t.name == name)
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&'static Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Columns a single-column lookup or ordering can rely on
    pub fn order_column(&self) -> &'static str {
        self.columns.first().map(|c| c.name).unwrap_or("id")
    }
}

/// Length limit of a text column, if any
pub fn max_chars(table_name: &str, column: &str) -> Option<usize> {
    table(table_name)
        .and_then(|t| t.column(column))
        .and_then(|c| c.max_chars)
}

/// Columns whose values identify an entity in summary text
pub fn alias_columns(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::Group => &["display_name", "code"],
        EntityKind::Instructor => &["display_name"],
    }
}

/// Unique key of a junction table
pub fn link_conflict_keys(kind: EntityKind) -> [&'static str; 2] {
    ["session_id", kind.id_column()]
}
