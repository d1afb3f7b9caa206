//! Database migrations
//!
//! Schema migration definitions for the store.

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "Initial schema: memories table, state key/value, indices",
    up: MIGRATION_V1_UP,
}];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: Initial schema
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    created TEXT NOT NULL,
    memory_days REAL NOT NULL DEFAULT 0.0,
    recalled_since_last_batch INTEGER NOT NULL DEFAULT 0,
    recall_count INTEGER NOT NULL DEFAULT 0,
    emotional_intensity INTEGER NOT NULL,
    emotional_valence TEXT NOT NULL,
    emotional_arousal INTEGER NOT NULL,
    emotional_tags TEXT NOT NULL DEFAULT '[]',
    decay_coefficient REAL NOT NULL,
    category TEXT NOT NULL,
    keywords TEXT NOT NULL DEFAULT '[]',
    current_level INTEGER NOT NULL DEFAULT 1,
    "trigger" TEXT NOT NULL,
    content TEXT NOT NULL,
    embedding BLOB,
    relations TEXT NOT NULL DEFAULT '[]',
    retention_score REAL NOT NULL DEFAULT 0.0,
    archived_at TEXT,
    protected INTEGER NOT NULL DEFAULT 0,
    revival_requested INTEGER NOT NULL DEFAULT 0,
    revival_requested_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_memories_retention_score ON memories(retention_score);
CREATE INDEX IF NOT EXISTS idx_memories_current_level ON memories(current_level);
CREATE INDEX IF NOT EXISTS idx_memories_archived_at ON memories(archived_at);
CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created);

-- Engine state key/value (e.g. last_compression_run)
CREATE TABLE IF NOT EXISTS state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// Get current schema version from database
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

/// Apply pending migrations
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                "Applying migration v{}: {}",
                migration.version,
                migration.description
            );
            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }

    Ok(applied)
}
