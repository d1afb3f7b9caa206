//! SQLite store
//!
//! Durable record persistence with ACID single-writer, concurrent
//! multi-reader semantics via WAL. The three actors (ingestion, retrieval,
//! the daily batch) share only this file; a writer finding it locked waits
//! up to 30 seconds before failing.
//!
//! Uses separate reader/writer connections for interior mutability. All
//! methods take `&self`, making the store `Send + Sync` so callers can share
//! an `Arc<MemoryStore>` without an outer mutex.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, NaiveDate};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Transaction};

use crate::embeddings::Embedding;
use crate::memory::{Category, MemoryRecord, Relation, Valence};

/// Reserved state key holding the last batch timestamp (RFC 3339, local offset)
pub const STATE_LAST_COMPRESSION_RUN: &str = "last_compression_run";

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Store error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("Database error: {0}")]
    Database(rusqlite::Error),
    /// The database file stayed locked past the busy timeout
    #[error("Store locked")]
    Locked,
    /// Insert with an id that already exists
    #[error("Duplicate memory id: {0}")]
    DuplicateId(String),
    /// Record not found
    #[error("Memory not found: {0}")]
    NotFound(String),
    /// A persisted value failed validation on read
    #[error("Store corrupt: {0}")]
    Corrupt(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Initialization error
    #[error("Initialization error: {0}")]
    Init(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, _) = &e {
            if matches!(
                failure.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) {
                return StoreError::Locked;
            }
        }
        StoreError::Database(e)
    }
}

/// Store result type
pub type Result<T> = std::result::Result<T, StoreError>;

// ============================================================================
// PARTIAL UPDATE
// ============================================================================

/// Partial record update, applied atomically. Unset fields are untouched;
/// the double-`Option` fields distinguish "leave alone" from "set NULL".
#[derive(Debug, Clone, Default)]
pub struct MemoryPatch {
    pub memory_days: Option<f64>,
    pub recalled_since_last_batch: Option<bool>,
    pub recall_count: Option<i32>,
    pub decay_coefficient: Option<f64>,
    pub current_level: Option<i32>,
    pub trigger: Option<String>,
    pub content: Option<String>,
    pub embedding: Option<Option<Vec<f32>>>,
    pub relations: Option<Vec<Relation>>,
    pub retention_score: Option<f64>,
    pub archived_at: Option<Option<DateTime<chrono::FixedOffset>>>,
    pub protected: Option<bool>,
    pub revival_requested: Option<bool>,
    pub revival_requested_at: Option<Option<DateTime<chrono::FixedOffset>>>,
}

impl MemoryPatch {
    pub fn new() -> Self {
        Self::default()
    }

    fn to_assignments(&self) -> Vec<(&'static str, Value)> {
        let mut set: Vec<(&'static str, Value)> = Vec::new();
        if let Some(v) = self.memory_days {
            set.push(("memory_days", Value::Real(v)));
        }
        if let Some(v) = self.recalled_since_last_batch {
            set.push(("recalled_since_last_batch", Value::Integer(i64::from(v))));
        }
        if let Some(v) = self.recall_count {
            set.push(("recall_count", Value::Integer(i64::from(v))));
        }
        if let Some(v) = self.decay_coefficient {
            set.push(("decay_coefficient", Value::Real(v)));
        }
        if let Some(v) = self.current_level {
            set.push(("current_level", Value::Integer(i64::from(v))));
        }
        if let Some(v) = &self.trigger {
            set.push(("\"trigger\"", Value::Text(v.clone())));
        }
        if let Some(v) = &self.content {
            set.push(("content", Value::Text(v.clone())));
        }
        if let Some(v) = &self.embedding {
            set.push((
                "embedding",
                match v {
                    Some(vector) => Value::Blob(Embedding::new(vector.clone()).to_bytes()),
                    None => Value::Null,
                },
            ));
        }
        if let Some(v) = &self.relations {
            set.push((
                "relations",
                Value::Text(serde_json::to_string(v).unwrap_or_else(|_| "[]".to_string())),
            ));
        }
        if let Some(v) = self.retention_score {
            set.push(("retention_score", Value::Real(v)));
        }
        if let Some(v) = &self.archived_at {
            set.push((
                "archived_at",
                match v {
                    Some(ts) => Value::Text(ts.to_rfc3339()),
                    None => Value::Null,
                },
            ));
        }
        if let Some(v) = self.protected {
            set.push(("protected", Value::Integer(i64::from(v))));
        }
        if let Some(v) = self.revival_requested {
            set.push(("revival_requested", Value::Integer(i64::from(v))));
        }
        if let Some(v) = &self.revival_requested_at {
            set.push((
                "revival_requested_at",
                match v {
                    Some(ts) => Value::Text(ts.to_rfc3339()),
                    None => Value::Null,
                },
            ));
        }
        set
    }
}

// ============================================================================
// STORE
// ============================================================================

/// The durable memory store
pub struct MemoryStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl MemoryStore {
    /// Apply PRAGMAs shared by both connections
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 30000;
             PRAGMA temp_store = MEMORY;",
        )?;
        Ok(())
    }

    /// Open (or create) the store. With no path, uses the platform data dir.
    pub fn new(db_path: Option<PathBuf>) -> Result<Self> {
        let path = match db_path {
            Some(p) => p,
            None => {
                let proj_dirs = directories::ProjectDirs::from("dev", "kioku", "kioku")
                    .ok_or_else(|| {
                        StoreError::Init("could not determine project directories".to_string())
                    })?;
                let data_dir = proj_dirs.data_dir();
                std::fs::create_dir_all(data_dir)?;
                data_dir.join("memories.db")
            }
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let writer_conn = Connection::open(&path)?;
        Self::configure_connection(&writer_conn)?;
        super::migrations::apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open(&path)?;
        Self::configure_connection(&reader_conn)?;

        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
        })
    }

    fn lock_writer(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| StoreError::Init("writer lock poisoned".to_string()))
    }

    fn lock_reader(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| StoreError::Init("reader lock poisoned".to_string()))
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Insert a record. Fails with `DuplicateId` when the id collides.
    pub fn insert(&self, record: &MemoryRecord) -> Result<()> {
        let writer = self.lock_writer()?;
        let result = writer.execute(
            r#"INSERT INTO memories (
                id, created, memory_days, recalled_since_last_batch, recall_count,
                emotional_intensity, emotional_valence, emotional_arousal, emotional_tags,
                decay_coefficient, category, keywords, current_level, "trigger", content,
                embedding, relations, retention_score, archived_at, protected,
                revival_requested, revival_requested_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
                ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22
            )"#,
            params![
                record.id,
                record.created.to_rfc3339(),
                record.memory_days,
                record.recalled_since_last_batch,
                record.recall_count,
                record.emotional_intensity,
                record.emotional_valence.as_str(),
                record.emotional_arousal,
                serde_json::to_string(&record.emotional_tags)
                    .unwrap_or_else(|_| "[]".to_string()),
                record.decay_coefficient,
                record.category.as_str(),
                serde_json::to_string(&record.keywords).unwrap_or_else(|_| "[]".to_string()),
                record.current_level,
                record.trigger,
                record.content,
                record
                    .embedding
                    .as_ref()
                    .map(|v| Embedding::new(v.clone()).to_bytes()),
                serde_json::to_string(&record.relations).unwrap_or_else(|_| "[]".to_string()),
                record.retention_score,
                record.archived_at.map(|ts| ts.to_rfc3339()),
                record.protected,
                record.revival_requested,
                record.revival_requested_at.map(|ts| ts.to_rfc3339()),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(failure, _))
                if failure.code == ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::DuplicateId(record.id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Apply a partial update atomically
    pub fn update(&self, id: &str, patch: &MemoryPatch) -> Result<()> {
        let writer = self.lock_writer()?;
        let changed = Self::apply_patch(&writer, id, patch)?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Apply a patch on an explicit connection (usable inside a transaction)
    pub fn apply_patch(conn: &Connection, id: &str, patch: &MemoryPatch) -> Result<usize> {
        let assignments = patch.to_assignments();
        if assignments.is_empty() {
            return Ok(0);
        }

        let set_clause = assignments
            .iter()
            .enumerate()
            .map(|(i, (column, _))| format!("{} = ?{}", column, i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE memories SET {} WHERE id = ?{}",
            set_clause,
            assignments.len() + 1
        );

        let mut values: Vec<Value> = assignments.into_iter().map(|(_, v)| v).collect();
        values.push(Value::Text(id.to_string()));

        Ok(conn.execute(&sql, params_from_iter(values))?)
    }

    /// Flag the given non-archived records as recalled, in one transaction.
    /// Returns the number of records flagged.
    pub fn mark_recalled(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut writer = self.lock_writer()?;
        let tx = writer.transaction()?;
        let placeholders = (1..=ids.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "UPDATE memories SET recalled_since_last_batch = 1
             WHERE id IN ({placeholders}) AND archived_at IS NULL"
        );
        let changed = tx.execute(&sql, params_from_iter(ids.iter()))?;
        tx.commit()?;
        Ok(changed)
    }

    /// Remove a record unconditionally. Returns whether it existed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let writer = self.lock_writer()?;
        let changed = writer.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    /// Run `f` inside a single write transaction. The batch engine uses one
    /// of these per phase; readers see either the pre- or post-phase state.
    pub fn transaction<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let mut writer = self.lock_writer()?;
        let tx = writer.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Get a record by id
    pub fn get(&self, id: &str) -> Result<Option<MemoryRecord>> {
        let reader = self.lock_reader()?;
        let mut stmt = reader.prepare("SELECT * FROM memories WHERE id = ?1")?;
        let record = stmt
            .query_row(params![id], |row| Self::row_to_record(row))
            .optional()?;
        Ok(record)
    }

    /// Active records (`archived_at IS NULL`)
    pub fn get_active(&self) -> Result<Vec<MemoryRecord>> {
        self.select("SELECT * FROM memories WHERE archived_at IS NULL ORDER BY created")
    }

    /// Archived records
    pub fn get_archived(&self) -> Result<Vec<MemoryRecord>> {
        self.select("SELECT * FROM memories WHERE archived_at IS NOT NULL ORDER BY created")
    }

    /// Every record, active and archived
    pub fn get_all(&self) -> Result<Vec<MemoryRecord>> {
        self.select("SELECT * FROM memories ORDER BY created")
    }

    /// Active records at the given tier
    pub fn get_by_level(&self, level: i32) -> Result<Vec<MemoryRecord>> {
        let reader = self.lock_reader()?;
        let mut stmt = reader.prepare(
            "SELECT * FROM memories WHERE current_level = ?1 AND archived_at IS NULL
             ORDER BY created",
        )?;
        let rows = stmt.query_map(params![level], |row| Self::row_to_record(row))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn select(&self, sql: &str) -> Result<Vec<MemoryRecord>> {
        let reader = self.lock_reader()?;
        let mut stmt = reader.prepare(sql)?;
        let rows = stmt.query_map([], |row| Self::row_to_record(row))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Total record count
    pub fn count(&self, include_archived: bool) -> Result<i64> {
        let reader = self.lock_reader()?;
        let sql = if include_archived {
            "SELECT COUNT(*) FROM memories"
        } else {
            "SELECT COUNT(*) FROM memories WHERE archived_at IS NULL"
        };
        Ok(reader.query_row(sql, [], |row| row.get(0))?)
    }

    /// Active record counts per tier
    pub fn count_by_level(&self) -> Result<Vec<(i32, i64)>> {
        let reader = self.lock_reader()?;
        let mut stmt = reader.prepare(
            "SELECT current_level, COUNT(*) FROM memories
             WHERE archived_at IS NULL GROUP BY current_level ORDER BY current_level",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }

    /// Protected record count (active and archived)
    pub fn count_protected(&self) -> Result<i64> {
        let reader = self.lock_reader()?;
        Ok(reader.query_row(
            "SELECT COUNT(*) FROM memories WHERE protected = 1",
            [],
            |row| row.get(0),
        )?)
    }

    /// Non-protected active count; the denominator of the tier ratio math
    pub fn count_active_nonprotected(&self) -> Result<i64> {
        let reader = self.lock_reader()?;
        Ok(reader.query_row(
            "SELECT COUNT(*) FROM memories WHERE archived_at IS NULL AND protected = 0",
            [],
            |row| row.get(0),
        )?)
    }

    /// Allocate the next `mem_YYYYMMDD_NNN` id for the given day
    pub fn next_memory_id(&self, date: NaiveDate) -> Result<String> {
        let day = date.format("%Y%m%d").to_string();
        let prefix = format!("mem_{day}_%");
        let reader = self.lock_reader()?;
        let max_suffix: Option<i64> = reader.query_row(
            "SELECT MAX(CAST(SUBSTR(id, 14) AS INTEGER)) FROM memories WHERE id LIKE ?1",
            params![prefix],
            |row| row.get(0),
        )?;
        Ok(format!("mem_{day}_{:03}", max_suffix.unwrap_or(0) + 1))
    }

    // ========================================================================
    // STATE KEY/VALUE
    // ========================================================================

    pub fn get_state(&self, key: &str) -> Result<Option<String>> {
        let reader = self.lock_reader()?;
        let value = reader
            .query_row("SELECT value FROM state WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let writer = self.lock_writer()?;
        Self::set_state_on(&writer, key, value)
    }

    /// Set a state key on an explicit connection (usable inside a transaction)
    pub fn set_state_on(conn: &Connection, key: &str, value: &str) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO state (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    // ========================================================================
    // ROW DECODING
    // ========================================================================

    fn parse_timestamp(
        value: &str,
        field: &'static str,
    ) -> rusqlite::Result<DateTime<chrono::FixedOffset>> {
        DateTime::parse_from_rfc3339(value).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("invalid {field} timestamp '{value}': {e}"),
                )),
            )
        })
    }

    fn decode_error(field: &'static str, detail: String) -> rusqlite::Error {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid {field}: {detail}"),
            )),
        )
    }

    /// Convert a row to a record, validating enums and JSON on read
    pub fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<MemoryRecord> {
        let created: String = row.get("created")?;
        let created = Self::parse_timestamp(&created, "created")?;

        let archived_at: Option<String> = row.get("archived_at")?;
        let archived_at = archived_at
            .map(|s| Self::parse_timestamp(&s, "archived_at"))
            .transpose()?;

        let revival_requested_at: Option<String> = row.get("revival_requested_at")?;
        let revival_requested_at = revival_requested_at
            .map(|s| Self::parse_timestamp(&s, "revival_requested_at"))
            .transpose()?;

        let valence: String = row.get("emotional_valence")?;
        let valence = Valence::parse_name(&valence)
            .ok_or_else(|| Self::decode_error("emotional_valence", valence))?;

        let category: String = row.get("category")?;
        let category = Category::parse_name(&category)
            .ok_or_else(|| Self::decode_error("category", category))?;

        let tags_json: String = row.get("emotional_tags")?;
        let emotional_tags: Vec<String> = serde_json::from_str(&tags_json)
            .map_err(|e| Self::decode_error("emotional_tags", e.to_string()))?;

        let keywords_json: String = row.get("keywords")?;
        let keywords: Vec<String> = serde_json::from_str(&keywords_json)
            .map_err(|e| Self::decode_error("keywords", e.to_string()))?;

        let relations_json: String = row.get("relations")?;
        let relations: Vec<Relation> = serde_json::from_str(&relations_json)
            .map_err(|e| Self::decode_error("relations", e.to_string()))?;

        let embedding_blob: Option<Vec<u8>> = row.get("embedding")?;
        let embedding = match embedding_blob {
            Some(bytes) => Some(
                Embedding::from_bytes(&bytes)
                    .ok_or_else(|| {
                        Self::decode_error("embedding", format!("ragged blob of {} bytes", bytes.len()))
                    })?
                    .vector,
            ),
            None => None,
        };

        Ok(MemoryRecord {
            id: row.get("id")?,
            created,
            memory_days: row.get("memory_days")?,
            recalled_since_last_batch: row.get::<_, i64>("recalled_since_last_batch")? != 0,
            recall_count: row.get("recall_count")?,
            emotional_intensity: row.get("emotional_intensity")?,
            emotional_valence: valence,
            emotional_arousal: row.get("emotional_arousal")?,
            emotional_tags,
            decay_coefficient: row.get("decay_coefficient")?,
            category,
            keywords,
            current_level: row.get("current_level")?,
            trigger: row.get("trigger")?,
            content: row.get("content")?,
            embedding,
            relations,
            retention_score: row.get("retention_score")?,
            archived_at,
            protected: row.get::<_, i64>("protected")? != 0,
            revival_requested: row.get::<_, i64>("revival_requested")? != 0,
            revival_requested_at,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RelationType;
    use crate::testing::record_fixture;

    fn temp_store() -> (tempfile::TempDir, MemoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(Some(dir.path().join("test.db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_insert_get_roundtrip() {
        let (_dir, store) = temp_store();
        let mut record = record_fixture("mem_20260101_001");
        record.embedding = Some(vec![0.25, -1.5, 3.0]);
        record.relations = vec![Relation::new("mem_20260101_002", RelationType::References)];
        record.emotional_tags = vec!["joy".into(), "感謝".into()];

        store.insert(&record).unwrap();
        let loaded = store.get("mem_20260101_001").unwrap().unwrap();

        assert_eq!(loaded.id, record.id);
        assert_eq!(loaded.created, record.created);
        assert_eq!(loaded.embedding, record.embedding);
        assert_eq!(loaded.relations, record.relations);
        assert_eq!(loaded.emotional_tags, record.emotional_tags);
        assert_eq!(loaded.emotional_valence, record.emotional_valence);
        assert!(!loaded.is_archived());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let (_dir, store) = temp_store();
        let record = record_fixture("mem_20260101_001");
        store.insert(&record).unwrap();
        match store.insert(&record) {
            Err(StoreError::DuplicateId(id)) => assert_eq!(id, "mem_20260101_001"),
            other => panic!("expected DuplicateId, got {other:?}"),
        }
    }

    #[test]
    fn test_partial_update() {
        let (_dir, store) = temp_store();
        let record = record_fixture("mem_20260101_001");
        store.insert(&record).unwrap();

        let mut patch = MemoryPatch::new();
        patch.memory_days = Some(4.5);
        patch.retention_score = Some(33.0);
        patch.trigger = Some("rewritten".to_string());
        store.update("mem_20260101_001", &patch).unwrap();

        let loaded = store.get("mem_20260101_001").unwrap().unwrap();
        assert_eq!(loaded.memory_days, 4.5);
        assert_eq!(loaded.retention_score, 33.0);
        assert_eq!(loaded.trigger, "rewritten");
        // Untouched fields survive
        assert_eq!(loaded.content, record.content);
        assert_eq!(loaded.recall_count, record.recall_count);
    }

    #[test]
    fn test_update_missing_record() {
        let (_dir, store) = temp_store();
        let mut patch = MemoryPatch::new();
        patch.memory_days = Some(1.0);
        assert!(matches!(
            store.update("mem_19990101_001", &patch),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_nullable_patch_fields() {
        let (_dir, store) = temp_store();
        let mut record = record_fixture("mem_20260101_001");
        record.archived_at = Some(record.created);
        record.current_level = 4;
        store.insert(&record).unwrap();

        let mut patch = MemoryPatch::new();
        patch.archived_at = Some(None);
        patch.current_level = Some(3);
        store.update("mem_20260101_001", &patch).unwrap();

        let loaded = store.get("mem_20260101_001").unwrap().unwrap();
        assert!(loaded.archived_at.is_none());
        assert_eq!(loaded.current_level, 3);
    }

    #[test]
    fn test_mark_recalled_skips_archived() {
        let (_dir, store) = temp_store();
        let active = record_fixture("mem_20260101_001");
        let mut archived = record_fixture("mem_20260101_002");
        archived.archived_at = Some(archived.created);
        archived.current_level = 4;
        store.insert(&active).unwrap();
        store.insert(&archived).unwrap();

        let flagged = store
            .mark_recalled(&["mem_20260101_001".to_string(), "mem_20260101_002".to_string()])
            .unwrap();
        assert_eq!(flagged, 1);

        assert!(store.get("mem_20260101_001").unwrap().unwrap().recalled_since_last_batch);
        assert!(!store.get("mem_20260101_002").unwrap().unwrap().recalled_since_last_batch);
    }

    #[test]
    fn test_active_archive_partition() {
        let (_dir, store) = temp_store();
        let active = record_fixture("mem_20260101_001");
        let mut archived = record_fixture("mem_20260101_002");
        archived.archived_at = Some(archived.created);
        archived.current_level = 4;
        store.insert(&active).unwrap();
        store.insert(&archived).unwrap();

        assert_eq!(store.get_active().unwrap().len(), 1);
        assert_eq!(store.get_archived().unwrap().len(), 1);
        assert_eq!(store.get_all().unwrap().len(), 2);
        assert_eq!(store.count(true).unwrap(), 2);
        assert_eq!(store.count(false).unwrap(), 1);
    }

    #[test]
    fn test_state_roundtrip() {
        let (_dir, store) = temp_store();
        assert_eq!(store.get_state(STATE_LAST_COMPRESSION_RUN).unwrap(), None);
        store.set_state(STATE_LAST_COMPRESSION_RUN, "2026-01-01T03:00:00+09:00").unwrap();
        assert_eq!(
            store.get_state(STATE_LAST_COMPRESSION_RUN).unwrap().as_deref(),
            Some("2026-01-01T03:00:00+09:00")
        );
        store.set_state(STATE_LAST_COMPRESSION_RUN, "2026-01-02T03:00:00+09:00").unwrap();
        assert_eq!(
            store.get_state(STATE_LAST_COMPRESSION_RUN).unwrap().as_deref(),
            Some("2026-01-02T03:00:00+09:00")
        );
    }

    #[test]
    fn test_next_memory_id_monotone_per_day() {
        let (_dir, store) = temp_store();
        let date = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        assert_eq!(store.next_memory_id(date).unwrap(), "mem_20260101_001");

        store.insert(&record_fixture("mem_20260101_001")).unwrap();
        assert_eq!(store.next_memory_id(date).unwrap(), "mem_20260101_002");

        store.insert(&record_fixture("mem_20260101_009")).unwrap();
        assert_eq!(store.next_memory_id(date).unwrap(), "mem_20260101_010");

        // Another day starts over
        let other = NaiveDate::from_ymd_opt(2026, 1, 2).unwrap();
        assert_eq!(store.next_memory_id(other).unwrap(), "mem_20260102_001");
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let (_dir, store) = temp_store();
        store.insert(&record_fixture("mem_20260101_001")).unwrap();

        let result: Result<()> = store.transaction(|tx| {
            let mut patch = MemoryPatch::new();
            patch.memory_days = Some(99.0);
            MemoryStore::apply_patch(tx, "mem_20260101_001", &patch)?;
            Err(StoreError::Init("forced failure".to_string()))
        });
        assert!(result.is_err());

        // The patch did not stick
        let loaded = store.get("mem_20260101_001").unwrap().unwrap();
        assert_ne!(loaded.memory_days, 99.0);
    }

    #[test]
    fn test_counts() {
        let (_dir, store) = temp_store();
        let mut a = record_fixture("mem_20260101_001");
        a.current_level = 1;
        let mut b = record_fixture("mem_20260101_002");
        b.current_level = 2;
        let mut c = record_fixture("mem_20260101_003");
        c.current_level = 2;
        c.protected = true;
        store.insert(&a).unwrap();
        store.insert(&b).unwrap();
        store.insert(&c).unwrap();

        assert_eq!(store.count_by_level().unwrap(), vec![(1, 1), (2, 2)]);
        assert_eq!(store.count_protected().unwrap(), 1);
        assert_eq!(store.count_active_nonprotected().unwrap(), 2);
    }

    #[test]
    fn test_delete() {
        let (_dir, store) = temp_store();
        store.insert(&record_fixture("mem_20260101_001")).unwrap();
        assert!(store.delete("mem_20260101_001").unwrap());
        assert!(!store.delete("mem_20260101_001").unwrap());
        assert!(store.get("mem_20260101_001").unwrap().is_none());
    }
}
