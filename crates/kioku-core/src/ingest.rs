//! Ingestion
//!
//! Turns a conversation turn into a level-1 memory record: affect analysis,
//! decay coefficient, embedding, and insert. Provider failures abort the
//! single turn; the rest of the session proceeds.

use chrono::{DateTime, FixedOffset, Timelike};

use crate::config::Config;
use crate::embeddings::{EmbeddingError, EmbeddingProvider};
use crate::memory::{MemoryRecord, LEVEL_FULL};
use crate::providers::{AnalysisProvider, ProviderError};
use crate::retention;
use crate::store::{MemoryStore, StoreError};

/// A single conversation turn handed over by the host transcript extractor
#[derive(Debug, Clone)]
pub struct Turn {
    pub user_text: String,
    pub assistant_text: String,
    pub timestamp: DateTime<FixedOffset>,
}

/// Ingestion error
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}

/// One ingested record plus its advisories
#[derive(Debug)]
pub struct IngestedMemory {
    pub record: MemoryRecord,
    /// True when the protected-count limit forced `protected = false`
    pub protection_overflow: bool,
}

/// Summary of a session ingestion
#[derive(Debug, Default)]
pub struct SessionIngest {
    pub created: Vec<MemoryRecord>,
    pub skipped: usize,
    pub failed: usize,
    pub protection_overflows: usize,
}

/// Whether a turn is a host command rather than conversation
pub fn should_skip(user_text: &str) -> bool {
    let stripped = user_text.trim();
    if stripped.is_empty() {
        return true;
    }
    stripped.starts_with('/') || stripped.contains("<command-name>/")
}

/// Fractional days from `now` until the next occurrence of the batch hour
pub fn initial_memory_days(now: DateTime<FixedOffset>, schedule_hour: u32) -> f64 {
    let today_at_hour = now
        .with_hour(schedule_hour)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    let next = if today_at_hour <= now {
        today_at_hour + chrono::Duration::days(1)
    } else {
        today_at_hour
    };
    (next - now).num_seconds() as f64 / 86_400.0
}

/// The ingestion pipeline
pub struct MemoryIngestor<'a> {
    store: &'a MemoryStore,
    analysis: &'a dyn AnalysisProvider,
    embedder: &'a dyn EmbeddingProvider,
    config: &'a Config,
}

impl<'a> MemoryIngestor<'a> {
    pub fn new(
        store: &'a MemoryStore,
        analysis: &'a dyn AnalysisProvider,
        embedder: &'a dyn EmbeddingProvider,
        config: &'a Config,
    ) -> Self {
        Self {
            store,
            analysis,
            embedder,
            config,
        }
    }

    /// Ingest one turn. Returns `None` for host-command turns.
    pub fn ingest_turn(&self, turn: &Turn) -> Result<Option<IngestedMemory>, IngestError> {
        if should_skip(&turn.user_text) {
            return Ok(None);
        }

        let analysis = self.analysis.analyze_turn(&turn.user_text, &turn.assistant_text)?;

        let decay_coefficient = retention::initial_decay_coefficient(
            analysis.category,
            analysis.emotional_intensity,
            &self.config.retention,
        );

        let embedding_text = format!("{} {}", analysis.trigger, analysis.content);
        let embedding = self.embedder.embed(&embedding_text)?;

        let memory_days = initial_memory_days(turn.timestamp, self.config.compression.schedule_hour);
        let retention_score = f64::from(analysis.emotional_intensity);

        // Over the protected-record limit the memory is still kept, just
        // unprotected, and the overflow is surfaced as an advisory.
        let mut protection_overflow = false;
        let protected = if analysis.protected {
            let current = self.store.count_protected()?;
            if current >= self.config.protection.max_protected_memories as i64 {
                tracing::warn!(
                    "protected memory limit reached ({current}); storing unprotected"
                );
                protection_overflow = true;
                false
            } else {
                true
            }
        } else {
            false
        };

        let mut record = MemoryRecord {
            id: String::new(),
            created: turn.timestamp,
            memory_days,
            recalled_since_last_batch: false,
            recall_count: 0,
            emotional_intensity: analysis.emotional_intensity,
            emotional_valence: analysis.emotional_valence,
            emotional_arousal: analysis.emotional_arousal,
            emotional_tags: analysis.emotional_tags,
            decay_coefficient,
            category: analysis.category,
            keywords: analysis.keywords,
            current_level: LEVEL_FULL,
            trigger: analysis.trigger,
            content: analysis.content,
            embedding: Some(embedding.vector),
            relations: vec![],
            retention_score,
            archived_at: None,
            protected,
            revival_requested: false,
            revival_requested_at: None,
        };

        // A concurrent ingestor can race the suffix; regenerate and retry
        const MAX_ID_ATTEMPTS: usize = 5;
        let date = turn.timestamp.date_naive();
        for attempt in 0.. {
            record.id = self.store.next_memory_id(date)?;
            match self.store.insert(&record) {
                Ok(()) => break,
                Err(StoreError::DuplicateId(_)) if attempt + 1 < MAX_ID_ATTEMPTS => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(Some(IngestedMemory {
            record,
            protection_overflow,
        }))
    }

    /// Ingest a whole session in order. Provider failures skip the affected
    /// turn; store failures abort the session.
    pub fn ingest_turns(&self, turns: &[Turn]) -> Result<SessionIngest, StoreError> {
        let mut report = SessionIngest::default();

        for (index, turn) in turns.iter().enumerate() {
            match self.ingest_turn(turn) {
                Ok(Some(ingested)) => {
                    if ingested.protection_overflow {
                        report.protection_overflows += 1;
                    }
                    report.created.push(ingested.record);
                }
                Ok(None) => report.skipped += 1,
                Err(IngestError::Store(e)) => return Err(e),
                Err(e) => {
                    tracing::warn!("turn {index} skipped: {e}");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::DeterministicEmbedding;
    use crate::memory::Category;
    use crate::providers::ScriptedAnalysis;
    use crate::testing::analysis_fixture;

    fn at(rfc3339: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap()
    }

    fn turn(user: &str, assistant: &str) -> Turn {
        Turn {
            user_text: user.to_string(),
            assistant_text: assistant.to_string(),
            timestamp: at("2026-01-15T18:00:00+09:00"),
        }
    }

    fn temp_store() -> (tempfile::TempDir, MemoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(Some(dir.path().join("test.db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_should_skip() {
        assert!(should_skip("/help"));
        assert!(should_skip("  /compact"));
        assert!(should_skip("<command-name>/commit</command-name>"));
        assert!(should_skip(""));
        assert!(should_skip("   "));
        assert!(!should_skip("what did we decide yesterday?"));
    }

    #[test]
    fn test_initial_memory_days() {
        // 18:00 with batch at 03:00 -> 9 hours -> 0.375 days
        let days = initial_memory_days(at("2026-01-15T18:00:00+09:00"), 3);
        assert!((days - 0.375).abs() < 1e-9);

        // 02:00 with batch at 03:00 -> 1 hour ahead today
        let days = initial_memory_days(at("2026-01-15T02:00:00+09:00"), 3);
        assert!((days - 1.0 / 24.0).abs() < 1e-9);

        // Exactly at the batch hour -> a full day
        let days = initial_memory_days(at("2026-01-15T03:00:00+09:00"), 3);
        assert!((days - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_ingest_turn_builds_level1_record() {
        let (_dir, store) = temp_store();
        let analysis = ScriptedAnalysis::new(analysis_fixture(45, Category::Work));
        let embedder = DeterministicEmbedding::new(32);
        let config = Config::default();
        let ingestor = MemoryIngestor::new(&store, &analysis, &embedder, &config);

        let ingested = ingestor
            .ingest_turn(&turn("how do we deploy?", "push to main and CI does the rest"))
            .unwrap()
            .unwrap();

        let record = &ingested.record;
        assert_eq!(record.id, "mem_20260115_001");
        assert_eq!(record.current_level, 1);
        assert_eq!(record.emotional_intensity, 45);
        // S1: work at intensity 45 -> 0.8815
        assert!((record.decay_coefficient - 0.8815).abs() < 1e-9);
        // Score at zero aging equals intensity
        assert!((record.retention_score - 45.0).abs() < 1e-9);
        // 18:00 -> 03:00 is 9 hours
        assert!((record.memory_days - 0.375).abs() < 1e-9);
        assert!(record.embedding.is_some());
        assert!(!ingested.protection_overflow);

        assert!(store.get("mem_20260115_001").unwrap().is_some());
    }

    #[test]
    fn test_slash_command_skipped() {
        let (_dir, store) = temp_store();
        let analysis = ScriptedAnalysis::new(analysis_fixture(45, Category::Casual));
        let embedder = DeterministicEmbedding::new(32);
        let config = Config::default();
        let ingestor = MemoryIngestor::new(&store, &analysis, &embedder, &config);

        let out = ingestor.ingest_turn(&turn("/status", "ok")).unwrap();
        assert!(out.is_none());
        assert_eq!(store.count(true).unwrap(), 0);
    }

    #[test]
    fn test_provider_failure_skips_turn_only() {
        let (_dir, store) = temp_store();
        let analysis = ScriptedAnalysis::new(analysis_fixture(45, Category::Casual));
        analysis.fail.store(true, std::sync::atomic::Ordering::Relaxed);
        let embedder = DeterministicEmbedding::new(32);
        let config = Config::default();
        let ingestor = MemoryIngestor::new(&store, &analysis, &embedder, &config);

        let turns = vec![turn("a", "b"), turn("c", "d")];
        let report = ingestor.ingest_turns(&turns).unwrap();
        assert_eq!(report.failed, 2);
        assert!(report.created.is_empty());
        assert_eq!(store.count(true).unwrap(), 0);
    }

    #[test]
    fn test_session_ids_are_monotone() {
        let (_dir, store) = temp_store();
        let analysis = ScriptedAnalysis::new(analysis_fixture(45, Category::Casual));
        let embedder = DeterministicEmbedding::new(32);
        let config = Config::default();
        let ingestor = MemoryIngestor::new(&store, &analysis, &embedder, &config);

        let turns = vec![turn("one", "1"), turn("/skip", "x"), turn("two", "2")];
        let report = ingestor.ingest_turns(&turns).unwrap();

        assert_eq!(report.skipped, 1);
        let ids: Vec<&str> = report.created.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["mem_20260115_001", "mem_20260115_002"]);
    }

    #[test]
    fn test_protection_limit_overflow() {
        let (_dir, store) = temp_store();
        let mut fixture = analysis_fixture(45, Category::Emotional);
        fixture.protected = true;
        let analysis = ScriptedAnalysis::new(fixture);
        let embedder = DeterministicEmbedding::new(32);
        let mut config = Config::default();
        config.protection.max_protected_memories = 1;
        let ingestor = MemoryIngestor::new(&store, &analysis, &embedder, &config);

        let first = ingestor.ingest_turn(&turn("keep this", "noted")).unwrap().unwrap();
        assert!(first.record.protected);
        assert!(!first.protection_overflow);

        let second = ingestor.ingest_turn(&turn("this too", "noted")).unwrap().unwrap();
        assert!(!second.record.protected);
        assert!(second.protection_overflow);
    }
}
