//! Retrieval
//!
//! Scores every active (and, when enabled, archived) embedded record
//! against a query embedding, blends in emotional resonance, and returns
//! the top-k by priority with a threshold-plus-fallback rule. Returned
//! active records are flagged for reinforcement; returned archived records
//! request revival. Both flags are written after selection, as the last
//! step.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use chrono::Local;
use lru::LruCache;

use crate::config::Config;
use crate::embeddings::{cosine_similarity, EmbeddingProvider};
use crate::memory::{EmotionState, MemoryRecord};
use crate::recall::recall_weight;
use crate::resonance::resonance_bonus;
use crate::store::{MemoryPatch, MemoryStore, Result};

/// One retrieval hit
#[derive(Debug, Clone)]
pub struct RetrievedMemory {
    pub record: MemoryRecord,
    pub priority: f64,
    pub from_archive: bool,
}

/// Retrieval priority for one candidate
pub fn priority_for(
    record: &MemoryRecord,
    query_vector: &[f32],
    current_emotion: Option<&EmotionState>,
    config: &Config,
) -> f64 {
    let similarity = match &record.embedding {
        Some(vector) => f64::from(cosine_similarity(query_vector, vector)).max(0.0),
        None => 0.0,
    };

    let base = record.retention_score
        * similarity
        * recall_weight(record.recall_count, &config.recall);

    match current_emotion {
        Some(emotion) => base + resonance_bonus(record, emotion, &config.resonance),
        None => base,
    }
}

/// Threshold-plus-fallback selection over scored candidates.
///
/// Of the candidates with positive priority, those at or above the
/// relevance threshold win if they can fill `top_k`; otherwise the best
/// `top_k` of all positive candidates are returned. Ties break toward the
/// more recently created record.
pub fn select_top_k(mut scored: Vec<RetrievedMemory>, config: &Config) -> Vec<RetrievedMemory> {
    scored.retain(|hit| hit.priority > 0.0);
    scored.sort_by(|a, b| {
        b.priority
            .partial_cmp(&a.priority)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.record.created.cmp(&a.record.created))
    });

    let top_k = config.retrieval.top_k;
    let above_threshold = scored
        .iter()
        .take_while(|hit| hit.priority >= config.retrieval.relevance_threshold)
        .count();

    if above_threshold >= top_k {
        scored.truncate(top_k);
    } else {
        scored.truncate(top_k.min(scored.len()));
    }
    scored
}

/// The retrieval pipeline
pub struct MemoryRetrieval<'a> {
    store: &'a MemoryStore,
    embedder: &'a dyn EmbeddingProvider,
    config: &'a Config,
    /// Repeat queries skip the embedding provider
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl<'a> MemoryRetrieval<'a> {
    pub fn new(
        store: &'a MemoryStore,
        embedder: &'a dyn EmbeddingProvider,
        config: &'a Config,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(100).expect("cache capacity is non-zero"),
            )),
        }
    }

    fn query_embedding(&self, query: &str) -> Option<Vec<f32>> {
        if let Ok(mut cache) = self.query_cache.lock() {
            if let Some(vector) = cache.get(query) {
                return Some(vector.clone());
            }
        }
        match self.embedder.embed(query) {
            Ok(embedding) => {
                if let Ok(mut cache) = self.query_cache.lock() {
                    cache.put(query.to_string(), embedding.vector.clone());
                }
                Some(embedding.vector)
            }
            Err(e) => {
                // No partial block: embedding failure means no memories
                tracing::warn!("query embedding failed, returning no memories: {e}");
                None
            }
        }
    }

    /// Retrieve memories relevant to `query`, marking the results.
    pub fn retrieve(
        &self,
        query: &str,
        current_emotion: Option<&EmotionState>,
    ) -> Result<Vec<RetrievedMemory>> {
        if query.trim().is_empty() || query.trim_start().starts_with('/') {
            return Ok(Vec::new());
        }

        let Some(query_vector) = self.query_embedding(query) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<RetrievedMemory> = Vec::new();

        for record in self.store.get_active()? {
            if record.embedding.is_none() {
                continue;
            }
            let priority = priority_for(&record, &query_vector, current_emotion, self.config);
            scored.push(RetrievedMemory {
                record,
                priority,
                from_archive: false,
            });
        }

        if self.config.archive.enable_archive_recall {
            for record in self.store.get_archived()? {
                if record.embedding.is_none() {
                    continue;
                }
                let priority = priority_for(&record, &query_vector, current_emotion, self.config);
                scored.push(RetrievedMemory {
                    record,
                    priority,
                    from_archive: true,
                });
            }
        }

        let selected = select_top_k(scored, self.config);

        // Side effects come last so a failure never leaves a half-marked set
        let active_ids: Vec<String> = selected
            .iter()
            .filter(|hit| !hit.from_archive)
            .map(|hit| hit.record.id.clone())
            .collect();
        self.store.mark_recalled(&active_ids)?;

        let now = Local::now().fixed_offset();
        for hit in selected.iter().filter(|hit| hit.from_archive) {
            let mut patch = MemoryPatch::new();
            patch.revival_requested = Some(true);
            patch.revival_requested_at = Some(Some(now));
            self.store.update(&hit.record.id, &patch)?;
        }

        Ok(selected)
    }
}

/// Render the inline `<memories>` block. `None` when nothing was selected.
pub fn render_memories_block(results: &[RetrievedMemory]) -> Option<String> {
    if results.is_empty() {
        return None;
    }

    let mut lines = vec!["<memories>".to_string()];
    for hit in results {
        let marker = if hit.from_archive { "[archived]" } else { "" };
        lines.push(format!(
            "- [{}][L{}]{} {} → {}",
            hit.record.created.format("%Y-%m-%d"),
            hit.record.current_level,
            marker,
            hit.record.trigger,
            hit.record.content,
        ));
    }
    lines.push("</memories>".to_string());
    Some(lines.join("\n"))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::DeterministicEmbedding;
    use crate::memory::Valence;
    use crate::testing::record_fixture;
    use chrono::DateTime;

    fn temp_store() -> (tempfile::TempDir, MemoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(Some(dir.path().join("test.db"))).unwrap();
        (dir, store)
    }

    fn hit(id: &str, priority: f64, created: &str) -> RetrievedMemory {
        let mut record = record_fixture(id);
        record.created = DateTime::parse_from_rfc3339(created).unwrap();
        RetrievedMemory {
            record,
            priority,
            from_archive: false,
        }
    }

    #[test]
    fn test_priority_base_formula() {
        let config = Config::default();
        let mut record = record_fixture("mem_20260101_001");
        record.retention_score = 60.0;
        record.recall_count = 0;
        record.embedding = Some(vec![1.0, 0.0]);

        // S5: score 60, cosine 0.9 -> priority 54
        let query = vec![0.9, (1.0_f32 - 0.81).sqrt()];
        let priority = priority_for(&record, &query, None, &config);
        assert!((priority - 54.0).abs() < 0.05);

        // Negative similarity clamps to zero
        let opposite = vec![-1.0, 0.0];
        assert_eq!(priority_for(&record, &opposite, None, &config), 0.0);
    }

    #[test]
    fn test_priority_recall_weight() {
        let config = Config::default();
        let mut record = record_fixture("mem_20260101_001");
        record.retention_score = 10.0;
        record.recall_count = 3;
        record.embedding = Some(vec![1.0, 0.0]);

        let priority = priority_for(&record, &[1.0, 0.0], None, &config);
        assert!((priority - 13.0).abs() < 1e-6);
    }

    #[test]
    fn test_priority_resonance_bonus() {
        let config = Config::default();
        let mut record = record_fixture("mem_20260101_001");
        record.retention_score = 40.0;
        record.embedding = Some(vec![1.0, 0.0]);
        record.emotional_valence = Valence::Positive;
        record.emotional_arousal = 50;
        record.emotional_tags.clear();

        let emotion = EmotionState {
            valence: Valence::Positive,
            arousal: 50,
            tags: vec![],
        };
        let without = priority_for(&record, &[1.0, 0.0], None, &config);
        let with = priority_for(&record, &[1.0, 0.0], Some(&emotion), &config);
        // resonance = 0.3 + 0.2 = 0.5; bonus = 0.3 * 0.5 * 40 = 6
        assert!((with - without - 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_select_orders_by_priority() {
        let config = Config::default();
        // S5: both above threshold, higher priority first
        let selected = select_top_k(
            vec![
                hit("mem_20260101_001", 54.0, "2026-01-01T12:00:00+09:00"),
                hit("mem_20260101_002", 38.0, "2026-01-02T12:00:00+09:00"),
            ],
            &config,
        );
        assert_eq!(selected[0].record.id, "mem_20260101_001");
        assert_eq!(selected[1].record.id, "mem_20260101_002");
    }

    #[test]
    fn test_select_tie_breaks_to_recent() {
        let config = Config::default();
        let selected = select_top_k(
            vec![
                hit("mem_20260101_001", 10.0, "2026-01-01T12:00:00+09:00"),
                hit("mem_20260103_001", 10.0, "2026-01-03T12:00:00+09:00"),
            ],
            &config,
        );
        assert_eq!(selected[0].record.id, "mem_20260103_001");
    }

    #[test]
    fn test_select_fallback_below_threshold() {
        let config = Config::default();
        // All below the threshold of 5: fallback returns the positive ones
        let selected = select_top_k(
            vec![
                hit("mem_20260101_001", 1.0, "2026-01-01T12:00:00+09:00"),
                hit("mem_20260101_002", 0.0, "2026-01-01T13:00:00+09:00"),
                hit("mem_20260101_003", 2.0, "2026-01-01T14:00:00+09:00"),
            ],
            &config,
        );
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].record.id, "mem_20260101_003");
    }

    #[test]
    fn test_select_truncates_to_top_k() {
        let mut config = Config::default();
        config.retrieval.top_k = 2;
        let selected = select_top_k(
            vec![
                hit("mem_20260101_001", 50.0, "2026-01-01T12:00:00+09:00"),
                hit("mem_20260101_002", 40.0, "2026-01-01T12:00:00+09:00"),
                hit("mem_20260101_003", 30.0, "2026-01-01T12:00:00+09:00"),
            ],
            &config,
        );
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn test_retrieve_empty_store() {
        let (_dir, store) = temp_store();
        let embedder = DeterministicEmbedding::new(32);
        let config = Config::default();
        let retrieval = MemoryRetrieval::new(&store, &embedder, &config);

        let out = retrieval.retrieve("anything", None).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_retrieve_slash_command_returns_empty() {
        let (_dir, store) = temp_store();
        store.insert(&record_fixture("mem_20260101_001")).unwrap();
        let embedder = DeterministicEmbedding::new(32);
        let config = Config::default();
        let retrieval = MemoryRetrieval::new(&store, &embedder, &config);

        assert!(retrieval.retrieve("/help", None).unwrap().is_empty());
    }

    #[test]
    fn test_retrieve_marks_active_results() {
        let (_dir, store) = temp_store();
        let embedder = DeterministicEmbedding::new(32);
        let config = Config::default();

        let mut record = record_fixture("mem_20260101_001");
        record.retention_score = 50.0;
        record.embedding = Some(embedder.embed("favorite deploy ritual").unwrap().vector);
        store.insert(&record).unwrap();

        let retrieval = MemoryRetrieval::new(&store, &embedder, &config);
        let out = retrieval.retrieve("favorite deploy ritual", None).unwrap();
        assert_eq!(out.len(), 1);
        assert!(!out[0].from_archive);

        let loaded = store.get("mem_20260101_001").unwrap().unwrap();
        assert!(loaded.recalled_since_last_batch);
    }

    #[test]
    fn test_retrieve_flags_archived_for_revival() {
        let (_dir, store) = temp_store();
        let embedder = DeterministicEmbedding::new(32);
        let config = Config::default();

        let mut record = record_fixture("mem_20260101_001");
        record.archived_at = Some(record.created);
        record.current_level = 4;
        record.retention_score = 50.0;
        record.embedding = Some(embedder.embed("the old project name").unwrap().vector);
        store.insert(&record).unwrap();

        let retrieval = MemoryRetrieval::new(&store, &embedder, &config);
        let out = retrieval.retrieve("the old project name", None).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].from_archive);

        let loaded = store.get("mem_20260101_001").unwrap().unwrap();
        assert!(loaded.revival_requested);
        assert!(loaded.revival_requested_at.is_some());
        assert!(!loaded.recalled_since_last_batch);
    }

    #[test]
    fn test_archive_recall_disabled() {
        let (_dir, store) = temp_store();
        let embedder = DeterministicEmbedding::new(32);
        let mut config = Config::default();
        config.archive.enable_archive_recall = false;

        let mut record = record_fixture("mem_20260101_001");
        record.archived_at = Some(record.created);
        record.current_level = 4;
        record.retention_score = 50.0;
        record.embedding = Some(embedder.embed("archived topic").unwrap().vector);
        store.insert(&record).unwrap();

        let retrieval = MemoryRetrieval::new(&store, &embedder, &config);
        assert!(retrieval.retrieve("archived topic", None).unwrap().is_empty());
    }

    #[test]
    fn test_render_memories_block() {
        let mut plain = hit("mem_20260101_001", 10.0, "2026-01-01T12:00:00+09:00");
        plain.record.trigger = "asked about deploys".to_string();
        plain.record.content = "walked through the pipeline".to_string();
        plain.record.current_level = 2;

        let mut archived = hit("mem_20251201_001", 8.0, "2025-12-01T09:00:00+09:00");
        archived.from_archive = true;
        archived.record.current_level = 4;
        archived.record.trigger = "old incident".to_string();
        archived.record.content = "postmortem notes".to_string();

        let block = render_memories_block(&[plain, archived]).unwrap();
        assert_eq!(
            block,
            "<memories>\n\
             - [2026-01-01][L2] asked about deploys → walked through the pipeline\n\
             - [2025-12-01][L4][archived] old incident → postmortem notes\n\
             </memories>"
        );

        assert!(render_memories_block(&[]).is_none());
    }
}
