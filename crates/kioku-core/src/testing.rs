//! Test fixtures
//!
//! Shared by the colocated unit tests and the integration suites. Nothing
//! here touches the network.

use chrono::DateTime;

use crate::memory::{Category, MemoryRecord, TurnAnalysis, Valence};

/// A plain active level-1 record with neutral affect and a known creation time
pub fn record_fixture(id: &str) -> MemoryRecord {
    MemoryRecord {
        id: id.to_string(),
        created: DateTime::parse_from_rfc3339("2026-01-01T12:00:00+09:00").unwrap(),
        memory_days: 0.5,
        recalled_since_last_batch: false,
        recall_count: 0,
        emotional_intensity: 50,
        emotional_valence: Valence::Neutral,
        emotional_arousal: 50,
        emotional_tags: vec![],
        decay_coefficient: 0.90,
        category: Category::Work,
        keywords: vec![],
        current_level: 1,
        trigger: format!("trigger for {id}"),
        content: format!("content for {id}"),
        embedding: None,
        relations: vec![],
        retention_score: 50.0,
        archived_at: None,
        protected: false,
        revival_requested: false,
        revival_requested_at: None,
    }
}

/// A turn analysis with the given affect numbers
pub fn analysis_fixture(intensity: i32, category: Category) -> TurnAnalysis {
    TurnAnalysis {
        emotional_intensity: intensity,
        emotional_valence: Valence::Positive,
        emotional_arousal: 30,
        emotional_tags: vec!["joy".to_string()],
        category,
        keywords: vec!["keyword".to_string()],
        trigger: String::new(),
        content: String::new(),
        protected: false,
    }
}
