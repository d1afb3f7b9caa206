//! Recall reinforcement
//!
//! A recalled memory ages backwards: its day count halves, its decay
//! coefficient firms up, and its recall count grows. The daily batch applies
//! this to every record flagged `recalled_since_last_batch`.

use crate::config::{RecallConfig, RetentionConfig};
use crate::memory::MemoryRecord;

/// The field changes reinforcement applies to one recalled record
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reinforcement {
    pub memory_days: f64,
    pub decay_coefficient: f64,
    pub recall_count: i32,
}

/// Compute the reinforcement for a recalled record
pub fn reinforce(
    record: &MemoryRecord,
    recall: &RecallConfig,
    retention: &RetentionConfig,
) -> Reinforcement {
    Reinforcement {
        memory_days: record.memory_days * recall.memory_days_reduction,
        decay_coefficient: (record.decay_coefficient + recall.decay_coefficient_boost)
            .min(retention.max_decay_coefficient),
        recall_count: record.recall_count + 1,
    }
}

/// Retrieval weight for a recall history: `1 + weight * recall_count`
pub fn recall_weight(recall_count: i32, recall: &RecallConfig) -> f64 {
    1.0 + recall.recall_count_weight * f64::from(recall_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testing::record_fixture;

    #[test]
    fn test_reinforce_halves_days_and_boosts_coefficient() {
        let config = Config::default();
        let mut record = record_fixture("mem_20260101_001");
        record.memory_days = 10.0;
        record.decay_coefficient = 0.90;
        record.recall_count = 0;

        let update = reinforce(&record, &config.recall, &config.retention);
        assert!((update.memory_days - 5.0).abs() < 1e-9);
        assert!((update.decay_coefficient - 0.92).abs() < 1e-9);
        assert_eq!(update.recall_count, 1);
    }

    #[test]
    fn test_coefficient_caps_at_max() {
        let config = Config::default();
        let mut record = record_fixture("mem_20260101_001");
        record.decay_coefficient = 0.995;

        let update = reinforce(&record, &config.recall, &config.retention);
        assert!((update.decay_coefficient - 0.999).abs() < 1e-9);

        // Already at the cap: stays put
        record.decay_coefficient = 0.999;
        let update = reinforce(&record, &config.recall, &config.retention);
        assert!((update.decay_coefficient - 0.999).abs() < 1e-9);
    }

    #[test]
    fn test_recall_weight() {
        let recall = Config::default().recall;
        assert!((recall_weight(0, &recall) - 1.0).abs() < 1e-9);
        assert!((recall_weight(3, &recall) - 1.3).abs() < 1e-9);
    }
}
