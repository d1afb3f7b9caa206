//! Emotional resonance
//!
//! When retrieval runs with a current emotion context, memories that match
//! the mood score a bonus: shared valence, close arousal, overlapping
//! emotion tags.

use std::collections::HashSet;

use crate::config::ResonanceConfig;
use crate::memory::{EmotionState, MemoryRecord};

/// Resonance between a memory's affect profile and the current emotion.
/// Sum of the valence, arousal and tag components, roughly in [0, 1].
pub fn resonance(record: &MemoryRecord, current: &EmotionState, config: &ResonanceConfig) -> f64 {
    let mut score = 0.0;

    if record.emotional_valence == current.valence {
        score += config.valence_match_bonus;
    }

    let arousal_diff = f64::from((record.emotional_arousal - current.arousal).abs()) / 100.0;
    score += (config.arousal_proximity_bonus * (1.0 - arousal_diff)).max(0.0);

    if !record.emotional_tags.is_empty() && !current.tags.is_empty() {
        let memory_tags: HashSet<&str> = record.emotional_tags.iter().map(String::as_str).collect();
        let current_tags: HashSet<&str> = current.tags.iter().map(String::as_str).collect();
        let overlap = memory_tags.intersection(&current_tags).count();
        let denom = memory_tags.len().max(current_tags.len());
        score += overlap as f64 / denom as f64 * config.tags_overlap_weight;
    }

    score
}

/// Priority bonus contributed by resonance: `alpha * resonance * retention_score`
pub fn resonance_bonus(
    record: &MemoryRecord,
    current: &EmotionState,
    config: &ResonanceConfig,
) -> f64 {
    config.priority_weight_alpha * resonance(record, current, config) * record.retention_score
}
