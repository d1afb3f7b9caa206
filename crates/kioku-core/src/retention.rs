//! Retention mathematics
//!
//! The forgetting model: every memory carries a decay coefficient chosen at
//! ingestion from its category range (interpolated by emotional intensity),
//! and its retention score decays exponentially with aged days:
//!
//! `retention_score = intensity * coefficient^memory_days`
//!
//! Scores classify into four tiers; tier 4 is the archive.

use crate::config::{LevelsConfig, RetentionConfig};
use crate::memory::{Category, MemoryRecord, LEVEL_ARCHIVE, LEVEL_FULL, LEVEL_KEYWORDS, LEVEL_SUMMARY};

/// Initial decay coefficient, linearly interpolated within the category range
/// by intensity: higher intensity means slower forgetting.
pub fn initial_decay_coefficient(
    category: Category,
    emotional_intensity: i32,
    retention: &RetentionConfig,
) -> f64 {
    let range = retention.decay_range(category);
    let ratio = f64::from(emotional_intensity.clamp(0, 100)) / 100.0;
    range.min + (range.max - range.min) * ratio
}

/// Retention score after `memory_days` of aging.
///
/// Computed as `intensity * exp(days * ln(coefficient))` so large day counts
/// neither overflow nor produce NaN. A non-positive coefficient scores 0.
pub fn retention_score(emotional_intensity: i32, decay_coefficient: f64, memory_days: f64) -> f64 {
    if decay_coefficient <= 0.0 {
        return 0.0;
    }
    f64::from(emotional_intensity) * (memory_days * decay_coefficient.ln()).exp()
}

/// Recompute a record's score from its current fields
pub fn rescore(record: &MemoryRecord) -> f64 {
    retention_score(
        record.emotional_intensity,
        record.decay_coefficient,
        record.memory_days,
    )
}

/// Natural tier for a score: L1 above 50, L2 above 20, L3 above 5, else archive
pub fn level_for_score(score: f64, levels: &LevelsConfig) -> i32 {
    if score > levels.level1_threshold {
        LEVEL_FULL
    } else if score > levels.level2_threshold {
        LEVEL_SUMMARY
    } else if score > levels.level3_threshold {
        LEVEL_KEYWORDS
    } else {
        LEVEL_ARCHIVE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_coefficient_interpolation() {
        let config = Config::default();

        // Work at intensity 45: 0.85 + (0.92 - 0.85) * 0.45 = 0.8815
        let coeff = initial_decay_coefficient(Category::Work, 45, &config.retention);
        assert!((coeff - 0.8815).abs() < 1e-9);

        // Endpoints
        let low = initial_decay_coefficient(Category::Casual, 0, &config.retention);
        assert!((low - 0.70).abs() < 1e-9);
        let high = initial_decay_coefficient(Category::Emotional, 100, &config.retention);
        assert!((high - 0.999).abs() < 1e-9);

        // Out-of-range intensity clamps
        let clamped = initial_decay_coefficient(Category::Casual, 200, &config.retention);
        assert!((clamped - 0.80).abs() < 1e-9);
    }

    #[test]
    fn test_score_decay() {
        // Zero days: score equals intensity
        assert!((retention_score(45, 0.8815, 0.0) - 45.0).abs() < 1e-9);

        // S1: 45 * 0.8815^1.375 ~ 38.4
        let s = retention_score(45, 0.8815, 1.375);
        assert!((s - 38.4).abs() < 0.1);

        // Zero intensity scores zero forever
        assert_eq!(retention_score(0, 0.95, 3.0), 0.0);

        // Defensive: non-positive coefficient
        assert_eq!(retention_score(80, 0.0, 1.0), 0.0);
        assert_eq!(retention_score(80, -0.5, 1.0), 0.0);
    }

    #[test]
    fn test_half_life_at_max_coefficient() {
        // intensity 100, coeff 0.999: half-life ~ ln(0.5)/ln(0.999) ~ 693 days
        let half = retention_score(100, 0.999, 693.0);
        assert!((half - 50.0).abs() < 0.1);
    }

    #[test]
    fn test_no_overflow_on_huge_day_counts() {
        let s = retention_score(100, 0.70, 1.0e6);
        assert!(s.is_finite());
        assert!(s >= 0.0);
    }

    #[test]
    fn test_level_classification() {
        let levels = Config::default().levels;

        assert_eq!(level_for_score(80.0, &levels), LEVEL_FULL);
        assert_eq!(level_for_score(50.0, &levels), LEVEL_SUMMARY); // boundary: L1 requires > 50
        assert_eq!(level_for_score(38.4, &levels), LEVEL_SUMMARY);
        assert_eq!(level_for_score(20.0, &levels), LEVEL_KEYWORDS);
        assert_eq!(level_for_score(5.1, &levels), LEVEL_KEYWORDS);
        assert_eq!(level_for_score(5.0, &levels), LEVEL_ARCHIVE);
        assert_eq!(level_for_score(0.0, &levels), LEVEL_ARCHIVE);
    }
}
