//! Configuration loading
//!
//! A single JSON document with per-concern sections. Missing keys take the
//! defaults below; unknown keys are ignored. Validation errors are fatal at
//! startup.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::memory::Category;

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Bad config: {0}")]
    Invalid(String),
}

/// Engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub levels: LevelsConfig,
    #[serde(default)]
    pub recall: RecallConfig,
    #[serde(default)]
    pub resonance: ResonanceConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub relations: RelationsConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub protection: ProtectionConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

impl Config {
    /// Load from a JSON file, falling back to defaults when the file is absent
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            serde_json::from_str(&text)?
        } else {
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Range-check the loaded values. Fatal at startup when violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for category in [
            Category::Casual,
            Category::Work,
            Category::Decision,
            Category::Emotional,
        ] {
            let range = self.retention.decay_range(category);
            if !(0.0..=1.0).contains(&range.min)
                || !(0.0..=1.0).contains(&range.max)
                || range.min > range.max
            {
                return Err(ConfigError::Invalid(format!(
                    "decay range for {} must satisfy 0 <= min <= max <= 1, got [{}, {}]",
                    category, range.min, range.max
                )));
            }
        }
        let levels = &self.levels;
        if !(levels.level1_threshold > levels.level2_threshold
            && levels.level2_threshold > levels.level3_threshold
            && levels.level3_threshold >= 0.0)
        {
            return Err(ConfigError::Invalid(format!(
                "level thresholds must be strictly descending and non-negative, got {}/{}/{}",
                levels.level1_threshold, levels.level2_threshold, levels.level3_threshold
            )));
        }
        for (name, ratio) in [
            ("level1", levels.target_ratios.level1),
            ("level2", levels.target_ratios.level2),
            ("level3", levels.target_ratios.level3),
        ] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(ConfigError::Invalid(format!(
                    "target ratio {} must be within (0, 1], got {}",
                    name, ratio
                )));
            }
        }
        if self.compression.schedule_hour > 23 {
            return Err(ConfigError::Invalid(format!(
                "schedule_hour must be 0-23, got {}",
                self.compression.schedule_hour
            )));
        }
        if self.embedding.dimensions == 0 {
            return Err(ConfigError::Invalid(
                "embedding dimensions must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// SECTIONS
// ============================================================================

/// Decay coefficient range for one category
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DecayRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecayByCategory {
    #[serde(default = "default_casual_range")]
    pub casual: DecayRange,
    #[serde(default = "default_work_range")]
    pub work: DecayRange,
    #[serde(default = "default_decision_range")]
    pub decision: DecayRange,
    #[serde(default = "default_emotional_range")]
    pub emotional: DecayRange,
}

fn default_casual_range() -> DecayRange {
    DecayRange { min: 0.70, max: 0.80 }
}
fn default_work_range() -> DecayRange {
    DecayRange { min: 0.85, max: 0.92 }
}
fn default_decision_range() -> DecayRange {
    DecayRange { min: 0.93, max: 0.97 }
}
fn default_emotional_range() -> DecayRange {
    DecayRange { min: 0.98, max: 0.999 }
}

impl Default for DecayByCategory {
    fn default() -> Self {
        Self {
            casual: default_casual_range(),
            work: default_work_range(),
            decision: default_decision_range(),
            emotional: default_emotional_range(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default)]
    pub decay_by_category: DecayByCategory,
    #[serde(default = "default_max_decay")]
    pub max_decay_coefficient: f64,
}

fn default_max_decay() -> f64 {
    0.999
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            decay_by_category: DecayByCategory::default(),
            max_decay_coefficient: default_max_decay(),
        }
    }
}

impl RetentionConfig {
    pub fn decay_range(&self, category: Category) -> DecayRange {
        match category {
            Category::Casual => self.decay_by_category.casual,
            Category::Work => self.decay_by_category.work,
            Category::Decision => self.decay_by_category.decision,
            Category::Emotional => self.decay_by_category.emotional,
        }
    }
}

/// Target share of the non-protected active population per tier.
/// The remainder (20% by default) is the archive's share.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TargetRatios {
    #[serde(default = "default_ratio_l1")]
    pub level1: f64,
    #[serde(default = "default_ratio_l2")]
    pub level2: f64,
    #[serde(default = "default_ratio_l3")]
    pub level3: f64,
}

fn default_ratio_l1() -> f64 {
    0.15
}
fn default_ratio_l2() -> f64 {
    0.30
}
fn default_ratio_l3() -> f64 {
    0.35
}

impl Default for TargetRatios {
    fn default() -> Self {
        Self {
            level1: default_ratio_l1(),
            level2: default_ratio_l2(),
            level3: default_ratio_l3(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelsConfig {
    #[serde(default = "default_l1_threshold")]
    pub level1_threshold: f64,
    #[serde(default = "default_l2_threshold")]
    pub level2_threshold: f64,
    #[serde(default = "default_l3_threshold")]
    pub level3_threshold: f64,
    #[serde(default)]
    pub target_ratios: TargetRatios,
}

fn default_l1_threshold() -> f64 {
    50.0
}
fn default_l2_threshold() -> f64 {
    20.0
}
fn default_l3_threshold() -> f64 {
    5.0
}

impl Default for LevelsConfig {
    fn default() -> Self {
        Self {
            level1_threshold: default_l1_threshold(),
            level2_threshold: default_l2_threshold(),
            level3_threshold: default_l3_threshold(),
            target_ratios: TargetRatios::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallConfig {
    #[serde(default = "default_decay_boost")]
    pub decay_coefficient_boost: f64,
    #[serde(default = "default_days_reduction")]
    pub memory_days_reduction: f64,
    #[serde(default = "default_recall_weight")]
    pub recall_count_weight: f64,
}

fn default_decay_boost() -> f64 {
    0.02
}
fn default_days_reduction() -> f64 {
    0.5
}
fn default_recall_weight() -> f64 {
    0.1
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            decay_coefficient_boost: default_decay_boost(),
            memory_days_reduction: default_days_reduction(),
            recall_count_weight: default_recall_weight(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResonanceConfig {
    #[serde(default = "default_valence_bonus")]
    pub valence_match_bonus: f64,
    #[serde(default = "default_arousal_bonus")]
    pub arousal_proximity_bonus: f64,
    #[serde(default = "default_tags_weight")]
    pub tags_overlap_weight: f64,
    #[serde(default = "default_alpha")]
    pub priority_weight_alpha: f64,
}

fn default_valence_bonus() -> f64 {
    0.3
}
fn default_arousal_bonus() -> f64 {
    0.2
}
fn default_tags_weight() -> f64 {
    0.5
}
fn default_alpha() -> f64 {
    0.3
}

impl Default for ResonanceConfig {
    fn default() -> Self {
        Self {
            valence_match_bonus: default_valence_bonus(),
            arousal_proximity_bonus: default_arousal_bonus(),
            tags_overlap_weight: default_tags_weight(),
            priority_weight_alpha: default_alpha(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Local hour at which the daily batch is scheduled (0-23)
    #[serde(default = "default_schedule_hour")]
    pub schedule_hour: u32,
    #[serde(default = "default_interval_hours")]
    pub interval_hours: i64,
}

fn default_schedule_hour() -> u32 {
    3
}
fn default_interval_hours() -> i64 {
    24
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            schedule_hour: default_schedule_hour(),
            interval_hours: default_interval_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationsConfig {
    #[serde(default = "default_proximity_threshold")]
    pub score_proximity_threshold: f64,
    #[serde(default = "default_auto_link_threshold")]
    pub auto_link_similarity_threshold: f64,
    #[serde(default = "default_max_relations")]
    pub max_relations_per_memory: usize,
    #[serde(default = "default_true")]
    pub enable_auto_linking: bool,
}

fn default_proximity_threshold() -> f64 {
    5.0
}
fn default_auto_link_threshold() -> f64 {
    0.85
}
fn default_max_relations() -> usize {
    10
}
fn default_true() -> bool {
    true
}

impl Default for RelationsConfig {
    fn default() -> Self {
        Self {
            score_proximity_threshold: default_proximity_threshold(),
            auto_link_similarity_threshold: default_auto_link_threshold(),
            max_relations_per_memory: default_max_relations(),
            enable_auto_linking: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: f64,
}

fn default_top_k() -> usize {
    5
}
fn default_relevance_threshold() -> f64 {
    5.0
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            relevance_threshold: default_relevance_threshold(),
        }
    }
}

/// How the archive auto-delete conditions combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeleteConditionMode {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default = "default_true")]
    pub enable_archive_recall: bool,
    #[serde(default = "default_revival_decay")]
    pub revival_decay_per_day: f64,
    #[serde(default = "default_revival_margin")]
    pub revival_min_margin: f64,
    #[serde(default)]
    pub auto_delete_enabled: bool,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_true")]
    pub delete_require_zero_recall: bool,
    #[serde(default = "default_delete_max_intensity")]
    pub delete_max_intensity: i32,
    #[serde(default)]
    pub delete_condition_mode: DeleteConditionMode,
}

fn default_revival_decay() -> f64 {
    0.995
}
fn default_revival_margin() -> f64 {
    3.0
}
fn default_retention_days() -> i64 {
    365
}
fn default_delete_max_intensity() -> i32 {
    20
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enable_archive_recall: true,
            revival_decay_per_day: default_revival_decay(),
            revival_min_margin: default_revival_margin(),
            auto_delete_enabled: false,
            retention_days: default_retention_days(),
            delete_require_zero_recall: true,
            delete_max_intensity: default_delete_max_intensity(),
            delete_condition_mode: DeleteConditionMode::And,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionConfig {
    #[serde(default = "default_max_protected")]
    pub max_protected_memories: usize,
}

fn default_max_protected() -> usize {
    50
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            max_protected_memories: default_max_protected(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_dims")]
    pub dimensions: usize,
    /// Override for OpenAI-compatible endpoints
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_embedding_provider() -> String {
    "openai".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_embedding_dims() -> usize {
    1536
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dimensions: default_embedding_dims(),
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_llm_provider() -> String {
    "anthropic".to_string()
}
fn default_llm_model() -> String {
    "claude-3-5-haiku-20241022".to_string()
}
fn default_max_tokens() -> u32 {
    1024
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            temperature: 0.0,
            max_tokens: default_max_tokens(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
