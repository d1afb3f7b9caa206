//! Memory record - one persisted conversational memory
//!
//! Each record captures a single (user, assistant) turn with:
//! - An emotional-affect profile fixed at ingestion
//! - A decaying retention score and tier level
//! - A dense embedding over its trigger + content text
//! - Typed outgoing relations to other records

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// Tier 1: full conversation text
pub const LEVEL_FULL: i32 = 1;
/// Tier 2: LLM summary
pub const LEVEL_SUMMARY: i32 = 2;
/// Tier 3: keyword digest
pub const LEVEL_KEYWORDS: i32 = 3;
/// Tier 4: archived
pub const LEVEL_ARCHIVE: i32 = 4;

// ============================================================================
// ENUMS
// ============================================================================

/// Emotional valence of a memory or of the current emotion context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Valence {
    Positive,
    Negative,
    #[default]
    Neutral,
}

impl Valence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Valence::Positive => "positive",
            Valence::Negative => "negative",
            Valence::Neutral => "neutral",
        }
    }

    /// Parse from the persisted short string. Returns `None` for unknown values.
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "positive" => Some(Valence::Positive),
            "negative" => Some(Valence::Negative),
            "neutral" => Some(Valence::Neutral),
            _ => None,
        }
    }
}

impl std::fmt::Display for Valence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Memory category; drives the decay-coefficient range at ingestion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[default]
    Casual,
    Work,
    Decision,
    Emotional,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Casual => "casual",
            Category::Work => "work",
            Category::Decision => "decision",
            Category::Emotional => "emotional",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "casual" => Some(Category::Casual),
            "work" => Some(Category::Work),
            "decision" => Some(Category::Decision),
            "emotional" => Some(Category::Emotional),
            _ => None,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Typed relation between two memories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    Continues,
    References,
    DerivedFrom,
    Contradicts,
    SameTopic,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::Continues => "continues",
            RelationType::References => "references",
            RelationType::DerivedFrom => "derived_from",
            RelationType::Contradicts => "contradicts",
            RelationType::SameTopic => "same_topic",
        }
    }
}

impl std::fmt::Display for RelationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An outgoing relation edge. Direction rule: the source outranks the target
/// in retention score (within the configured proximity threshold).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    /// Target memory id
    pub id: String,
    /// Edge type
    #[serde(rename = "type")]
    pub kind: RelationType,
}

impl Relation {
    pub fn new(id: impl Into<String>, kind: RelationType) -> Self {
        Self { id: id.into(), kind }
    }
}

// ============================================================================
// MEMORY RECORD
// ============================================================================

/// A persisted memory record
///
/// Invariants maintained by the daily batch:
/// - `archived_at` is non-null exactly when `current_level == 4`
/// - `retention_score == intensity * coefficient^memory_days` for active records
/// - every relation targets an existing, non-archived record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Identifier of the form `mem_YYYYMMDD_NNN`, monotone per day
    pub id: String,
    /// Insert time, local offset preserved
    pub created: DateTime<FixedOffset>,
    /// Age in days; +1 per batch, halved on recall
    pub memory_days: f64,
    /// Set by retrieval, consumed by the next batch
    pub recalled_since_last_batch: bool,
    /// Cumulative recalls
    pub recall_count: i32,
    /// 0-100, fixed at ingestion
    pub emotional_intensity: i32,
    pub emotional_valence: Valence,
    /// 0-100, fixed at ingestion
    pub emotional_arousal: i32,
    pub emotional_tags: Vec<String>,
    /// In [0.70, 0.999]; +0.02 per recall, capped
    pub decay_coefficient: f64,
    pub category: Category,
    /// Stable audit copy from ingestion; never rewritten by compression
    pub keywords: Vec<String>,
    /// Tier 1..4; 4 means archived
    pub current_level: i32,
    /// Summary of the user utterance; rewritten by tier compression
    pub trigger: String,
    /// Summary of the assistant response; rewritten by tier compression
    pub content: String,
    /// Dense vector over `trigger + " " + content`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Outgoing edges
    pub relations: Vec<Relation>,
    /// Derived: `intensity * coefficient^memory_days`
    pub retention_score: f64,
    /// Non-null exactly when archived
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<FixedOffset>>,
    /// Exempt from compression, demotion, archival and deletion
    pub protected: bool,
    /// Set by retrieval against archived records
    pub revival_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revival_requested_at: Option<DateTime<FixedOffset>>,
}

impl MemoryRecord {
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    /// The text that gets embedded
    pub fn embedding_text(&self) -> String {
        format!("{} {}", self.trigger, self.content)
    }

    /// Whether an outgoing edge to `target_id` already exists
    pub fn has_relation_to(&self, target_id: &str) -> bool {
        self.relations.iter().any(|r| r.id == target_id)
    }
}

// ============================================================================
// PROVIDER / CONTEXT TYPES
// ============================================================================

/// Current emotion context supplied to retrieval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmotionState {
    #[serde(default)]
    pub valence: Valence,
    /// 0-100
    #[serde(default = "default_arousal")]
    pub arousal: i32,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_arousal() -> i32 {
    50
}

/// Affect + summary analysis of one conversation turn, as returned by the
/// analysis provider. A missing or malformed required key aborts the turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnAnalysis {
    pub emotional_intensity: i32,
    pub emotional_valence: Valence,
    pub emotional_arousal: i32,
    pub emotional_tags: Vec<String>,
    pub category: Category,
    pub keywords: Vec<String>,
    pub trigger: String,
    pub content: String,
    /// True when the user asked for the memory to be kept (the provider
    /// detects phrases like 「覚えておいて」/「忘れないで」)
    #[serde(default)]
    pub protected: bool,
}

impl TurnAnalysis {
    /// Range-check the affect integers
    pub fn is_in_range(&self) -> bool {
        (0..=100).contains(&self.emotional_intensity) && (0..=100).contains(&self.emotional_arousal)
    }
}

// ============================================================================
// TESTS
// ============================================================================
