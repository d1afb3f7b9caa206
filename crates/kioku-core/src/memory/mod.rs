//! Memory record types - the fundamental unit of the engine

mod record;

pub use record::{
    Category, EmotionState, MemoryRecord, Relation, RelationType, TurnAnalysis, Valence,
    LEVEL_ARCHIVE, LEVEL_FULL, LEVEL_KEYWORDS, LEVEL_SUMMARY,
};
