//! # Kioku Core
//!
//! Long-term memory engine for a conversational assistant. Every
//! conversation turn becomes a typed memory record with an emotional-affect
//! profile and a dense embedding; records fade along a human-like forgetting
//! curve and resurface when a query is semantically and emotionally close.
//!
//! - **Retention model**: `score = intensity × coefficient^days`, with the
//!   coefficient picked from the category's decay range at ingestion
//! - **Four tiers**: full text → summary → keywords → archive, with LLM
//!   rewrites at each compression step
//! - **Recall reinforcement**: retrieved memories age backwards (days halve,
//!   coefficient firms up)
//! - **Resonance retrieval**: cosine similarity blended with an
//!   emotional-match bonus
//! - **Daily batch**: reinforcement, aging, rescoring, tier compression,
//!   archive revival, ratio enforcement, relation maintenance, pruning
//!
//! Three actors share nothing but the WAL-journaled store file: per-turn
//! retrieval, per-session ingestion, and the daily batch.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use kioku_core::prelude::*;
//!
//! let config = Config::load("config.json")?;
//! let store = MemoryStore::new(None)?;
//! let embedder = OpenAiEmbedding::from_config(&config.embedding);
//! let analysis = AnthropicAnalysis::from_config(&config.llm);
//!
//! // Ingest a session
//! let ingestor = MemoryIngestor::new(&store, &analysis, &embedder, &config);
//! ingestor.ingest_turns(&turns)?;
//!
//! // Retrieve for a prompt
//! let retrieval = MemoryRetrieval::new(&store, &embedder, &config);
//! let hits = retrieval.retrieve("what did we decide about the schema?", None)?;
//! if let Some(block) = render_memories_block(&hits) {
//!     println!("{block}");
//! }
//!
//! // Daily consolidation
//! let batch = CompressionBatch::new(&store, &analysis, &embedder, &config);
//! let report = batch.run(false)?;
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod batch;
pub mod config;
pub mod embeddings;
pub mod ingest;
pub mod memory;
pub mod providers;
pub mod recall;
pub mod relations;
pub mod resonance;
pub mod retention;
pub mod retrieval;
pub mod store;

/// Deterministic fixtures shared by the unit and integration tests
pub mod testing;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use batch::{BatchReport, CompressionBatch, SKIP_INTERVAL_NOT_ELAPSED};
pub use config::{Config, ConfigError, DeleteConditionMode};
pub use embeddings::{
    cosine_similarity, DeterministicEmbedding, Embedding, EmbeddingError, EmbeddingProvider,
    OpenAiEmbedding, EMBEDDING_DIMENSIONS,
};
pub use ingest::{IngestError, IngestedMemory, MemoryIngestor, SessionIngest, Turn};
pub use memory::{
    Category, EmotionState, MemoryRecord, Relation, RelationType, TurnAnalysis, Valence,
    LEVEL_ARCHIVE, LEVEL_FULL, LEVEL_KEYWORDS, LEVEL_SUMMARY,
};
pub use providers::{
    AnalysisProvider, AnthropicAnalysis, ProviderError, Rewrite, ScriptedAnalysis,
};
pub use retrieval::{render_memories_block, MemoryRetrieval, RetrievedMemory};
pub use store::{MemoryPatch, MemoryStore, StoreError, STATE_LAST_COMPRESSION_RUN};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        render_memories_block, AnalysisProvider, AnthropicAnalysis, BatchReport, Category,
        CompressionBatch, Config, EmbeddingProvider, EmotionState, MemoryIngestor, MemoryPatch,
        MemoryRecord, MemoryRetrieval, MemoryStore, OpenAiEmbedding, StoreError, Turn, Valence,
    };
}
