//! Storage layer

mod migrations;
mod sqlite;

pub use migrations::{apply_migrations, get_current_version, Migration, MIGRATIONS};
pub use sqlite::{MemoryPatch, MemoryStore, Result, StoreError, STATE_LAST_COMPRESSION_RUN};
