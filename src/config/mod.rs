//! Settings for the retrieval stack: RAG, CAG, fusion and the facade's
//! weighting and cache.
//!
//! Profiles live under `config/` and may inherit from one another; see
//! [`load()`] for the lookup order and environment overrides.
//!
//! # Module layout
//!
//! - **types**: Public configuration structs consumed by the managers
//!   (`Config`, `RagConfig`, `CagConfig`, …).
//! - **raw**: Raw TOML deserialization types. These mirror the file shape
//!   and use serde defaults; kept private.
//! - **load**: Loading logic: `merge_layers`, `read_profile_chain`, `load`,
//!   `load_from`, `expand_home`.

mod load;
mod raw;
mod types;

pub use load::{expand_home, load, load_env_file, load_from};
pub use types::*;

impl Config {
    /// Offline configuration: mock embeddings, in-memory stores, placeholder
    /// embeddings allowed. Used by tests and the console harness.
    pub fn offline() -> Self {
        let mut config = Self::default();
        config.rag.embedding_service = "mock".into();
        config.rag.vector_db = "memory".into();
        config.rag.allow_placeholder_embeddings = true;
        config.embedding.dimension = 128;
        config.cag.knowledge_graph = "in_memory".into();
        config
    }
}
