//! Public configuration types.
//!
//! These are the resolved, ready-to-use structs that the managers consume.
//! Raw TOML deserialization types live in `raw.rs`.
//!
//! Provider identifiers stay plain strings here. They are validated by the
//! manager that owns them, at construction time, so a bad identifier fails
//! `setup` rather than the first query.

use std::path::PathBuf;
use std::time::Duration;

use super::raw;

/// Top-level resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    /// Optional log file; stderr when `None`.
    pub log_file: Option<PathBuf>,
    pub retrieval: RetrievalConfig,
    pub rag: RagConfig,
    pub embedding: EmbeddingConfig,
    pub cag: CagConfig,
    pub fusion: FusionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: raw::default_log_level(),
            log_file: None,
            retrieval: RetrievalConfig::default(),
            rag: RagConfig::default(),
            embedding: EmbeddingConfig::default(),
            cag: CagConfig::default(),
            fusion: FusionConfig::default(),
        }
    }
}

// ── Retrieval facade ─────────────────────────────────────────────────────────

/// Facade-level switches and the outer cache policy.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub enable_rag: bool,
    pub enable_cag: bool,
    /// Relative share of the context budget given to similarity search.
    pub rag_weight: f32,
    /// Relative share of the context budget given to graph/preloaded context.
    pub cag_weight: f32,
    /// Character budget for the fused RAG+CAG string.
    pub max_context_length: usize,
    pub enable_caching: bool,
    pub cache_ttl: Duration,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enable_rag: true,
            enable_cag: true,
            rag_weight: raw::default_rag_weight(),
            cag_weight: raw::default_cag_weight(),
            max_context_length: raw::default_max_context_length(),
            enable_caching: true,
            cache_ttl: Duration::from_secs(raw::default_cache_ttl()),
        }
    }
}

// ── RAG ──────────────────────────────────────────────────────────────────────

/// Similarity-search layer configuration. Populated from `[rag]`.
#[derive(Debug, Clone)]
pub struct RagConfig {
    /// Vector store provider identifier (e.g. `"memory"`).
    pub vector_db: String,
    /// Embedding provider identifier (e.g. `"mock"`, `"openai"`, `"ollama"`).
    pub embedding_service: String,
    /// Collection used when a caller does not name one.
    pub collection_name: String,
    pub max_results: usize,
    /// Results scoring below this are not rendered.
    pub similarity_threshold: f32,
    /// Chunk window size in characters.
    pub chunk_size: usize,
    /// Characters shared between consecutive chunks.
    pub chunk_overlap: usize,
    pub enable_caching: bool,
    pub cache_ttl: Duration,
    /// Let the vector store synthesise deterministic placeholder vectors when
    /// embeddings are omitted. Offline/test use only.
    pub allow_placeholder_embeddings: bool,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            vector_db: raw::default_vector_db(),
            embedding_service: raw::default_embedding_service(),
            collection_name: raw::default_collection_name(),
            max_results: raw::default_max_results(),
            similarity_threshold: raw::default_similarity_threshold(),
            chunk_size: raw::default_chunk_size(),
            chunk_overlap: raw::default_chunk_overlap(),
            enable_caching: true,
            cache_ttl: Duration::from_secs(raw::default_cache_ttl()),
            allow_placeholder_embeddings: false,
        }
    }
}

/// Embedding provider parameters. Populated from `[embedding]`.
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Vector dimension produced by the provider.
    pub dimension: usize,
    /// Endpoint URL for HTTP providers.
    pub api_base_url: String,
    pub model: String,
    /// Per-request HTTP timeout in seconds.
    pub timeout_seconds: u64,
    /// Sourced from `EMBEDDING_API_KEY`, never from TOML.
    pub api_key: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dimension: raw::default_embedding_dimension(),
            api_base_url: raw::default_embedding_api_base_url(),
            model: raw::default_embedding_model(),
            timeout_seconds: raw::default_embedding_timeout_seconds(),
            api_key: None,
        }
    }
}

// ── CAG ──────────────────────────────────────────────────────────────────────

/// Knowledge-graph and preloaded-context configuration. Populated from `[cag]`.
#[derive(Debug, Clone)]
pub struct CagConfig {
    /// Knowledge graph provider identifier (e.g. `"in_memory"`).
    pub knowledge_graph: String,
    /// Default BFS depth for related-entity lookups.
    pub max_context_depth: usize,
    /// Default node limit for related-entity lookups.
    pub max_related: usize,
    /// Rendered graph context above this length is compressed.
    pub max_context_length: usize,
    pub enable_caching: bool,
    pub cache_ttl: Duration,
    /// Pull a preload corpus at setup.
    pub enable_knowledge_sources: bool,
    /// Use the built-in MITRE ATT&CK catalogue as the preload corpus.
    pub preload_mitre: bool,
}

impl Default for CagConfig {
    fn default() -> Self {
        Self {
            knowledge_graph: raw::default_knowledge_graph(),
            max_context_depth: raw::default_max_context_depth(),
            max_related: raw::default_max_related(),
            max_context_length: raw::default_max_context_length(),
            enable_caching: true,
            cache_ttl: Duration::from_secs(raw::default_cache_ttl()),
            enable_knowledge_sources: false,
            preload_mitre: true,
        }
    }
}

// ── Fusion ───────────────────────────────────────────────────────────────────

/// Context fusion defaults. Populated from `[fusion]`.
#[derive(Debug, Clone)]
pub struct FusionConfig {
    /// Mode used when the attack configuration does not name one.
    pub default_combine_mode: String,
    /// Budget for the explicit-knowledge section, unbounded when `None`.
    pub explicit_max_length: Option<usize>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            default_combine_mode: raw::default_combine_mode(),
            explicit_max_length: None,
        }
    }
}
