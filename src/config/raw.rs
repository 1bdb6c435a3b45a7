//! Raw TOML deserialization types.
//!
//! These structs mirror the TOML file shape and use `serde` defaults.
//! The `load` module converts them into the public `types` structs.

use serde::Deserialize;

// ── Top-level ────────────────────────────────────────────────────────────────

/// Raw TOML shape: serde target before resolution.
#[derive(Deserialize, Default)]
pub(super) struct RawConfig {
    #[serde(default)]
    pub general: RawGeneral,
    #[serde(default)]
    pub retrieval: RawRetrieval,
    #[serde(default)]
    pub rag: RawRag,
    #[serde(default)]
    pub embedding: RawEmbedding,
    #[serde(default)]
    pub cag: RawCag,
    #[serde(default)]
    pub fusion: RawFusion,
}

#[derive(Deserialize)]
pub(super) struct RawGeneral {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<String>,
}

impl Default for RawGeneral {
    fn default() -> Self {
        Self { log_level: default_log_level(), log_file: None }
    }
}

// ── Retrieval ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawRetrieval {
    #[serde(default = "default_true")]
    pub enable_rag: bool,
    #[serde(default = "default_true")]
    pub enable_cag: bool,
    #[serde(default = "default_rag_weight")]
    pub rag_weight: f32,
    #[serde(default = "default_cag_weight")]
    pub cag_weight: f32,
    #[serde(default = "default_max_context_length")]
    pub max_context_length: usize,
    #[serde(default = "default_true")]
    pub enable_caching: bool,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: u64,
}

impl Default for RawRetrieval {
    fn default() -> Self {
        Self {
            enable_rag: true,
            enable_cag: true,
            rag_weight: default_rag_weight(),
            cag_weight: default_cag_weight(),
            max_context_length: default_max_context_length(),
            enable_caching: true,
            cache_ttl: default_cache_ttl(),
        }
    }
}

// ── RAG ──────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawRag {
    #[serde(default = "default_vector_db")]
    pub vector_db: String,
    #[serde(default = "default_embedding_service")]
    pub embedding_service: String,
    #[serde(default = "default_collection_name")]
    pub collection_name: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_true")]
    pub enable_caching: bool,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: u64,
    #[serde(default)]
    pub allow_placeholder_embeddings: bool,
}

impl Default for RawRag {
    fn default() -> Self {
        Self {
            vector_db: default_vector_db(),
            embedding_service: default_embedding_service(),
            collection_name: default_collection_name(),
            max_results: default_max_results(),
            similarity_threshold: default_similarity_threshold(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            enable_caching: true,
            cache_ttl: default_cache_ttl(),
            allow_placeholder_embeddings: false,
        }
    }
}

#[derive(Deserialize)]
pub(super) struct RawEmbedding {
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,
    #[serde(default = "default_embedding_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for RawEmbedding {
    fn default() -> Self {
        Self {
            dimension: default_embedding_dimension(),
            api_base_url: default_embedding_api_base_url(),
            model: default_embedding_model(),
            timeout_seconds: default_embedding_timeout_seconds(),
        }
    }
}

// ── CAG ──────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawCag {
    #[serde(default = "default_knowledge_graph")]
    pub knowledge_graph: String,
    #[serde(default = "default_max_context_depth")]
    pub max_context_depth: usize,
    #[serde(default = "default_max_related")]
    pub max_related: usize,
    #[serde(default = "default_max_context_length")]
    pub max_context_length: usize,
    #[serde(default = "default_true")]
    pub enable_caching: bool,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: u64,
    #[serde(default)]
    pub enable_knowledge_sources: bool,
    #[serde(default = "default_true")]
    pub preload_mitre: bool,
}

impl Default for RawCag {
    fn default() -> Self {
        Self {
            knowledge_graph: default_knowledge_graph(),
            max_context_depth: default_max_context_depth(),
            max_related: default_max_related(),
            max_context_length: default_max_context_length(),
            enable_caching: true,
            cache_ttl: default_cache_ttl(),
            enable_knowledge_sources: false,
            preload_mitre: true,
        }
    }
}

// ── Fusion ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawFusion {
    #[serde(default = "default_combine_mode")]
    pub default_combine_mode: String,
    #[serde(default)]
    pub explicit_max_length: Option<usize>,
}

impl Default for RawFusion {
    fn default() -> Self {
        Self { default_combine_mode: default_combine_mode(), explicit_max_length: None }
    }
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

pub(super) fn default_log_level() -> String {
    "info".to_string()
}

pub(super) fn default_rag_weight() -> f32 {
    0.6
}

pub(super) fn default_cag_weight() -> f32 {
    0.4
}

pub(super) fn default_max_context_length() -> usize {
    4000
}

pub(super) fn default_cache_ttl() -> u64 {
    3600
}

pub(super) fn default_vector_db() -> String {
    "memory".to_string()
}

pub(super) fn default_embedding_service() -> String {
    "mock".to_string()
}

pub(super) fn default_collection_name() -> String {
    "cybersecurity".to_string()
}

pub(super) fn default_max_results() -> usize {
    5
}

pub(super) fn default_similarity_threshold() -> f32 {
    0.05
}

pub(super) fn default_chunk_size() -> usize {
    1000
}

pub(super) fn default_chunk_overlap() -> usize {
    200
}

pub(super) fn default_embedding_dimension() -> usize {
    384
}

pub(super) fn default_embedding_api_base_url() -> String {
    "http://127.0.0.1:11434/api/embeddings".to_string()
}

pub(super) fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

pub(super) fn default_embedding_timeout_seconds() -> u64 {
    30
}

pub(super) fn default_knowledge_graph() -> String {
    "in_memory".to_string()
}

pub(super) fn default_max_context_depth() -> usize {
    2
}

pub(super) fn default_max_related() -> usize {
    15
}

pub(super) fn default_combine_mode() -> String {
    "explicit_first".to_string()
}
