//! Vector store abstraction: named collections of (document, embedding) pairs
//! searched by cosine similarity.
//!
//! [`VectorStore`] is the capability set; [`build`] maps a validated
//! [`VectorStoreKind`] to a constructor. Only the in-memory store ships here;
//! collections live for the lifetime of the process.

pub mod memory;
pub mod similarity;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Error ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum VectorStoreError {
    #[error("unknown vector store provider: {0}")]
    UnknownProvider(String),
    #[error("{0}")]
    Validation(String),
    #[error("collection '{0}' lock poisoned")]
    LockPoisoned(String),
}

// ── Types ─────────────────────────────────────────────────────────────────────

/// A stored unit of text. `id` is unique within a collection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Document {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { id: id.into(), content: content.into(), metadata: HashMap::new() }
    }

    /// Builder-style metadata insert.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// One ranked search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityResult {
    pub document: Document,
    /// Cosine similarity in `[-1, 1]`.
    pub score: f32,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionStats {
    pub name: String,
    pub document_count: usize,
    /// Fixed by the first stored embedding; `None` while empty.
    pub dimension: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Provider identifiers ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VectorStoreKind {
    /// Process-local, collection-scoped store.
    Memory,
}

impl VectorStoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VectorStoreKind::Memory => "memory",
        }
    }
}

impl FromStr for VectorStoreKind {
    type Err = VectorStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "in_memory" => Ok(VectorStoreKind::Memory),
            _ => Err(VectorStoreError::UnknownProvider(s.to_string())),
        }
    }
}

impl fmt::Display for VectorStoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Capability set ───────────────────────────────────────────────────────────

/// Collection-scoped similarity store.
///
/// Mutations on one collection are serialised against reads of that same
/// collection; different collections never block each other.
pub trait VectorStore: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn connect(&self) -> Result<(), VectorStoreError>;

    fn disconnect(&self) -> Result<(), VectorStoreError>;

    fn test_connection(&self) -> bool;

    /// Idempotent. Fails only for an invalid name (`[A-Za-z0-9_]+`).
    fn create_collection(&self, name: &str) -> Result<bool, VectorStoreError>;

    /// Upsert `docs` by id. Structural problems (empty batch, missing id or
    /// content, bad collection name) are errors; data-quality problems
    /// (embedding count or dimension mismatch) return `Ok(false)`.
    fn add_documents(
        &self,
        collection: &str,
        docs: Vec<Document>,
        embeddings: Option<Vec<Vec<f32>>>,
    ) -> Result<bool, VectorStoreError>;

    /// `None` if the collection does not exist, otherwise up to `limit` hits
    /// ranked by descending score (ties keep insertion order).
    fn search(&self, collection: &str, query_embedding: &[f32], limit: usize) -> Option<Vec<SimilarityResult>>;

    fn get_document(&self, collection: &str, id: &str) -> Option<Document>;

    /// Ids of documents whose metadata maps `key` to `value`, in insertion
    /// order. Empty for an absent collection.
    fn find_by_metadata(&self, collection: &str, key: &str, value: &str) -> Vec<String>;

    /// Remove documents by id; returns how many were present.
    fn delete_documents(&self, collection: &str, ids: &[String]) -> Result<usize, VectorStoreError>;

    fn get_collection_stats(&self, collection: &str) -> Option<CollectionStats>;

    /// Always succeeds, including for absent collections.
    fn delete_collection(&self, collection: &str) -> bool;

    fn list_collections(&self) -> Vec<String>;
}

/// Construct the store for `kind`.
pub fn build(kind: VectorStoreKind, allow_placeholder_embeddings: bool, placeholder_dimension: usize) -> Arc<dyn VectorStore> {
    match kind {
        VectorStoreKind::Memory => Arc::new(
            memory::InMemoryVectorStore::new()
                .with_placeholder_embeddings(allow_placeholder_embeddings, placeholder_dimension),
        ),
    }
}

/// `true` for names matching `[A-Za-z0-9_]+`.
pub fn is_valid_collection_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_name_rules() {
        assert!(is_valid_collection_name("kb"));
        assert!(is_valid_collection_name("mitre_attack_2024"));
        assert!(!is_valid_collection_name(""));
        assert!(!is_valid_collection_name("my kb"));
        assert!(!is_valid_collection_name("kb-1"));
        assert!(!is_valid_collection_name("kb.v2"));
    }

    #[test]
    fn kind_parsing() {
        assert_eq!("memory".parse::<VectorStoreKind>().unwrap(), VectorStoreKind::Memory);
        assert_eq!("In_Memory".parse::<VectorStoreKind>().unwrap(), VectorStoreKind::Memory);
        assert!(matches!(
            "pinecone".parse::<VectorStoreKind>(),
            Err(VectorStoreError::UnknownProvider(_))
        ));
    }

    #[test]
    fn document_builder_sets_metadata() {
        let d = Document::new("t1003", "OS Credential Dumping").with_meta("source", "mitre");
        assert_eq!(d.metadata.get("source").map(String::as_str), Some("mitre"));
    }
}
