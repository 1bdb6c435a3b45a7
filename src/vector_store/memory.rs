//! In-memory vector store.
//!
//! The collection index is a `DashMap`, so creating or dropping one collection
//! never blocks searches on another. Each collection sits behind its own
//! `RwLock`: a batch upsert is applied atomically with respect to searches of
//! that collection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::similarity::{cosine_similarity, normalize};
use super::{
    CollectionStats, Document, SimilarityResult, VectorStore, VectorStoreError, is_valid_collection_name,
};

#[derive(Debug)]
struct StoredDocument {
    document: Document,
    embedding: Vec<f32>,
}

#[derive(Debug)]
struct Collection {
    /// Insertion order; an upsert replaces in place.
    documents: Vec<StoredDocument>,
    positions: HashMap<String, usize>,
    dimension: Option<usize>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Collection {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            documents: Vec::new(),
            positions: HashMap::new(),
            dimension: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn upsert(&mut self, document: Document, embedding: Vec<f32>) {
        match self.positions.get(&document.id) {
            Some(&pos) => self.documents[pos] = StoredDocument { document, embedding },
            None => {
                self.positions.insert(document.id.clone(), self.documents.len());
                self.documents.push(StoredDocument { document, embedding });
            }
        }
    }

    fn remove(&mut self, ids: &[String]) -> usize {
        let before = self.documents.len();
        self.documents.retain(|d| !ids.contains(&d.document.id));
        let removed = before - self.documents.len();
        if removed > 0 {
            self.positions = self
                .documents
                .iter()
                .enumerate()
                .map(|(i, d)| (d.document.id.clone(), i))
                .collect();
            if self.documents.is_empty() {
                self.dimension = None;
            }
        }
        removed
    }
}

type SharedCollection = Arc<RwLock<Collection>>;

#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    collections: DashMap<String, SharedCollection>,
    allow_placeholder_embeddings: bool,
    placeholder_dimension: usize,
    connected: AtomicBool,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// When enabled, documents added without embeddings receive deterministic
    /// pseudo-vectors derived from their id instead of being rejected.
    pub fn with_placeholder_embeddings(mut self, allow: bool, dimension: usize) -> Self {
        self.allow_placeholder_embeddings = allow;
        self.placeholder_dimension = dimension.max(1);
        self
    }

    fn collection(&self, name: &str) -> Option<SharedCollection> {
        // Clone the Arc so the shard guard is released before locking.
        self.collections.get(name).map(|c| Arc::clone(c.value()))
    }

    fn get_or_create(&self, name: &str) -> SharedCollection {
        match self.collections.entry(name.to_string()) {
            Entry::Occupied(e) => Arc::clone(e.get()),
            Entry::Vacant(e) => {
                info!(collection = name, "created collection");
                Arc::clone(e.insert(Arc::new(RwLock::new(Collection::new()))).value())
            }
        }
    }
}

fn read(c: &RwLock<Collection>) -> RwLockReadGuard<'_, Collection> {
    c.read().unwrap_or_else(|e| e.into_inner())
}

fn write(c: &RwLock<Collection>) -> RwLockWriteGuard<'_, Collection> {
    c.write().unwrap_or_else(|e| e.into_inner())
}

/// Shared length of `embeddings`, pinned to `expected` when the collection
/// already has one. `None` on any mismatch or a zero length.
fn uniform_dimension(expected: Option<usize>, embeddings: &[Vec<f32>]) -> Option<usize> {
    let dim = expected.or_else(|| embeddings.first().map(Vec::len)).filter(|&d| d > 0)?;
    embeddings.iter().all(|e| e.len() == dim).then_some(dim)
}

/// Unit-length pseudo-vector seeded by `sha256(id)`. Stable across runs.
pub fn placeholder_embedding(id: &str, dimension: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(dimension);
    let mut block = Sha256::digest(id.as_bytes());
    while out.len() < dimension {
        for chunk in block.chunks_exact(4) {
            if out.len() == dimension {
                break;
            }
            let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            out.push((raw as f64 / u32::MAX as f64 * 2.0 - 1.0) as f32);
        }
        block = Sha256::digest(block);
    }
    normalize(&out)
}

impl VectorStore for InMemoryVectorStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn connect(&self) -> Result<(), VectorStoreError> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    fn disconnect(&self) -> Result<(), VectorStoreError> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    fn test_connection(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn create_collection(&self, name: &str) -> Result<bool, VectorStoreError> {
        if !is_valid_collection_name(name) {
            return Err(VectorStoreError::Validation(format!(
                "invalid collection name '{name}': expected [A-Za-z0-9_]+"
            )));
        }
        self.get_or_create(name);
        Ok(true)
    }

    fn add_documents(
        &self,
        collection: &str,
        docs: Vec<Document>,
        embeddings: Option<Vec<Vec<f32>>>,
    ) -> Result<bool, VectorStoreError> {
        if !is_valid_collection_name(collection) {
            return Err(VectorStoreError::Validation(format!("invalid collection name '{collection}'")));
        }
        if docs.is_empty() {
            return Err(VectorStoreError::Validation("no documents to add".into()));
        }
        if let Some(bad) = docs.iter().position(|d| d.id.trim().is_empty() || d.content.trim().is_empty()) {
            return Err(VectorStoreError::Validation(format!(
                "document at index {bad} is missing an id or content"
            )));
        }

        let existing_dim = self.collection(collection).and_then(|c| read(&c).dimension);
        let embeddings = match embeddings {
            Some(e) => e,
            None if self.allow_placeholder_embeddings => {
                let dim = existing_dim.unwrap_or(self.placeholder_dimension);
                debug!(collection, count = docs.len(), dim, "using placeholder embeddings");
                docs.iter().map(|d| placeholder_embedding(&d.id, dim)).collect()
            }
            None => {
                warn!(collection, "documents supplied without embeddings; rejected");
                return Ok(false);
            }
        };

        if embeddings.len() != docs.len() {
            warn!(collection, docs = docs.len(), embeddings = embeddings.len(), "embedding count mismatch");
            return Ok(false);
        }
        let Some(dim) = uniform_dimension(existing_dim, &embeddings) else {
            warn!(collection, expected = ?existing_dim, "embedding dimension mismatch");
            return Ok(false);
        };

        // A rejected batch must not leave an empty collection behind.
        let target = self.get_or_create(collection);
        let mut coll = write(&target);
        if coll.dimension.is_some_and(|d| d != dim) {
            warn!(collection, expected = ?coll.dimension, actual = dim, "embedding dimension mismatch");
            return Ok(false);
        }

        let count = docs.len();
        for (doc, emb) in docs.into_iter().zip(embeddings) {
            coll.upsert(doc, emb);
        }
        coll.dimension = Some(dim);
        coll.updated_at = Utc::now();
        debug!(collection, added = count, total = coll.documents.len(), "documents stored");
        Ok(true)
    }

    fn search(&self, collection: &str, query_embedding: &[f32], limit: usize) -> Option<Vec<SimilarityResult>> {
        let target = self.collection(collection)?;
        let coll = read(&target);

        let mut scored: Vec<(f32, &StoredDocument)> = coll
            .documents
            .iter()
            .map(|d| (cosine_similarity(Some(query_embedding), Some(d.embedding.as_slice())), d))
            .collect();
        // Stable: equal scores keep insertion order.
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(limit);

        Some(
            scored
                .into_iter()
                .map(|(score, d)| SimilarityResult {
                    document: d.document.clone(),
                    score,
                    embedding: d.embedding.clone(),
                })
                .collect(),
        )
    }

    fn get_document(&self, collection: &str, id: &str) -> Option<Document> {
        let target = self.collection(collection)?;
        let coll = read(&target);
        coll.positions.get(id).map(|&pos| coll.documents[pos].document.clone())
    }

    fn find_by_metadata(&self, collection: &str, key: &str, value: &str) -> Vec<String> {
        let Some(target) = self.collection(collection) else {
            return Vec::new();
        };
        let coll = read(&target);
        coll.documents
            .iter()
            .filter(|d| d.document.metadata.get(key).is_some_and(|v| v == value))
            .map(|d| d.document.id.clone())
            .collect()
    }

    fn delete_documents(&self, collection: &str, ids: &[String]) -> Result<usize, VectorStoreError> {
        let Some(target) = self.collection(collection) else {
            return Ok(0);
        };
        let mut coll = write(&target);
        let removed = coll.remove(ids);
        if removed > 0 {
            coll.updated_at = Utc::now();
        }
        Ok(removed)
    }

    fn get_collection_stats(&self, collection: &str) -> Option<CollectionStats> {
        let target = self.collection(collection)?;
        let coll = read(&target);
        Some(CollectionStats {
            name: collection.to_string(),
            document_count: coll.documents.len(),
            dimension: coll.dimension,
            created_at: coll.created_at,
            updated_at: coll.updated_at,
        })
    }

    fn delete_collection(&self, collection: &str) -> bool {
        if self.collections.remove(collection).is_some() {
            info!(collection, "deleted collection");
        }
        true
    }

    fn list_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs(ids: &[&str]) -> Vec<Document> {
        ids.iter().map(|id| Document::new(*id, format!("content of {id}"))).collect()
    }

    #[test]
    fn create_is_idempotent_and_validates_names() {
        let store = InMemoryVectorStore::new();
        assert!(store.create_collection("kb").unwrap());
        assert!(store.create_collection("kb").unwrap());
        assert_eq!(store.list_collections(), vec!["kb".to_string()]);
        assert!(matches!(store.create_collection("bad name"), Err(VectorStoreError::Validation(_))));
    }

    #[test]
    fn add_rejects_structural_problems() {
        let store = InMemoryVectorStore::new();
        assert!(store.add_documents("kb", vec![], None).is_err());
        let missing = vec![Document::new("", "text")];
        assert!(store.add_documents("kb", missing, Some(vec![vec![1.0]])).is_err());
        let blank = vec![Document::new("a", " ")];
        assert!(store.add_documents("kb", blank, Some(vec![vec![1.0]])).is_err());
    }

    #[test]
    fn add_returns_false_on_data_mismatch() {
        let store = InMemoryVectorStore::new();
        // count mismatch
        assert!(!store.add_documents("kb", docs(&["a", "b"]), Some(vec![vec![1.0, 0.0]])).unwrap());
        // ragged dimensions
        let ragged = Some(vec![vec![1.0, 0.0], vec![1.0]]);
        assert!(!store.add_documents("kb", docs(&["a", "b"]), ragged).unwrap());
        // without embeddings and without placeholders
        assert!(!store.add_documents("kb", docs(&["a"]), None).unwrap());
    }

    #[test]
    fn rejected_batch_creates_no_collection() {
        let store = InMemoryVectorStore::new();
        assert!(!store.add_documents("kb", docs(&["a", "b"]), Some(vec![vec![1.0, 0.0]])).unwrap());
        assert!(!store.add_documents("kb", docs(&["a"]), None).unwrap());
        assert!(!store.add_documents("kb", docs(&["a"]), Some(vec![vec![]])).unwrap());
        assert!(store.list_collections().is_empty());
        assert!(store.get_collection_stats("kb").is_none());
        assert!(store.search("kb", &[1.0, 0.0], 3).is_none());
    }

    #[test]
    fn find_by_metadata_in_insertion_order() {
        let store = InMemoryVectorStore::new();
        let batch = vec![
            Document::new("lm#0", "one").with_meta("parent_id", "lm"),
            Document::new("other", "two").with_meta("parent_id", "x"),
            Document::new("lm#1", "three").with_meta("parent_id", "lm"),
        ];
        store.add_documents("kb", batch, Some(vec![vec![1.0], vec![1.0], vec![1.0]])).unwrap();
        assert_eq!(store.find_by_metadata("kb", "parent_id", "lm"), vec!["lm#0", "lm#1"]);
        assert!(store.find_by_metadata("kb", "parent_id", "zz").is_empty());
        assert!(store.find_by_metadata("missing", "parent_id", "lm").is_empty());
    }

    #[test]
    fn dimension_is_fixed_by_first_insert() {
        let store = InMemoryVectorStore::new();
        assert!(store.add_documents("kb", docs(&["a"]), Some(vec![vec![1.0, 0.0, 0.0]])).unwrap());
        assert!(!store.add_documents("kb", docs(&["b"]), Some(vec![vec![1.0, 0.0]])).unwrap());
        let stats = store.get_collection_stats("kb").unwrap();
        assert_eq!(stats.dimension, Some(3));
        assert_eq!(stats.document_count, 1);
    }

    #[test]
    fn upsert_replaces_by_id() {
        let store = InMemoryVectorStore::new();
        store.add_documents("kb", docs(&["a", "b"]), Some(vec![vec![1.0, 0.0], vec![0.0, 1.0]])).unwrap();
        let replacement = vec![Document::new("a", "updated")];
        store.add_documents("kb", replacement, Some(vec![vec![0.5, 0.5]])).unwrap();
        assert_eq!(store.get_collection_stats("kb").unwrap().document_count, 2);
        assert_eq!(store.get_document("kb", "a").unwrap().content, "updated");
    }

    #[test]
    fn search_ranks_descending_and_respects_limit() {
        let store = InMemoryVectorStore::new();
        let embs = vec![vec![0.0, 1.0], vec![1.0, 0.0], vec![0.7, 0.7]];
        store.add_documents("kb", docs(&["far", "exact", "mid"]), Some(embs)).unwrap();

        let hits = store.search("kb", &[1.0, 0.0], 10).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.document.id.as_str()).collect();
        assert_eq!(ids, vec!["exact", "mid", "far"]);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));

        assert_eq!(store.search("kb", &[1.0, 0.0], 1).unwrap().len(), 1);
        assert!(store.search("kb", &[1.0, 0.0], 0).unwrap().is_empty());
    }

    #[test]
    fn ties_keep_insertion_order() {
        let store = InMemoryVectorStore::new();
        let embs = vec![vec![1.0, 0.0], vec![1.0, 0.0], vec![1.0, 0.0]];
        store.add_documents("kb", docs(&["first", "second", "third"]), Some(embs)).unwrap();
        let ids: Vec<String> =
            store.search("kb", &[1.0, 0.0], 3).unwrap().into_iter().map(|h| h.document.id).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
    }

    #[test]
    fn search_missing_collection_is_none_and_empty_is_empty() {
        let store = InMemoryVectorStore::new();
        assert!(store.search("nope", &[1.0], 5).is_none());
        store.create_collection("empty").unwrap();
        assert_eq!(store.search("empty", &[1.0], 5), Some(vec![]));
    }

    #[test]
    fn delete_collection_is_idempotent() {
        let store = InMemoryVectorStore::new();
        store.create_collection("kb").unwrap();
        assert!(store.delete_collection("kb"));
        assert!(store.delete_collection("kb"));
        assert!(store.get_collection_stats("kb").is_none());
    }

    #[test]
    fn delete_documents_by_id() {
        let store = InMemoryVectorStore::new();
        store
            .add_documents("kb", docs(&["a", "b", "c"]), Some(vec![vec![1.0], vec![1.0], vec![1.0]]))
            .unwrap();
        let removed = store.delete_documents("kb", &["b".to_string(), "zz".to_string()]).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get_document("kb", "b").is_none());
        assert_eq!(store.get_document("kb", "c").unwrap().id, "c");
        assert_eq!(store.delete_documents("missing", &["a".to_string()]).unwrap(), 0);
    }

    #[test]
    fn placeholders_are_deterministic_and_opt_in() {
        let store = InMemoryVectorStore::new().with_placeholder_embeddings(true, 16);
        assert!(store.add_documents("kb", docs(&["a"]), None).unwrap());
        assert_eq!(store.get_collection_stats("kb").unwrap().dimension, Some(16));

        assert_eq!(placeholder_embedding("doc-1", 40), placeholder_embedding("doc-1", 40));
        assert_ne!(placeholder_embedding("doc-1", 40), placeholder_embedding("doc-2", 40));
        assert_eq!(placeholder_embedding("doc-1", 40).len(), 40);
    }

    #[test]
    fn connection_flag() {
        let store = InMemoryVectorStore::new();
        assert!(!store.test_connection());
        store.connect().unwrap();
        assert!(store.test_connection());
        store.disconnect().unwrap();
        assert!(!store.test_connection());
    }

    #[test]
    fn concurrent_writers_and_readers() {
        let store = Arc::new(InMemoryVectorStore::new());
        store.create_collection("kb").unwrap();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let id = format!("t{t}_{i}");
                        store.add_documents("kb", vec![Document::new(id, "x")], Some(vec![vec![1.0, 0.0]])).unwrap();
                        let _ = store.search("kb", &[1.0, 0.0], 3);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.get_collection_stats("kb").unwrap().document_count, 200);
    }
}
