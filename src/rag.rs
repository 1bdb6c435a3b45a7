//! Similarity-search retrieval (RAG).
//!
//! [`RagManager`] wires an [`EmbeddingService`] to a [`VectorStore`]:
//!
//! - **Ingest** (`add_knowledge_base`): long documents are split into
//!   overlapping windows, embedded in one batch and upserted into a collection.
//! - **Query** (`retrieve_relevant_context`): the query is embedded, the
//!   collection searched, results under the similarity threshold dropped, and
//!   the rest rendered as numbered, scored blocks.
//!
//! Query-time failures (empty query, missing collection, backend error) are
//! logged and turned into `None`. Rendered strings are cached per
//! (query, collection, limit).

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use text_splitter::{ChunkConfig, MarkdownSplitter};
use tracing::{debug, info, warn};

use crate::cache::TtlCache;
use crate::config::{EmbeddingConfig, RagConfig};
use crate::embedding::{EmbeddingProviderKind, EmbeddingService, providers};
use crate::error::AppError;
use crate::vector_store::{self, CollectionStats, Document, SimilarityResult, VectorStore, VectorStoreKind};

/// Metadata key linking a chunk back to its source document.
pub const PARENT_ID_KEY: &str = "parent_id";
/// Metadata key holding a chunk's position within its source document.
pub const CHUNK_INDEX_KEY: &str = "chunk_index";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RetrievalKey {
    query: String,
    collection: String,
    limit: usize,
}

#[derive(Debug)]
pub struct RagManager {
    config: RagConfig,
    embedding: Arc<dyn EmbeddingService>,
    store: Arc<dyn VectorStore>,
    cache: TtlCache<RetrievalKey, String>,
    initialized: AtomicBool,
}

impl RagManager {
    /// Build the manager. Unknown provider identifiers and an invalid chunk
    /// window fail here, before any query runs.
    pub fn new(config: &RagConfig, embedding: &EmbeddingConfig) -> Result<Self, AppError> {
        let store_kind: VectorStoreKind = config.vector_db.parse()?;
        let embedding_kind: EmbeddingProviderKind = config.embedding_service.parse()?;
        chunk_config(config)?;

        let store = vector_store::build(store_kind, config.allow_placeholder_embeddings, embedding.dimension);
        let embedding = providers::build(embedding_kind, embedding)?;

        Ok(Self {
            config: config.clone(),
            embedding,
            store,
            cache: TtlCache::new("rag", config.cache_ttl),
            initialized: AtomicBool::new(false),
        })
    }

    /// Connect both collaborators.
    pub fn setup(&self) -> Result<(), AppError> {
        self.embedding.connect()?;
        self.store.connect()?;
        self.initialized.store(true, Ordering::Release);
        info!(
            embedding = self.embedding.name(),
            store = self.store.name(),
            collection = %self.config.collection_name,
            "rag manager ready"
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn default_collection(&self) -> &str {
        &self.config.collection_name
    }

    pub fn max_results(&self) -> usize {
        self.config.max_results
    }

    // ── Ingest ────────────────────────────────────────────────────────────

    /// Split documents longer than `chunk_size` into overlapping windows.
    ///
    /// A document that fits is returned unchanged. Chunks get ids
    /// `"<doc id>#<n>"` and inherit the parent's metadata plus
    /// [`PARENT_ID_KEY`] and [`CHUNK_INDEX_KEY`].
    pub fn chunk_documents(&self, documents: Vec<Document>) -> Result<Vec<Document>, AppError> {
        let splitter = MarkdownSplitter::new(chunk_config(&self.config)?);
        let mut out = Vec::with_capacity(documents.len());

        for doc in documents {
            if doc.content.chars().count() <= self.config.chunk_size {
                out.push(doc);
                continue;
            }
            let before = out.len();
            for (n, text) in splitter.chunks(&doc.content).filter(|t| !t.trim().is_empty()).enumerate() {
                let mut metadata = doc.metadata.clone();
                metadata.insert(PARENT_ID_KEY.to_string(), doc.id.clone());
                metadata.insert(CHUNK_INDEX_KEY.to_string(), n.to_string());
                out.push(Document { id: format!("{}#{n}", doc.id), content: text.to_string(), metadata });
            }
            debug!(doc_id = %doc.id, chunks = out.len() - before, "document chunked");
        }
        Ok(out)
    }

    /// Create `collection` if needed and store `documents` in it.
    ///
    /// With caller-supplied `embeddings` the documents are stored as given
    /// (one vector per document). Otherwise they are chunked and embedded
    /// here. Re-adding an id replaces every entry previously stored for it,
    /// whole or chunked. Validation problems are errors; embedding failures
    /// and count or dimension mismatches return `Ok(false)`.
    pub fn add_knowledge_base(
        &self,
        collection: &str,
        documents: Vec<Document>,
        embeddings: Option<Vec<Vec<f32>>>,
    ) -> Result<bool, AppError> {
        if documents.is_empty() {
            return Err(AppError::Validation("no documents to add".into()));
        }
        if documents.iter().any(|d| d.id.trim().is_empty() || d.content.trim().is_empty()) {
            return Err(AppError::Validation("every document needs an id and content".into()));
        }
        self.store.create_collection(collection)?;

        let previous = self.stored_entries(collection, &documents);
        let (stored, added) = match embeddings {
            Some(embeddings) => {
                let ids: HashSet<String> = documents.iter().map(|d| d.id.clone()).collect();
                (ids, self.store.add_documents(collection, documents, Some(embeddings))?)
            }
            None => {
                let chunks = self.chunk_documents(documents)?;
                let Some(embeddings) = self.embed_all(&chunks) else {
                    return Ok(false);
                };
                let ids: HashSet<String> = chunks.iter().map(|c| c.id.clone()).collect();
                (ids, self.store.add_documents(collection, chunks, Some(embeddings))?)
            }
        };

        if added {
            let superseded: Vec<String> = previous.into_iter().filter(|id| !stored.contains(id)).collect();
            if !superseded.is_empty() {
                let removed = self.store.delete_documents(collection, &superseded)?;
                debug!(collection, removed, "superseded entries dropped");
            }
            // Stored documents changed; rendered results may be stale.
            self.cache.invalidate();
            info!(collection, "knowledge base updated");
        }
        Ok(added)
    }

    /// Ids currently stored for `documents`: the whole document and any chunks
    /// whose parent it is.
    fn stored_entries(&self, collection: &str, documents: &[Document]) -> Vec<String> {
        let mut ids = Vec::new();
        for doc in documents {
            if self.store.get_document(collection, &doc.id).is_some() {
                ids.push(doc.id.clone());
            }
            ids.extend(self.store.find_by_metadata(collection, PARENT_ID_KEY, &doc.id));
        }
        ids
    }

    fn embed_all(&self, docs: &[Document]) -> Option<Vec<Vec<f32>>> {
        let texts: Vec<String> = docs.iter().map(|d| d.content.clone()).collect();
        match self.embedding.generate_batch_embeddings(&texts) {
            Ok(Some(vectors)) => vectors.into_iter().collect::<Option<Vec<_>>>().or_else(|| {
                warn!("embedding batch contained empty entries");
                None
            }),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "batch embedding failed");
                None
            }
        }
    }

    pub fn delete_knowledge_base(&self, collection: &str) -> bool {
        self.cache.invalidate();
        self.store.delete_collection(collection)
    }

    pub fn list_knowledge_bases(&self) -> Vec<String> {
        self.store.list_collections()
    }

    pub fn get_collection_stats(&self, collection: &str) -> Option<CollectionStats> {
        self.store.get_collection_stats(collection)
    }

    pub fn get_document(&self, collection: &str, id: &str) -> Option<Document> {
        self.store.get_document(collection, id)
    }

    // ── Query ─────────────────────────────────────────────────────────────

    /// Ranked results above the similarity threshold, or `None` when there is
    /// nothing to return.
    pub fn search(&self, query: &str, collection: &str, limit: Option<usize>) -> Option<Vec<SimilarityResult>> {
        if query.trim().is_empty() {
            return None;
        }
        let limit = limit.unwrap_or(self.config.max_results);

        let embedding = match self.embedding.generate_embedding(query) {
            Ok(Some(v)) => v,
            Ok(None) => return None,
            Err(e) => {
                warn!(collection, error = %e, "query embedding failed");
                return None;
            }
        };

        let Some(results) = self.store.search(collection, &embedding, limit) else {
            debug!(collection, "collection not found");
            return None;
        };
        let kept: Vec<SimilarityResult> = results
            .into_iter()
            .filter(|r| r.score >= self.config.similarity_threshold)
            .collect();
        if kept.is_empty() { None } else { Some(kept) }
    }

    /// Rendered context for `query`, e.g.
    ///
    /// ```text
    /// Document 1 (score: 0.842):
    /// Credential dumping is ...
    /// ```
    pub fn retrieve_relevant_context(&self, query: &str, collection: &str, limit: Option<usize>) -> Option<String> {
        if query.trim().is_empty() {
            return None;
        }
        let key = RetrievalKey {
            query: query.to_string(),
            collection: collection.to_string(),
            limit: limit.unwrap_or(self.config.max_results),
        };
        if self.config.enable_caching {
            if let Some(hit) = self.cache.get(&key) {
                return Some(hit);
            }
        }

        let results = self.search(query, collection, Some(key.limit))?;
        let rendered = render_results(&results);
        debug!(collection, results = results.len(), "rag context rendered");

        if self.config.enable_caching {
            self.cache.insert(key, rendered.clone());
        }
        Some(rendered)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    pub fn invalidate_cache(&self) {
        self.cache.invalidate();
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    /// Both collaborators report connected.
    pub fn test_connection(&self) -> bool {
        let embedding_ok = self.embedding.test_connection().unwrap_or_else(|e| {
            warn!(error = %e, "embedding connection check failed");
            false
        });
        embedding_ok && self.store.test_connection()
    }

    /// Disconnect both collaborators and clear the cache.
    pub fn cleanup(&self) {
        if let Err(e) = self.embedding.disconnect() {
            warn!(error = %e, "embedding disconnect failed");
        }
        if let Err(e) = self.store.disconnect() {
            warn!(error = %e, "vector store disconnect failed");
        }
        self.cache.invalidate();
        self.initialized.store(false, Ordering::Release);
        info!("rag manager cleaned up");
    }
}

fn chunk_config(config: &RagConfig) -> Result<ChunkConfig<text_splitter::Characters>, AppError> {
    ChunkConfig::new(config.chunk_size)
        .with_overlap(config.chunk_overlap)
        .map_err(|e| AppError::Config(format!("invalid chunk window: {e}")))
}

fn render_results(results: &[SimilarityResult]) -> String {
    results
        .iter()
        .enumerate()
        .map(|(i, r)| format!("Document {} (score: {:.3}):\n{}", i + 1, r.score, r.document.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}
