//! Top-level retrieval facade.
//!
//! [`RagCagManager`] owns the RAG and CAG managers (each optional, per
//! `[retrieval]` switches), fuses their output under a weighted character
//! budget and caches the fused result per (query, options).
//!
//! Build it with [`RagCagManager::new`], call [`RagCagManager::setup`] once,
//! then share it (e.g. behind an `Arc`); every query method takes `&self`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cache::TtlCache;
use crate::cag::{CagManager, compress_context};
use crate::config::Config;
use crate::error::AppError;
use crate::extract::{self, ExtractedEntity};
use crate::fusion::ContextRetriever;
use crate::graph::{RelatedEntity, Triplet};
use crate::knowledge;
use crate::rag::RagManager;
use crate::vector_store::Document;

const RAG_SECTION: &str = "RAG Context:";
const CAG_SECTION: &str = "CAG Context:";

/// Per-call retrieval options. Part of the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextOptions {
    /// Search this collection instead of the configured default.
    pub custom_collection: Option<String>,
    pub max_results: Option<usize>,
    pub include_rag: bool,
    pub include_cag: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self { custom_collection: None, max_results: None, include_rag: true, include_cag: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnhancedContext {
    pub combined_context: String,
    pub rag_context: Option<String>,
    pub cag_context: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalStats {
    pub initialized: bool,
    pub rag_enabled: bool,
    pub cag_enabled: bool,
    /// Entries across the facade, RAG and CAG caches.
    pub cache_size: usize,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EnhancedKey {
    query: String,
    options: ContextOptions,
}

#[derive(Debug)]
pub struct RagCagManager {
    config: Config,
    rag: Option<RagManager>,
    cag: Option<CagManager>,
    cache: TtlCache<EnhancedKey, EnhancedContext>,
    initialized: AtomicBool,
    last_updated: RwLock<Option<DateTime<Utc>>>,
}

impl RagCagManager {
    pub fn new(config: Config) -> Self {
        let cache = TtlCache::new("retrieval", config.retrieval.cache_ttl);
        Self {
            config,
            rag: None,
            cag: None,
            cache,
            initialized: AtomicBool::new(false),
            last_updated: RwLock::new(None),
        }
    }

    /// Build and connect the enabled sub-managers. Returns `false` (and logs
    /// why) on any configuration or provider error.
    pub fn setup(&mut self) -> bool {
        match self.try_setup() {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "retrieval setup failed");
                self.rag = None;
                self.cag = None;
                self.initialized.store(false, Ordering::Release);
                false
            }
        }
    }

    /// Alias of [`RagCagManager::setup`].
    pub fn initialize(&mut self) -> bool {
        self.setup()
    }

    fn try_setup(&mut self) -> Result<(), AppError> {
        let retrieval = &self.config.retrieval;
        if retrieval.enable_rag {
            let rag = RagManager::new(&self.config.rag, &self.config.embedding)?;
            rag.setup()?;
            self.rag = Some(rag);
        }
        if retrieval.enable_cag {
            let cag = CagManager::new(&self.config.cag)?;
            cag.setup()?;
            self.cag = Some(cag);
        }
        self.initialized.store(true, Ordering::Release);
        self.touch();
        info!(rag = self.rag.is_some(), cag = self.cag.is_some(), "retrieval facade ready");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn rag(&self) -> Option<&RagManager> {
        self.rag.as_ref()
    }

    pub fn cag(&self) -> Option<&CagManager> {
        self.cag.as_ref()
    }

    fn touch(&self) {
        *self.last_updated.write().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
    }

    // ── Query ─────────────────────────────────────────────────────────────

    /// Weighted fusion of RAG and CAG context for `query`.
    ///
    /// Each available section gets a share of `max_context_length`
    /// proportional to its weight (a lone section gets all of it; unused
    /// budget flows to the other). Sections are emitted heavier first.
    /// `None` for an empty query or when neither side has anything.
    pub fn get_enhanced_context(&self, query: &str, options: &ContextOptions) -> Option<EnhancedContext> {
        if query.trim().is_empty() {
            return None;
        }
        if !self.is_initialized() {
            warn!("enhanced context requested before setup");
            return None;
        }

        let key = EnhancedKey { query: query.to_string(), options: options.clone() };
        let caching = self.config.retrieval.enable_caching;
        if caching {
            if let Some(hit) = self.cache.get(&key) {
                return Some(hit);
            }
        }

        let rag_context = self.rag_context(query, options);
        let cag_context = self.cag_context(query, options);
        let combined_context = self.fuse(rag_context.as_deref(), cag_context.as_deref())?;

        let result = EnhancedContext { combined_context, rag_context, cag_context };
        if caching {
            self.cache.insert(key, result.clone());
        }
        debug!(
            rag = result.rag_context.is_some(),
            cag = result.cag_context.is_some(),
            len = result.combined_context.len(),
            "enhanced context built"
        );
        Some(result)
    }

    fn rag_context(&self, query: &str, options: &ContextOptions) -> Option<String> {
        if !options.include_rag {
            return None;
        }
        let rag = self.rag.as_ref()?;
        let collection = options.custom_collection.as_deref().unwrap_or(rag.default_collection());
        rag.retrieve_relevant_context(query, collection, options.max_results)
    }

    /// Graph neighbourhood followed by the preloaded block, whichever exist.
    fn cag_context(&self, query: &str, options: &ContextOptions) -> Option<String> {
        if !options.include_cag {
            return None;
        }
        let cag = self.cag.as_ref()?;
        let parts: Vec<String> = [cag.get_context(query), cag.preloaded().map(|p| p.context)]
            .into_iter()
            .flatten()
            .collect();
        if parts.is_empty() { None } else { Some(parts.join("\n\n")) }
    }

    fn fuse(&self, rag: Option<&str>, cag: Option<&str>) -> Option<String> {
        let retrieval = &self.config.retrieval;
        let total = retrieval.max_context_length;

        let sections: Vec<(&str, &str, f32)> = [
            rag.map(|text| (RAG_SECTION, text, retrieval.rag_weight)),
            cag.map(|text| (CAG_SECTION, text, retrieval.cag_weight)),
        ]
        .into_iter()
        .flatten()
        .collect();
        if sections.is_empty() {
            return None;
        }

        let weight_sum: f32 = sections.iter().map(|s| s.2).sum();
        let lens: Vec<usize> = sections.iter().map(|s| s.1.chars().count()).collect();
        let mut budgets: Vec<usize> = sections
            .iter()
            .map(|s| {
                let share = if weight_sum > 0.0 { s.2 / weight_sum } else { 1.0 / sections.len() as f32 };
                (total as f32 * share).round() as usize
            })
            .collect();
        // Give budget a short section leaves unused to the other one.
        if budgets.len() == 2 {
            for (i, j) in [(0, 1), (1, 0)] {
                if lens[i] < budgets[i] {
                    budgets[j] += budgets[i] - lens[i];
                    budgets[i] = lens[i];
                }
            }
        }

        let mut order: Vec<usize> = (0..sections.len()).collect();
        // Stable: equal weights keep RAG first.
        order.sort_by(|&a, &b| sections[b].2.total_cmp(&sections[a].2));

        let rendered: Vec<String> = order
            .into_iter()
            .map(|i| {
                let (title, text, _) = sections[i];
                let body = if lens[i] > budgets[i] { compress_context(text, budgets[i]) } else { text.to_string() };
                format!("{title}\n{body}")
            })
            .collect();
        Some(rendered.join("\n\n"))
    }

    // ── Delegation ────────────────────────────────────────────────────────

    pub fn extract_entities(&self, text: &str) -> Vec<ExtractedEntity> {
        extract::extract(text)
    }

    pub fn add_knowledge_triplet(
        &self,
        subject: &str,
        relationship: &str,
        object: &str,
        properties: BTreeMap<String, String>,
    ) -> bool {
        let Some(cag) = &self.cag else {
            warn!("knowledge graph disabled; triplet dropped");
            return false;
        };
        let added = cag.add_triplet(subject, relationship, object, properties);
        if added {
            self.cache.invalidate();
            self.touch();
        }
        added
    }

    /// Related entities with configured defaults for omitted bounds; empty
    /// when the graph is disabled.
    pub fn find_related_entities(&self, name: &str, depth: Option<usize>, limit: Option<usize>) -> Vec<RelatedEntity> {
        self.cag
            .as_ref()
            .map(|cag| cag.find_related_entities(name, depth, limit))
            .unwrap_or_default()
    }

    /// Add `documents` to the RAG collection `name` and `triplets` to the
    /// graph. `true` only if every part that was requested succeeded.
    pub fn add_custom_knowledge(&self, name: &str, documents: Vec<Document>, triplets: Vec<Triplet>) -> bool {
        let mut ok = true;

        if !documents.is_empty() {
            ok &= match &self.rag {
                Some(rag) => rag.add_knowledge_base(name, documents, None).unwrap_or_else(|e| {
                    warn!(collection = name, error = %e, "custom documents rejected");
                    false
                }),
                None => {
                    warn!("rag disabled; custom documents dropped");
                    false
                }
            };
        }

        for t in triplets {
            ok &= match &self.cag {
                Some(cag) => cag.add_triplet(&t.subject, &t.relationship, &t.object, t.properties),
                None => false,
            };
        }

        self.cache.invalidate();
        self.touch();
        ok
    }

    /// Built-in MITRE techniques into the default RAG collection and the
    /// default cybersecurity graph into CAG.
    pub fn seed_default_knowledge(&self) -> bool {
        let mut ok = true;
        if let Some(rag) = &self.rag {
            let collection = rag.default_collection().to_string();
            ok &= rag
                .add_knowledge_base(&collection, knowledge::mitre_documents(), None)
                .unwrap_or_else(|e| {
                    warn!(error = %e, "seeding rag knowledge failed");
                    false
                });
        }
        if let Some(cag) = &self.cag {
            ok &= cag.seed_default_knowledge() > 0;
        }
        self.cache.invalidate();
        self.touch();
        ok
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    /// Clear the facade cache and both sub-manager caches.
    pub fn invalidate_cache(&self) {
        self.cache.invalidate();
        if let Some(rag) = &self.rag {
            rag.invalidate_cache();
        }
        if let Some(cag) = &self.cag {
            cag.invalidate_cache();
        }
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
            + self.rag.as_ref().map_or(0, RagManager::cache_size)
            + self.cag.as_ref().map_or(0, CagManager::cache_size)
    }

    pub fn get_retrieval_stats(&self) -> RetrievalStats {
        RetrievalStats {
            initialized: self.is_initialized(),
            rag_enabled: self.rag.is_some(),
            cag_enabled: self.cag.is_some(),
            cache_size: self.cache_size(),
            last_updated: *self.last_updated.read().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// `true` only if set up and every enabled sub-manager is connected.
    pub fn test_connections(&self) -> bool {
        self.is_initialized()
            && self.rag.as_ref().is_none_or(RagManager::test_connection)
            && self.cag.as_ref().is_none_or(CagManager::test_connection)
    }

    pub fn cleanup(&self) {
        if let Some(rag) = &self.rag {
            rag.cleanup();
        }
        if let Some(cag) = &self.cag {
            cag.cleanup();
        }
        self.cache.invalidate();
        self.initialized.store(false, Ordering::Release);
        info!("retrieval facade cleaned up");
    }
}

impl ContextRetriever for RagCagManager {
    fn retrieve_context(&self, query: &str, collection: Option<&str>) -> Option<String> {
        let options = ContextOptions { custom_collection: collection.map(str::to_string), ..ContextOptions::default() };
        self.get_enhanced_context(query, &options).map(|c| c.combined_context)
    }
}
