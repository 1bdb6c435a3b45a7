//! Graph and preload-driven context (CAG).
//!
//! [`CagManager`] owns a [`KnowledgeGraph`] plus an optional preloaded block:
//! a ranked document set rendered once at setup and prepended to every
//! query. Two query paths:
//!
//! - `get_cached_context(query)`: preloaded block + query, TTL-cached.
//! - `get_context(query)`: graph neighbourhood of the indicators and known
//!   entity names in the query, compressed if it runs over budget.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::cache::TtlCache;
use crate::config::CagConfig;
use crate::error::AppError;
use crate::extract;
use crate::graph::{Entity, GraphProviderKind, KnowledgeGraph, RelatedEntity, Triplet};
use crate::knowledge::{self, SOURCE_KEY};
use crate::vector_store::Document;

/// Appended once to compressed context.
pub const TRUNCATION_MARKER: &str = "[... context truncated ...]";
const GRAPH_HEADER: &str = "Knowledge Graph Context:";
const DOCUMENT_HEADER_PREFIX: &str = "Document ";

// ── Types ─────────────────────────────────────────────────────────────────────

/// A rendered, ranked document set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreloadedContext {
    pub context: String,
    /// Distinct `source` metadata values, in order of first appearance.
    pub sources: Vec<String>,
    pub document_count: usize,
    pub estimated_tokens: usize,
    /// Hex sha256 of `context`.
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachedContext {
    pub combined_context: String,
    pub sources: Vec<String>,
    pub preloaded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CagStatus {
    pub initialized: bool,
    pub preload_available: bool,
    pub document_count: usize,
    pub estimated_tokens: usize,
    pub cache_size: usize,
    pub entity_count: usize,
    pub triplet_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CagKey {
    Preloaded(String),
    Graph(String),
}

// ── Manager ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct CagManager {
    config: CagConfig,
    graph: KnowledgeGraph,
    preload: RwLock<Option<PreloadedContext>>,
    cache: TtlCache<CagKey, String>,
    initialized: AtomicBool,
}

impl CagManager {
    pub fn new(config: &CagConfig) -> Result<Self, AppError> {
        let kind: GraphProviderKind = config.knowledge_graph.parse()?;
        Ok(Self {
            config: config.clone(),
            graph: KnowledgeGraph::build(kind),
            preload: RwLock::new(None),
            cache: TtlCache::new("cag", config.cache_ttl),
            initialized: AtomicBool::new(false),
        })
    }

    /// Mark ready and, when knowledge sources are enabled, preload the
    /// built-in technique catalogue.
    pub fn setup(&self) -> Result<(), AppError> {
        if self.config.enable_knowledge_sources && self.config.preload_mitre {
            self.preload_documents(&knowledge::mitre_documents());
        }
        self.initialized.store(true, Ordering::Release);
        info!(
            preload = self.preload_available(),
            entities = self.graph.entity_count(),
            "cag manager ready"
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Replace the preloaded block with `docs` (empty clears it).
    pub fn preload_documents(&self, docs: &[Document]) {
        let rendered = if docs.is_empty() { None } else { Some(build_preloaded_context(docs)) };
        if let Some(p) = &rendered {
            info!(documents = p.document_count, tokens = p.estimated_tokens, "preloaded context built");
        }
        *self.preload.write().unwrap_or_else(PoisonError::into_inner) = rendered;
        self.cache.invalidate();
    }

    pub fn preloaded(&self) -> Option<PreloadedContext> {
        self.preload.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn preload_available(&self) -> bool {
        self.preload.read().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    // ── Graph passthrough ────────────────────────────────────────────────

    // The graph itself stays private: every mutation goes through a method
    // here that also drops graph-derived cache entries.

    pub fn get_entity(&self, name: &str) -> Option<Entity> {
        self.graph.get_entity(name)
    }

    pub fn entity_count(&self) -> usize {
        self.graph.entity_count()
    }

    pub fn triplet_count(&self) -> usize {
        self.graph.triplet_count()
    }

    pub fn triplets_for(&self, name: &str) -> Vec<Triplet> {
        self.graph.triplets_for(name)
    }

    /// Create or merge an entity node.
    pub fn add_entity(&self, name: &str, labels: impl IntoIterator<Item = String>, properties: BTreeMap<String, String>) -> bool {
        let added = self.graph.add_entity(name, labels, properties);
        if added {
            self.cache.invalidate();
        }
        added
    }

    pub fn add_triplet(&self, subject: &str, relationship: &str, object: &str, properties: BTreeMap<String, String>) -> bool {
        let added = self.graph.add_triplet(subject, relationship, object, properties);
        if added {
            // Graph-derived entries may now be incomplete.
            self.cache.invalidate();
        }
        added
    }

    /// Traversal with configured defaults for omitted bounds.
    pub fn find_related_entities(&self, name: &str, depth: Option<usize>, limit: Option<usize>) -> Vec<RelatedEntity> {
        self.graph.find_related_entities(
            name,
            depth.unwrap_or(self.config.max_context_depth),
            limit.unwrap_or(self.config.max_related),
        )
    }

    /// Load a small built-in cybersecurity graph. Returns the number of
    /// triplets added.
    pub fn seed_default_knowledge(&self) -> usize {
        let mut edges = knowledge::mitre_triplets();
        edges.extend(
            DEFAULT_TRIPLETS
                .iter()
                .map(|(s, r, o)| (s.to_string(), r.to_string(), o.to_string())),
        );
        let added = edges
            .iter()
            .filter(|(s, r, o)| self.graph.add_triplet(s, r, o, BTreeMap::new()))
            .count();
        self.cache.invalidate();
        info!(triplets = added, "default knowledge seeded");
        added
    }

    // ── Query paths ──────────────────────────────────────────────────────

    /// Preloaded block followed by `query`. Without a preload the context is
    /// the query itself. `None` for an empty query.
    pub fn get_cached_context(&self, query: &str) -> Option<CachedContext> {
        if query.trim().is_empty() {
            return None;
        }
        let Some(preload) = self.preloaded() else {
            return Some(CachedContext { combined_context: query.to_string(), sources: Vec::new(), preloaded: true });
        };

        let key = CagKey::Preloaded(query.to_string());
        let combined_context = match self.cached(&key) {
            Some(hit) => hit,
            None => {
                let rendered = format!("{}\n\n{query}", preload.context);
                self.store(key, &rendered);
                rendered
            }
        };
        Some(CachedContext { combined_context, sources: preload.sources, preloaded: true })
    }

    /// Graph neighbourhood of the query's seed entities, or `None` when the
    /// query names nothing the graph knows.
    pub fn get_context(&self, query: &str) -> Option<String> {
        if query.trim().is_empty() {
            return None;
        }
        let key = CagKey::Graph(query.to_string());
        if let Some(hit) = self.cached(&key) {
            return Some(hit);
        }

        let seeds = self.seed_entities(query);
        if seeds.is_empty() {
            debug!("no graph entities in query");
            return None;
        }

        let mut lines = vec![GRAPH_HEADER.to_string()];
        let mut seen_edges = HashSet::new();
        let mut per_query = 0;
        for seed in &seeds {
            let related = self.find_related_entities(seed, None, None);
            if related.is_empty() {
                continue;
            }
            lines.push(format!("{seed}:"));
            for r in related {
                if per_query >= self.config.max_related {
                    break;
                }
                if seen_edges.insert(r.edge.to_string()) {
                    let labels = r.entity.labels.iter().cloned().collect::<Vec<_>>().join(", ");
                    if labels.is_empty() {
                        lines.push(format!("  - {}", r.edge));
                    } else {
                        lines.push(format!("  - {} [{}: {labels}]", r.edge, r.entity.name));
                    }
                    per_query += 1;
                }
            }
        }
        if per_query == 0 {
            return None;
        }

        let mut rendered = lines.join("\n");
        if rendered.chars().count() > self.config.max_context_length {
            rendered = self.compress_context(&rendered);
        }
        self.store(key, &rendered);
        Some(rendered)
    }

    /// Extracted indicators and mentioned entity names that exist in the
    /// graph, deduplicated, in order of discovery.
    fn seed_entities(&self, query: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        extract::extract(query)
            .into_iter()
            .filter_map(|e| self.graph.get_entity(&e.value).map(|ent| ent.name))
            .chain(self.graph.entities_mentioned_in(query))
            .filter(|name| seen.insert(name.clone()))
            .collect()
    }

    /// Compress to roughly the configured context budget.
    pub fn compress_context(&self, text: &str) -> String {
        compress_context(text, self.config.max_context_length)
    }

    // ── Cache ────────────────────────────────────────────────────────────

    fn cached(&self, key: &CagKey) -> Option<String> {
        if self.config.enable_caching { self.cache.get(key) } else { None }
    }

    fn store(&self, key: CagKey, value: &str) {
        if self.config.enable_caching {
            self.cache.insert(key, value.to_string());
        }
    }

    /// `true` only if a fresh preloaded entry exists for `query`.
    pub fn cached_response_valid(&self, query: &str) -> bool {
        self.cache.is_valid(&CagKey::Preloaded(query.to_string()))
    }

    pub fn invalidate_cache(&self) {
        self.cache.invalidate();
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    pub fn get_status(&self) -> CagStatus {
        let preload = self.preloaded();
        CagStatus {
            initialized: self.is_initialized(),
            preload_available: preload.is_some(),
            document_count: preload.as_ref().map_or(0, |p| p.document_count),
            estimated_tokens: preload.as_ref().map_or(0, |p| p.estimated_tokens),
            cache_size: self.cache_size(),
            entity_count: self.graph.entity_count(),
            triplet_count: self.graph.triplet_count(),
        }
    }

    /// The in-memory graph has no remote side; connected once set up.
    pub fn test_connection(&self) -> bool {
        self.is_initialized()
    }

    pub fn cleanup(&self) {
        self.cache.invalidate();
        self.initialized.store(false, Ordering::Release);
        info!("cag manager cleaned up");
    }
}

const DEFAULT_TRIPLETS: &[(&str, &str, &str)] = &[
    ("Mimikatz", "IS_TYPE", "Malware"),
    ("Mimikatz", "IMPLEMENTS", "T1003"),
    ("nmap", "IS_TYPE", "Tool"),
    ("nmap", "IMPLEMENTS", "T1046"),
    ("hydra", "IS_TYPE", "Tool"),
    ("hydra", "IMPLEMENTS", "T1110"),
    ("metasploit", "IS_TYPE", "Tool"),
    ("metasploit", "IMPLEMENTS", "T1190"),
    ("LinPEAS", "IS_TYPE", "Tool"),
    ("LinPEAS", "SUPPORTS", "T1068"),
    ("crontab", "ENABLES", "T1053"),
    ("ssh", "ENABLES", "T1021"),
    ("bash", "ENABLES", "T1059"),
];

// ── Rendering ─────────────────────────────────────────────────────────────────

/// Render `docs` as numbered blocks, highest `priority` metadata first
/// (ties keep input order).
pub fn build_preloaded_context(docs: &[Document]) -> PreloadedContext {
    let mut ranked: Vec<&Document> = docs.iter().collect();
    ranked.sort_by(|a, b| priority(b).total_cmp(&priority(a)));

    let mut sources = Vec::new();
    let mut blocks = Vec::with_capacity(ranked.len());
    for (i, doc) in ranked.iter().enumerate() {
        let source = doc.metadata.get(SOURCE_KEY).filter(|s| !s.trim().is_empty());
        match source {
            Some(s) => {
                if !sources.contains(s) {
                    sources.push(s.clone());
                }
                blocks.push(format!("{DOCUMENT_HEADER_PREFIX}{} [{s}]:\n{}", i + 1, doc.content));
            }
            None => blocks.push(format!("{DOCUMENT_HEADER_PREFIX}{}:\n{}", i + 1, doc.content)),
        }
    }

    let context = blocks.join("\n\n");
    PreloadedContext {
        estimated_tokens: estimate_tokens(&context),
        fingerprint: hex::encode(Sha256::digest(context.as_bytes())),
        sources,
        document_count: ranked.len(),
        context,
    }
}

fn priority(doc: &Document) -> f64 {
    doc.metadata.get("priority").and_then(|p| p.trim().parse().ok()).unwrap_or(0.0)
}

/// Roughly four characters per token, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

fn is_header(line: &str) -> bool {
    line.strip_prefix(DOCUMENT_HEADER_PREFIX)
        .is_some_and(|rest| rest.starts_with(|c: char| c.is_ascii_digit()) && line.trim_end().ends_with(':'))
}

#[derive(Debug)]
struct Block<'a> {
    header: Option<&'a str>,
    body: String,
}

fn split_blocks(text: &str) -> Vec<Block<'_>> {
    let mut blocks: Vec<Block<'_>> = Vec::new();
    for line in text.lines() {
        if is_header(line) {
            blocks.push(Block { header: Some(line), body: String::new() });
            continue;
        }
        if blocks.is_empty() {
            // Preamble: its first line acts as a header.
            blocks.push(Block { header: Some(line), body: String::new() });
            continue;
        }
        if let Some(last) = blocks.last_mut() {
            if !last.body.is_empty() {
                last.body.push('\n');
            }
            last.body.push_str(line);
        }
    }
    blocks
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn render_blocks(blocks: &[Block<'_>], body_budget: usize) -> String {
    let mut out: Vec<String> = Vec::with_capacity(blocks.len() + 1);
    for b in blocks {
        let mut part = b.header.unwrap_or_default().to_string();
        let body = truncate_chars(b.body.trim(), body_budget).trim_end();
        if !body.is_empty() {
            part.push('\n');
            part.push_str(body);
        }
        out.push(part);
    }
    out.push(TRUNCATION_MARKER.to_string());
    out.join("\n")
}

/// Shrink `text` toward `target` characters: every header line is kept, each
/// body is cut to an equal share of what remains, and [`TRUNCATION_MARKER`]
/// is appended. The result is strictly shorter than `text`; if no body content
/// can be removed, `text` is returned unchanged.
pub fn compress_context(text: &str, target: usize) -> String {
    let original_len = text.chars().count();
    let blocks = split_blocks(text);
    if blocks.is_empty() {
        return text.to_string();
    }

    let fixed: usize = blocks.iter().map(|b| b.header.map_or(0, |h| h.chars().count()) + 1).sum::<usize>()
        + TRUNCATION_MARKER.chars().count();
    let mut budget = target.saturating_sub(fixed) / blocks.len();

    loop {
        let rendered = render_blocks(&blocks, budget);
        if rendered.chars().count() < original_len {
            return rendered;
        }
        if budget == 0 {
            return text.to_string();
        }
        budget /= 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::time::Duration;

    fn manager() -> CagManager {
        let cag = CagManager::new(&Config::offline().cag).unwrap();
        cag.setup().unwrap();
        cag
    }

    fn doc(id: &str, source: &str, priority: &str) -> Document {
        Document::new(id, format!("body of {id}")).with_meta("source", source).with_meta("priority", priority)
    }

    #[test]
    fn unknown_graph_provider_fails() {
        let mut cfg = Config::offline().cag;
        cfg.knowledge_graph = "neo4j".into();
        assert!(matches!(CagManager::new(&cfg), Err(AppError::Config(_))));
    }

    #[test]
    fn preload_orders_by_priority_and_dedups_sources() {
        let docs = vec![doc("a", "mitre", "1"), doc("b", "man", "5"), doc("c", "mitre", "5"), doc("d", "", "0")];
        let p = build_preloaded_context(&docs);
        let order: Vec<usize> = ["body of b", "body of c", "body of a", "body of d"]
            .iter()
            .map(|needle| p.context.find(needle).unwrap())
            .collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]));
        assert!(p.context.starts_with("Document 1 [man]:"));
        assert!(p.context.contains("Document 4:\nbody of d"));
        assert_eq!(p.sources, vec!["man".to_string(), "mitre".to_string()]);
        assert_eq!(p.document_count, 4);
        assert_eq!(p.estimated_tokens, p.context.chars().count().div_ceil(4));
        assert_eq!(p.fingerprint.len(), 64);
    }

    #[test]
    fn without_preload_context_is_query() {
        let cag = manager();
        let ctx = cag.get_cached_context("how does nmap work").unwrap();
        assert_eq!(ctx.combined_context, "how does nmap work");
        assert!(ctx.sources.is_empty());
        assert!(ctx.preloaded);
        assert!(cag.get_cached_context("  ").is_none());
    }

    #[test]
    fn preloaded_context_is_cached() {
        let cag = manager();
        cag.preload_documents(&[doc("a", "mitre", "1")]);
        let first = cag.get_cached_context("q").unwrap();
        assert!(first.combined_context.ends_with("\n\nq"));
        assert_eq!(first.sources, vec!["mitre".to_string()]);
        assert!(cag.cached_response_valid("q"));
        assert!(!cag.cached_response_valid("other"));
        assert_eq!(cag.get_cached_context("q").unwrap(), first);

        cag.invalidate_cache();
        assert_eq!(cag.cache_size(), 0);
        assert!(!cag.cached_response_valid("q"));
    }

    #[test]
    fn zero_ttl_never_valid() {
        let mut cfg = Config::offline().cag;
        cfg.cache_ttl = Duration::ZERO;
        let cag = CagManager::new(&cfg).unwrap();
        cag.preload_documents(&[doc("a", "mitre", "1")]);
        cag.get_cached_context("q").unwrap();
        assert!(!cag.cached_response_valid("q"));
    }

    #[test]
    fn setup_preloads_catalogue_when_enabled() {
        let mut cfg = Config::offline().cag;
        cfg.enable_knowledge_sources = true;
        let cag = CagManager::new(&cfg).unwrap();
        cag.setup().unwrap();
        let status = cag.get_status();
        assert!(status.initialized);
        assert!(status.preload_available);
        assert!(status.document_count > 0);
        assert!(status.estimated_tokens > 0);
        let ctx = cag.get_cached_context("credential dumping").unwrap();
        assert!(ctx.combined_context.starts_with("Document 1 [MITRE ATT&CK T1003]:"));
    }

    #[test]
    fn graph_context_from_mentions_and_indicators() {
        let cag = manager();
        cag.seed_default_knowledge();
        let ctx = cag.get_context("is mimikatz related to T1003?").unwrap();
        assert!(ctx.starts_with("Knowledge Graph Context:"));
        assert!(ctx.contains("Mimikatz IS_TYPE Malware"));
        assert!(ctx.contains("T1003 BELONGS_TO Credential Access"));
        assert!(cag.get_context("the weather is nice").is_none());
    }

    #[test]
    fn oversized_graph_context_is_compressed() {
        let mut cfg = Config::offline().cag;
        cfg.max_context_length = 60;
        let cag = CagManager::new(&cfg).unwrap();
        cag.setup().unwrap();
        cag.seed_default_knowledge();
        let ctx = cag.get_context("mimikatz").unwrap();
        assert!(ctx.starts_with(GRAPH_HEADER));
        assert!(ctx.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn compression_keeps_headers_and_shrinks() {
        let body = "lorem ipsum dolor sit amet ".repeat(20);
        let text = format!("Document 1:\n{body}\n\nDocument 2 [mitre]:\n{body}\n\nDocument 3:\n{body}");
        let out = compress_context(&text, 200);
        assert!(out.chars().count() < text.chars().count());
        for h in ["Document 1:", "Document 2 [mitre]:", "Document 3:"] {
            assert!(out.contains(h), "missing {h}");
        }
        assert!(out.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn compression_shrinks_even_with_tiny_budget() {
        let text = format!("Document 1:\n{}", "x".repeat(100));
        let out = compress_context(&text, 0);
        assert!(out.chars().count() < text.chars().count());
        assert!(out.starts_with("Document 1:"));
    }

    #[test]
    fn headers_win_when_they_alone_exceed_the_target() {
        let text = (1..=30)
            .map(|n| format!("Document {n} [source-{n}]:\nbody text for entry number {n} here"))
            .collect::<Vec<_>>()
            .join("\n\n");
        let out = compress_context(&text, 50);
        assert!(out.chars().count() < text.chars().count());
        assert!(out.chars().count() > 50);
        for n in 1..=30 {
            assert!(out.contains(&format!("Document {n} [source-{n}]:")), "missing header {n}");
        }
        assert!(!out.contains("body text"));
        assert!(out.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn entity_changes_refresh_graph_context() {
        let cag = manager();
        cag.seed_default_knowledge();
        let before = cag.get_context("mimikatz").unwrap();
        assert!(!before.contains("Category"));
        assert!(cag.add_entity("Malware", ["Category".to_string()], BTreeMap::new()));
        assert_eq!(cag.cache_size(), 0);
        let after = cag.get_context("mimikatz").unwrap();
        assert!(after.contains("Category"), "{after}");
        assert_eq!(cag.get_entity("malware").map(|e| e.name), Some("Malware".to_string()));
        assert!(cag.triplets_for("Mimikatz").len() >= 2);
        assert!(cag.entity_count() > 0 && cag.triplet_count() > 0);
    }

    #[test]
    fn compression_without_removable_content_is_identity() {
        assert_eq!(compress_context("Document 1:", 0), "Document 1:");
    }

    #[test]
    fn cleanup_clears_cache_and_connection() {
        let cag = manager();
        cag.preload_documents(&[doc("a", "mitre", "1")]);
        cag.get_cached_context("q");
        assert!(cag.test_connection());
        cag.cleanup();
        assert_eq!(cag.cache_size(), 0);
        assert!(!cag.test_connection());
    }
}
