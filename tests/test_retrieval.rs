//! Integration tests for the retrieval facade and its RAG/CAG managers.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::thread;

use ragcag::config::{self, Config};
use ragcag::rag::RagManager;
use ragcag::vector_store::Document;
use ragcag::{ContextOptions, RagCagManager};
use tempfile::NamedTempFile;

// ── Helpers ───────────────────────────────────────────────────────────────────

fn ready() -> RagCagManager {
    let mut manager = RagCagManager::new(Config::offline());
    assert!(manager.setup(), "offline setup");
    manager
}

fn cyber_docs() -> Vec<Document> {
    vec![
        Document::new(
            "cred_dump",
            "Credential dumping pulls password hashes from LSASS memory; Mimikatz is the classic tool.",
        )
        .with_meta("source", "notes/credential_access.md"),
        Document::new("recon", "Reconnaissance with nmap maps open ports and service versions on a subnet."),
        Document::new("privesc", "Privilege escalation on Linux often abuses SUID binaries or sudo misconfiguration."),
    ]
}

// ── RAG ───────────────────────────────────────────────────────────────────────

#[test]
fn kb_scenario_returns_scored_block() {
    let cfg = Config::offline();
    let rag = RagManager::new(&cfg.rag, &cfg.embedding).expect("rag");
    rag.setup().expect("setup");

    assert!(rag.add_knowledge_base("kb", cyber_docs(), None).expect("add"));
    let ctx = rag.retrieve_relevant_context("credential dumping", "kb", None).expect("context");
    assert!(ctx.contains("Document 1 (score: "));
    assert!(ctx.contains("Credential dumping pulls password hashes"));
}

#[test]
fn re_adding_an_id_updates_in_place() {
    let cfg = Config::offline();
    let rag = RagManager::new(&cfg.rag, &cfg.embedding).expect("rag");
    rag.setup().expect("setup");
    rag.add_knowledge_base("kb", cyber_docs(), None).expect("add");
    rag.add_knowledge_base("kb", vec![Document::new("recon", "Updated recon notes.")], None).expect("re-add");

    assert_eq!(rag.get_collection_stats("kb").expect("stats").document_count, 3);
    assert_eq!(rag.get_document("kb", "recon").expect("doc").content, "Updated recon notes.");
}

// ── Graph ─────────────────────────────────────────────────────────────────────

#[test]
fn mimikatz_triplet_is_traversable() {
    let manager = ready();
    assert!(manager.add_knowledge_triplet("Mimikatz", "IS_TYPE", "Malware", BTreeMap::new()));
    let related = manager.find_related_entities("Mimikatz", None, None);
    assert!(!related.is_empty());
    assert!(related.iter().any(|r| r.entity.name == "Malware"));
    assert!(manager.find_related_entities("Unknown", None, None).is_empty());
}

// ── Facade ────────────────────────────────────────────────────────────────────

#[test]
fn repeated_query_within_ttl_is_identical() {
    let manager = ready();
    manager.seed_default_knowledge();
    let opts = ContextOptions::default();
    let first = manager.get_enhanced_context("how does mimikatz dump credentials", &opts).expect("first");
    let second = manager.get_enhanced_context("how does mimikatz dump credentials", &opts).expect("second");
    assert_eq!(first.combined_context, second.combined_context);
}

#[test]
fn invalidate_cache_empties_every_layer() {
    let manager = ready();
    manager.seed_default_knowledge();
    manager.get_enhanced_context("nmap service discovery", &ContextOptions::default());
    assert!(manager.get_retrieval_stats().cache_size > 0);
    manager.invalidate_cache();
    assert_eq!(manager.get_retrieval_stats().cache_size, 0);
}

#[test]
fn custom_collection_override() {
    let manager = ready();
    assert!(manager.add_custom_knowledge("kb", cyber_docs(), vec![]));
    let opts = ContextOptions { custom_collection: Some("kb".into()), include_cag: false, ..Default::default() };
    let ctx = manager.get_enhanced_context("suid privilege escalation", &opts).expect("context");
    assert!(ctx.combined_context.contains("SUID binaries"));
}

#[test]
fn extract_entities_via_facade() {
    let manager = ready();
    let found = manager.extract_entities("beacon from 172.16.0.4 to https://c2.example/x");
    let kinds: Vec<&str> = found.iter().map(|e| e.kind.as_str()).collect();
    assert_eq!(kinds, vec!["ip_address", "url"]);
    assert!(manager.extract_entities("\u{0}\u{1}\u{2}").is_empty());
}

#[test]
fn concurrent_queries_share_one_manager() {
    let manager = ready();
    manager.seed_default_knowledge();
    let manager = Arc::new(manager);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let m = Arc::clone(&manager);
            thread::spawn(move || {
                let query = if i % 2 == 0 { "credential dumping" } else { "nmap port scan" };
                let a = m.get_enhanced_context(query, &ContextOptions::default());
                if i % 3 == 0 {
                    m.invalidate_cache();
                }
                let b = m.get_enhanced_context(query, &ContextOptions::default());
                assert_eq!(a.map(|c| c.combined_context), b.map(|c| c.combined_context));
            })
        })
        .collect();
    for h in handles {
        h.join().expect("thread");
    }
}

#[test]
fn config_file_drives_setup() {
    let mut f = NamedTempFile::new().expect("tempfile");
    writeln!(
        f,
        r#"
[rag]
embedding_service = "mock"
allow_placeholder_embeddings = true
collection_name = "lab"

[embedding]
dimension = 64

[retrieval]
enable_cag = false
"#
    )
    .expect("write");

    let cfg = config::load_from(f.path(), None, None).expect("load");
    let mut manager = RagCagManager::new(cfg);
    assert!(manager.setup());
    let stats = manager.get_retrieval_stats();
    assert!(stats.rag_enabled);
    assert!(!stats.cag_enabled);
    assert_eq!(manager.rag().expect("rag").default_collection(), "lab");
}

#[test]
fn bad_provider_in_config_fails_setup() {
    let mut f = NamedTempFile::new().expect("tempfile");
    writeln!(f, "[rag]\nvector_db = \"chromadb\"").expect("write");
    let cfg = config::load_from(f.path(), None, None).expect("load");
    let mut manager = RagCagManager::new(cfg);
    assert!(!manager.setup());
    assert!(manager.get_enhanced_context("anything", &ContextOptions::default()).is_none());
}
