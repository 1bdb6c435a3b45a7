//! Context fusion: explicit knowledge plus similarity-search context, merged
//! into one bounded, attribution-preserving string.
//!
//! The active [`CombineMode`] comes from the per-bot attack configuration
//! ([`AttackConfigProvider`]); anything missing or unrecognised falls back to
//! `explicit_first`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::FusionConfig;
use crate::knowledge::{ContextConfig, KnowledgeItem, KnowledgeSourceRegistry, SourceKind};

pub const EXPLICIT_HEADER: &str = "Explicit Knowledge Sources:";
pub const SIMILARITY_HEADER: &str = "Similarity Search Results:";
pub const CONTENT_TRUNCATED: &str = "[Content truncated...]";
/// Slack allowed over `max_length` in [`format_explicit_knowledge`].
pub const LENGTH_MARGIN: usize = 100;

const NO_SIMILAR_CONTENT: &str = "No similar content found.";
const MIN_CONTENT: usize = 20;

// ── Combine mode ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineMode {
    ExplicitOnly,
    #[default]
    ExplicitFirst,
    Combined,
}

impl CombineMode {
    /// Parse a mode name; unknown names map to [`CombineMode::ExplicitFirst`].
    pub fn parse_or_default(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "explicit_only" => CombineMode::ExplicitOnly,
            "combined" => CombineMode::Combined,
            "explicit_first" => CombineMode::ExplicitFirst,
            other => {
                debug!(mode = other, "unrecognised combine mode, using explicit_first");
                CombineMode::ExplicitFirst
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CombineMode::ExplicitOnly => "explicit_only",
            CombineMode::ExplicitFirst => "explicit_first",
            CombineMode::Combined => "combined",
        }
    }
}

impl fmt::Display for CombineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Explicit-knowledge rendering ──────────────────────────────────────────────

struct Section<'a> {
    title: &'static str,
    items: Vec<&'a KnowledgeItem>,
}

/// Items grouped by normalised kind, in fixed section order, empty groups
/// omitted.
fn group(items: &[KnowledgeItem]) -> Vec<Section<'_>> {
    [SourceKind::ManPage, SourceKind::Document, SourceKind::Mitre]
        .into_iter()
        .map(|kind| Section {
            title: kind.section_title(),
            items: items.iter().filter(|i| i.kind() == kind).collect(),
        })
        .filter(|s| !s.items.is_empty())
        .collect()
}

fn attribution_lines(item: &KnowledgeItem) -> Vec<String> {
    let mut lines = vec![format!("Source: {}", item.attribution())];
    if item.kind() == SourceKind::Mitre {
        match (item.meta("technique_id"), item.meta("technique_name")) {
            (Some(id), Some(name)) => lines.push(format!("Technique: {id} - {name}")),
            (Some(id), None) | (None, Some(id)) => lines.push(format!("Technique: {id}")),
            (None, None) => {}
        }
        if let Some(tactic) = item.meta("tactic") {
            lines.push(format!("Tactic: {tactic}"));
        }
    }
    lines
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Render with per-item body limits (`None` = whole body), in item order
/// across sections.
fn render(sections: &[Section<'_>], limits: &[Option<usize>]) -> String {
    let mut out = String::from(EXPLICIT_HEADER);
    let mut idx = 0;
    for section in sections {
        out.push_str("\n\n--- ");
        out.push_str(section.title);
        out.push_str(" ---");
        for (n, item) in section.items.iter().enumerate() {
            out.push_str(if n == 0 { "\n" } else { "\n\n" });
            out.push_str(&attribution_lines(item).join("\n"));

            let body = item.content.trim();
            let (shown, cut) = match limits[idx] {
                Some(limit) if body.chars().count() > limit => (truncate_chars(body, limit).trim_end(), true),
                _ => (body, false),
            };
            if !shown.is_empty() {
                out.push('\n');
                out.push_str(shown);
            }
            if cut {
                out.push('\n');
                out.push_str(CONTENT_TRUNCATED);
            }
            idx += 1;
        }
    }
    out
}

/// Render explicit knowledge grouped into Man Pages, Documents and MITRE
/// ATT&CK Techniques sections.
///
/// With `max_length`, output stays within `max_length + LENGTH_MARGIN`
/// characters as long as the headers, attribution lines and truncation
/// markers themselves fit. Attribution is never dropped; only bodies are
/// shortened, each cut body ending in [`CONTENT_TRUNCATED`].
pub fn format_explicit_knowledge(items: Option<&[KnowledgeItem]>, max_length: Option<usize>) -> String {
    let Some(items) = items.filter(|i| !i.is_empty()) else {
        return String::new();
    };
    let sections = group(items);
    let ordered: Vec<&KnowledgeItem> = sections.iter().flat_map(|s| s.items.iter().copied()).collect();
    let unbounded = render(&sections, &vec![None; ordered.len()]);

    let Some(max) = max_length else {
        return unbounded;
    };
    if unbounded.chars().count() <= max {
        return unbounded;
    }

    let body_lens: Vec<usize> = ordered.iter().map(|i| i.content.trim().chars().count()).collect();
    // Headers and attribution only: rendering every body at zero length adds
    // one marker line per non-empty body, which is backed out here.
    let cut = body_lens.iter().filter(|&&len| len > 0).count();
    let fixed = render(&sections, &vec![Some(0); ordered.len()]).chars().count()
        - cut * (CONTENT_TRUNCATED.chars().count() + 1);
    let mut limits = water_fill(&body_lens, max.saturating_sub(fixed));

    let ceiling = max + LENGTH_MARGIN;
    loop {
        let rendered = render(&sections, &limits);
        if rendered.chars().count() <= ceiling {
            return rendered;
        }
        // Still over: halve every cut body until it fits or nothing is left.
        let mut shrunk = false;
        for (limit, len) in limits.iter_mut().zip(&body_lens) {
            let current = limit.unwrap_or(*len);
            if current > 0 {
                *limit = Some(current / 2);
                shrunk = true;
            }
        }
        if !shrunk {
            return rendered;
        }
    }
}

/// Share `available` characters across bodies: short bodies are kept whole,
/// the rest split what remains equally (each paying for its newline and
/// truncation marker). Every cut body keeps a small floor of content.
fn water_fill(body_lens: &[usize], available: usize) -> Vec<Option<usize>> {
    let n = body_lens.len();
    let marker_cost = CONTENT_TRUNCATED.chars().count() + 2;
    let floor = MIN_CONTENT.min(LENGTH_MARGIN / 2 / n.max(1));

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by_key(|&i| body_lens[i]);

    let mut limits = vec![None; n];
    let mut remaining = available;
    for (k, &i) in order.iter().enumerate() {
        let share = remaining / (n - k);
        let whole = body_lens[i] + 1;
        if whole <= share {
            remaining -= whole;
        } else {
            limits[i] = Some(share.saturating_sub(marker_cost).max(floor));
            remaining = remaining.saturating_sub(share);
        }
    }
    limits
}

// ── Attack configuration seam ─────────────────────────────────────────────────

/// Per-attack fusion settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AttackSettings {
    #[serde(default)]
    pub combine_mode: Option<String>,
    #[serde(default)]
    pub context_config: ContextConfig,
}

/// Supplies the attack a bot is running and that attack's settings.
pub trait AttackConfigProvider: Send + Sync + fmt::Debug {
    fn attack_settings(&self, bot: &str) -> Option<AttackSettings>;
}

/// Map-backed provider: attacks by id, bots assigned to attacks.
#[derive(Debug, Clone, Default)]
pub struct StaticAttackConfig {
    attacks: HashMap<String, AttackSettings>,
    assignments: HashMap<String, String>,
}

impl StaticAttackConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attack(mut self, attack: impl Into<String>, settings: AttackSettings) -> Self {
        self.attacks.insert(attack.into(), settings);
        self
    }

    pub fn assign(mut self, bot: impl Into<String>, attack: impl Into<String>) -> Self {
        self.assignments.insert(bot.into(), attack.into());
        self
    }
}

impl AttackConfigProvider for StaticAttackConfig {
    fn attack_settings(&self, bot: &str) -> Option<AttackSettings> {
        let attack = self.assignments.get(bot)?;
        self.attacks.get(attack).cloned()
    }
}

/// Similarity/graph context supplier consumed by the fusion engine.
pub trait ContextRetriever: Send + Sync {
    /// Rendered context for `query`, `None` when nothing relevant exists.
    fn retrieve_context(&self, query: &str, collection: Option<&str>) -> Option<String>;
}

// ── Engine ────────────────────────────────────────────────────────────────────

#[derive(Default, Clone, Copy)]
pub struct CombineOptions<'a> {
    pub retriever: Option<&'a dyn ContextRetriever>,
    pub collection: Option<&'a str>,
    /// Overrides the configured explicit-section budget.
    pub max_length: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FusedContext {
    pub combine_mode: CombineMode,
    pub combined_context: String,
}

/// Everything prompt assembly needs for one turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextBundle {
    pub original_query: String,
    pub explicit_context: Vec<KnowledgeItem>,
    /// Distinct attributions, in item order.
    pub explicit_sources: Vec<String>,
    pub has_explicit: bool,
    pub combined_context: String,
    pub combine_mode: CombineMode,
    /// Externally formatted VM state, passed through untouched.
    pub vm_context: Option<String>,
}

#[derive(Debug)]
pub struct ContextFusionEngine {
    sources: KnowledgeSourceRegistry,
    attacks: Arc<dyn AttackConfigProvider>,
    default_mode: CombineMode,
    explicit_max_length: Option<usize>,
}

impl ContextFusionEngine {
    pub fn new(
        config: &FusionConfig,
        sources: KnowledgeSourceRegistry,
        attacks: Arc<dyn AttackConfigProvider>,
    ) -> Self {
        Self {
            sources,
            attacks,
            default_mode: CombineMode::parse_or_default(&config.default_combine_mode),
            explicit_max_length: config.explicit_max_length,
        }
    }

    pub fn get_combination_mode(&self, bot: &str) -> CombineMode {
        self.attacks
            .attack_settings(bot)
            .and_then(|s| s.combine_mode)
            .map(|m| CombineMode::parse_or_default(&m))
            .unwrap_or(self.default_mode)
    }

    /// Explicit lookups configured for `bot`'s attack; empty when none.
    pub fn get_context_config(&self, bot: &str) -> ContextConfig {
        self.attacks.attack_settings(bot).map(|s| s.context_config).unwrap_or_default()
    }

    /// Resolve `bot`'s configured identifiers; misses are dropped.
    pub fn explicit_knowledge(&self, bot: &str) -> Vec<KnowledgeItem> {
        self.sources.resolve(&self.get_context_config(bot))
    }

    pub fn format_explicit_knowledge(&self, items: Option<&[KnowledgeItem]>, max_length: Option<usize>) -> String {
        format_explicit_knowledge(items, max_length.or(self.explicit_max_length))
    }

    pub fn combine_explicit_and_rag_context(
        &self,
        bot: &str,
        query: &str,
        explicit_context: Option<&[KnowledgeItem]>,
        opts: CombineOptions<'_>,
    ) -> FusedContext {
        let combine_mode = self.get_combination_mode(bot);
        let explicit = self.format_explicit_knowledge(explicit_context, opts.max_length);

        let mut parts: Vec<String> = Vec::new();
        if !explicit.is_empty() {
            parts.push(explicit);
        }

        match combine_mode {
            CombineMode::ExplicitOnly => {}
            CombineMode::ExplicitFirst => {
                if let Some(ctx) = retrieve(opts, query) {
                    parts.push(format!("{SIMILARITY_HEADER}\n{ctx}"));
                }
            }
            CombineMode::Combined => {
                let ctx = retrieve(opts, query).unwrap_or_else(|| NO_SIMILAR_CONTENT.to_string());
                parts.push(format!("{SIMILARITY_HEADER}\n{ctx}"));
            }
        }

        debug!(bot, mode = %combine_mode, sections = parts.len(), "context fused");
        FusedContext { combine_mode, combined_context: parts.join("\n\n") }
    }

    /// Look up `bot`'s explicit knowledge and fuse it with retrieved context.
    pub fn build_context_bundle(
        &self,
        bot: &str,
        query: &str,
        opts: CombineOptions<'_>,
        vm_context: Option<&str>,
    ) -> ContextBundle {
        let explicit_context = self.explicit_knowledge(bot);
        let mut explicit_sources: Vec<String> = Vec::new();
        for item in &explicit_context {
            let source = item.attribution().to_string();
            if !explicit_sources.contains(&source) {
                explicit_sources.push(source);
            }
        }
        let fused = self.combine_explicit_and_rag_context(bot, query, Some(&explicit_context), opts);

        ContextBundle {
            original_query: query.to_string(),
            has_explicit: !explicit_context.is_empty(),
            explicit_context,
            explicit_sources,
            combined_context: fused.combined_context,
            combine_mode: fused.combine_mode,
            vm_context: vm_context.map(str::to_string),
        }
    }
}

fn retrieve(opts: CombineOptions<'_>, query: &str) -> Option<String> {
    opts.retriever?
        .retrieve_context(query, opts.collection)
        .filter(|c| !c.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{StaticKnowledgeSource, mitre_catalogue};

    struct FixedRetriever(Option<&'static str>);

    impl ContextRetriever for FixedRetriever {
        fn retrieve_context(&self, _query: &str, _collection: Option<&str>) -> Option<String> {
            self.0.map(str::to_string)
        }
    }

    fn items() -> Vec<KnowledgeItem> {
        vec![
            KnowledgeItem::new("mitre_attack", "MITRE ATT&CK T1003", "Dump credentials from LSASS.")
                .with_meta("technique_id", "T1003")
                .with_meta("technique_name", "OS Credential Dumping")
                .with_meta("tactic", "Credential Access"),
            KnowledgeItem::new("markdown", "docs/lab.md", "The lab network is 10.0.0.0/24."),
            KnowledgeItem::new("manpage", "man nmap(1)", "nmap - Network exploration tool and security scanner"),
        ]
    }

    fn engine(mode: Option<&str>) -> ContextFusionEngine {
        let attacks = StaticAttackConfig::new()
            .with_attack(
                "cred_dump",
                AttackSettings {
                    combine_mode: mode.map(str::to_string),
                    context_config: ContextConfig {
                        man_pages: vec!["nmap".into()],
                        documents: vec![],
                        mitre_techniques: vec!["T1003".into(), "T0000".into()],
                    },
                },
            )
            .assign("bot1", "cred_dump");
        let mut reg = KnowledgeSourceRegistry::new();
        reg.register(Arc::new(mitre_catalogue()));
        reg.register(Arc::new(
            StaticKnowledgeSource::new(SourceKind::ManPage)
                .with_item("nmap", KnowledgeItem::new("man_page", "man nmap(1)", "nmap - Network exploration tool")),
        ));
        ContextFusionEngine::new(&FusionConfig::default(), reg, Arc::new(attacks))
    }

    #[test]
    fn empty_input_is_empty_string() {
        assert_eq!(format_explicit_knowledge(None, None), "");
        assert_eq!(format_explicit_knowledge(Some(&[]), Some(10)), "");
    }

    #[test]
    fn sections_in_fixed_order() {
        let out = format_explicit_knowledge(Some(&items()), None);
        assert!(out.starts_with(EXPLICIT_HEADER));
        let man = out.find("--- Man Pages ---").unwrap();
        let docs = out.find("--- Documents ---").unwrap();
        let mitre = out.find("--- MITRE ATT&CK Techniques ---").unwrap();
        assert!(man < docs && docs < mitre);
        assert!(out.contains("Technique: T1003 - OS Credential Dumping"));
        assert!(out.contains("Tactic: Credential Access"));
        assert!(!out.contains(CONTENT_TRUNCATED));
    }

    #[test]
    fn empty_groups_emit_no_header() {
        let only_docs = vec![KnowledgeItem::new("document", "a.md", "alpha")];
        let out = format_explicit_knowledge(Some(&only_docs), None);
        assert!(!out.contains("Man Pages"));
        assert!(!out.contains("MITRE"));
        assert_eq!(out, "Explicit Knowledge Sources:\n\n--- Documents ---\nSource: a.md\nalpha");
    }

    #[test]
    fn missing_metadata_uses_generic_attribution() {
        let bare = vec![KnowledgeItem { source_type: "document".into(), content: "text".into(), metadata: HashMap::new() }];
        let out = format_explicit_knowledge(Some(&bare), None);
        assert!(out.contains("Source: Unknown source"));
    }

    #[test]
    fn bounded_output_keeps_every_attribution() {
        let long: Vec<KnowledgeItem> = (0..6)
            .map(|i| KnowledgeItem::new("document", format!("doc-{i}.md"), "word ".repeat(200 + i * 50)))
            .collect();
        for max in [300, 500, 1000, 2000] {
            let out = format_explicit_knowledge(Some(&long), Some(max));
            assert!(out.chars().count() <= max + LENGTH_MARGIN, "max {max}: {}", out.chars().count());
            for i in 0..6 {
                assert!(out.contains(&format!("Source: doc-{i}.md")));
            }
            assert!(out.contains(CONTENT_TRUNCATED));
        }
    }

    #[test]
    fn attribution_outlasts_a_budget_smaller_than_the_headers() {
        let many: Vec<KnowledgeItem> = (0..30)
            .map(|i| KnowledgeItem::new("document", format!("notes/host-{i}.md"), format!("payload detail {i} ").repeat(10)))
            .collect();
        let out = format_explicit_knowledge(Some(&many), Some(10));
        for i in 0..30 {
            assert!(out.contains(&format!("Source: notes/host-{i}.md")), "lost host-{i}");
        }
        assert_eq!(out.matches(CONTENT_TRUNCATED).count(), 30);
        assert!(!out.contains("payload detail"));
        assert!(out.starts_with(EXPLICIT_HEADER));
    }

    #[test]
    fn short_bodies_survive_whole_under_budget() {
        let mixed = vec![
            KnowledgeItem::new("document", "short.md", "tiny"),
            KnowledgeItem::new("document", "long.md", "x".repeat(2000)),
        ];
        let out = format_explicit_knowledge(Some(&mixed), Some(400));
        assert!(out.contains("Source: short.md\ntiny\n"));
        assert!(out.ends_with(CONTENT_TRUNCATED));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let wide = vec![KnowledgeItem::new("document", "emoji.md", "🙂".repeat(500))];
        let out = format_explicit_knowledge(Some(&wide), Some(120));
        assert!(out.chars().count() <= 220);
        assert!(out.contains("🙂"));
    }

    #[test]
    fn mode_resolution_and_fallbacks() {
        assert_eq!(engine(Some("combined")).get_combination_mode("bot1"), CombineMode::Combined);
        assert_eq!(engine(Some("explicit_only")).get_combination_mode("bot1"), CombineMode::ExplicitOnly);
        assert_eq!(engine(Some("sideways")).get_combination_mode("bot1"), CombineMode::ExplicitFirst);
        assert_eq!(engine(None).get_combination_mode("bot1"), CombineMode::ExplicitFirst);
        assert_eq!(engine(Some("combined")).get_combination_mode("unknown-bot"), CombineMode::ExplicitFirst);
    }

    #[test]
    fn combined_mode_always_has_similarity_section() {
        let e = engine(Some("combined"));
        let none = FixedRetriever(None);
        let opts = CombineOptions { retriever: Some(&none), ..Default::default() };
        let out = e.combine_explicit_and_rag_context("bot1", "q", Some(&items()), opts);
        assert_eq!(out.combine_mode, CombineMode::Combined);
        let explicit = out.combined_context.find(EXPLICIT_HEADER).unwrap();
        let similar = out.combined_context.find(SIMILARITY_HEADER).unwrap();
        assert!(explicit < similar);
    }

    #[test]
    fn explicit_only_ignores_available_rag() {
        let e = engine(Some("explicit_only"));
        let rag = FixedRetriever(Some("Document 1 (score: 0.900):\nstuff"));
        let opts = CombineOptions { retriever: Some(&rag), ..Default::default() };
        let out = e.combine_explicit_and_rag_context("bot1", "q", Some(&items()), opts);
        assert!(!out.combined_context.contains(SIMILARITY_HEADER));
    }

    #[test]
    fn explicit_first_appends_only_when_available() {
        let e = engine(None);
        let empty = FixedRetriever(None);
        let out = e.combine_explicit_and_rag_context("bot1", "q", Some(&items()), CombineOptions {
            retriever: Some(&empty),
            ..Default::default()
        });
        assert!(!out.combined_context.contains(SIMILARITY_HEADER));

        let rag = FixedRetriever(Some("Document 1 (score: 0.900):\nstuff"));
        let out = e.combine_explicit_and_rag_context("bot1", "q", None, CombineOptions {
            retriever: Some(&rag),
            ..Default::default()
        });
        assert!(out.combined_context.starts_with(SIMILARITY_HEADER));
    }

    #[test]
    fn bundle_resolves_configured_lookups() {
        let e = engine(Some("explicit_first"));
        let bundle = e.build_context_bundle("bot1", "dump creds", CombineOptions::default(), Some("VM: kali up"));
        assert!(bundle.has_explicit);
        assert_eq!(bundle.explicit_context.len(), 2);
        assert_eq!(bundle.explicit_sources, vec!["man nmap(1)".to_string(), "MITRE ATT&CK T1003".to_string()]);
        assert!(bundle.combined_context.starts_with(EXPLICIT_HEADER));
        assert_eq!(bundle.vm_context.as_deref(), Some("VM: kali up"));
        assert_eq!(bundle.original_query, "dump creds");

        let nobody = e.build_context_bundle("ghost", "q", CombineOptions::default(), None);
        assert!(!nobody.has_explicit);
        assert_eq!(nobody.combined_context, "");
    }
}
