//! Explicit knowledge: items fetched by stable identifier rather than by
//! similarity.
//!
//! A [`KnowledgeSource`] answers `lookup(identifier)` for one [`SourceKind`];
//! the [`KnowledgeSourceRegistry`] routes a [`ContextConfig`] request to the
//! registered sources and silently drops misses.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::vector_store::Document;

/// Metadata key carrying an item's attribution.
pub const SOURCE_KEY: &str = "source";
/// Attribution used when an item has none.
pub const UNKNOWN_SOURCE: &str = "Unknown source";

// ── Items ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    ManPage,
    Document,
    Mitre,
}

impl SourceKind {
    /// Normalise a free-form source type. Unrecognised types are treated as
    /// documents.
    pub fn normalize(source_type: &str) -> Self {
        match source_type.trim().to_ascii_lowercase().as_str() {
            "man_page" | "manpage" | "man" => SourceKind::ManPage,
            "mitre_attack" | "mitre" | "mitre_technique" => SourceKind::Mitre,
            _ => SourceKind::Document,
        }
    }

    /// Section title used when rendering a group of this kind.
    pub fn section_title(&self) -> &'static str {
        match self {
            SourceKind::ManPage => "Man Pages",
            SourceKind::Document => "Documents",
            SourceKind::Mitre => "MITRE ATT&CK Techniques",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::ManPage => "man_page",
            SourceKind::Document => "document",
            SourceKind::Mitre => "mitre_attack",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KnowledgeItem {
    /// Free-form type as supplied by the loader; see [`SourceKind::normalize`].
    pub source_type: String,
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl KnowledgeItem {
    pub fn new(source_type: impl Into<String>, source: impl Into<String>, content: impl Into<String>) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert(SOURCE_KEY.to_string(), source.into());
        Self { source_type: source_type.into(), content: content.into(), metadata }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn kind(&self) -> SourceKind {
        SourceKind::normalize(&self.source_type)
    }

    pub fn attribution(&self) -> &str {
        self.metadata
            .get(SOURCE_KEY)
            .map(String::as_str)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(UNKNOWN_SOURCE)
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

// ── Requests ──────────────────────────────────────────────────────────────────

/// Identifiers to look up for one attack/scope.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default)]
    pub man_pages: Vec<String>,
    /// File paths.
    #[serde(default)]
    pub documents: Vec<String>,
    #[serde(default)]
    pub mitre_techniques: Vec<String>,
}

impl ContextConfig {
    pub fn is_empty(&self) -> bool {
        self.man_pages.is_empty() && self.documents.is_empty() && self.mitre_techniques.is_empty()
    }
}

// ── Sources ───────────────────────────────────────────────────────────────────

/// Identifier lookup for one kind of source.
pub trait KnowledgeSource: Send + Sync + fmt::Debug {
    fn kind(&self) -> SourceKind;

    /// `None` when the identifier is unknown.
    fn lookup(&self, identifier: &str) -> Option<KnowledgeItem>;
}

/// Map-backed source.
#[derive(Debug, Clone)]
pub struct StaticKnowledgeSource {
    kind: SourceKind,
    items: HashMap<String, KnowledgeItem>,
}

impl StaticKnowledgeSource {
    pub fn new(kind: SourceKind) -> Self {
        Self { kind, items: HashMap::new() }
    }

    pub fn insert(&mut self, identifier: impl Into<String>, item: KnowledgeItem) {
        self.items.insert(identifier.into(), item);
    }

    pub fn with_item(mut self, identifier: impl Into<String>, item: KnowledgeItem) -> Self {
        self.insert(identifier, item);
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl KnowledgeSource for StaticKnowledgeSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn lookup(&self, identifier: &str) -> Option<KnowledgeItem> {
        self.items
            .get(identifier)
            .or_else(|| self.items.get(identifier.trim()))
            .cloned()
    }
}

/// One source per [`SourceKind`].
#[derive(Debug, Default, Clone)]
pub struct KnowledgeSourceRegistry {
    sources: HashMap<SourceKind, Arc<dyn KnowledgeSource>>,
}

impl KnowledgeSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `source`, replacing any earlier one of the same kind.
    pub fn register(&mut self, source: Arc<dyn KnowledgeSource>) {
        self.sources.insert(source.kind(), source);
    }

    pub fn lookup(&self, kind: SourceKind, identifier: &str) -> Option<KnowledgeItem> {
        self.sources.get(&kind)?.lookup(identifier)
    }

    /// Resolve every identifier in `request`, man pages first, then documents,
    /// then techniques. Misses are skipped.
    pub fn resolve(&self, request: &ContextConfig) -> Vec<KnowledgeItem> {
        let wanted = [
            (SourceKind::ManPage, &request.man_pages),
            (SourceKind::Document, &request.documents),
            (SourceKind::Mitre, &request.mitre_techniques),
        ];
        let mut out = Vec::new();
        for (kind, ids) in wanted {
            for id in ids {
                match self.lookup(kind, id) {
                    Some(item) => out.push(item),
                    None => debug!(kind = %kind, identifier = %id, "knowledge lookup miss"),
                }
            }
        }
        out
    }
}

// ── Built-in MITRE catalogue ──────────────────────────────────────────────────

struct Technique {
    id: &'static str,
    name: &'static str,
    tactic: &'static str,
    priority: u8,
    description: &'static str,
}

const TECHNIQUES: &[Technique] = &[
    Technique {
        id: "T1003",
        name: "OS Credential Dumping",
        tactic: "Credential Access",
        priority: 9,
        description: "Adversaries dump credentials from the operating system, for example LSASS memory \
                      or the SAM database, using tools such as Mimikatz.",
    },
    Technique {
        id: "T1059",
        name: "Command and Scripting Interpreter",
        tactic: "Execution",
        priority: 8,
        description: "Adversaries abuse shells and interpreters such as bash, PowerShell or Python to \
                      execute commands and payloads.",
    },
    Technique {
        id: "T1110",
        name: "Brute Force",
        tactic: "Credential Access",
        priority: 8,
        description: "Adversaries guess passwords repeatedly against services like SSH, RDP or web \
                      logins, e.g. with hydra, when credentials are unknown.",
    },
    Technique {
        id: "T1190",
        name: "Exploit Public-Facing Application",
        tactic: "Initial Access",
        priority: 7,
        description: "Adversaries exploit weaknesses in internet-facing software such as web servers \
                      or databases to gain an initial foothold.",
    },
    Technique {
        id: "T1046",
        name: "Network Service Discovery",
        tactic: "Discovery",
        priority: 7,
        description: "Adversaries enumerate listening services on remote hosts, typically with port \
                      scanners such as nmap.",
    },
    Technique {
        id: "T1021",
        name: "Remote Services",
        tactic: "Lateral Movement",
        priority: 6,
        description: "Adversaries log into remote services such as SSH, SMB or RDP with valid \
                      accounts to move between hosts.",
    },
    Technique {
        id: "T1068",
        name: "Exploitation for Privilege Escalation",
        tactic: "Privilege Escalation",
        priority: 6,
        description: "Adversaries exploit software vulnerabilities, for instance a vulnerable SUID \
                      binary or kernel bug, to elevate privileges.",
    },
    Technique {
        id: "T1053",
        name: "Scheduled Task/Job",
        tactic: "Persistence",
        priority: 5,
        description: "Adversaries abuse cron, at or Windows Task Scheduler to run code at startup or \
                      on a schedule.",
    },
];

const MITRE_SOURCE: &str = "MITRE ATT&CK";

fn technique_item(t: &Technique) -> KnowledgeItem {
    KnowledgeItem::new(SourceKind::Mitre.as_str(), format!("{MITRE_SOURCE} {}", t.id), t.description)
        .with_meta("technique_id", t.id)
        .with_meta("technique_name", t.name)
        .with_meta("tactic", t.tactic)
        .with_meta("priority", t.priority.to_string())
}

/// Built-in technique catalogue keyed by technique id.
pub fn mitre_catalogue() -> StaticKnowledgeSource {
    TECHNIQUES
        .iter()
        .fold(StaticKnowledgeSource::new(SourceKind::Mitre), |src, t| src.with_item(t.id, technique_item(t)))
}

/// The catalogue as preload documents, in catalogue order.
pub fn mitre_documents() -> Vec<Document> {
    TECHNIQUES
        .iter()
        .map(|t| {
            let item = technique_item(t);
            Document {
                id: t.id.to_string(),
                content: format!("{} {}: {}", t.id, t.name, t.description),
                metadata: item.metadata,
            }
        })
        .collect()
}

/// `(subject, relationship, object)` edges describing the catalogue.
pub fn mitre_triplets() -> Vec<(String, String, String)> {
    TECHNIQUES
        .iter()
        .flat_map(|t| {
            [
                (t.id.to_string(), "NAMED".to_string(), t.name.to_string()),
                (t.id.to_string(), "BELONGS_TO".to_string(), t.tactic.to_string()),
            ]
        })
        .collect()
}
