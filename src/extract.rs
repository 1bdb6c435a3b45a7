//! Rule-based extraction of indicators of compromise from free text.
//!
//! Each rule is an independent regex. Candidates from all rules are merged
//! left to right; where two overlap, the one starting first wins, and at the
//! same start the rule listed earlier in [`RULES`] wins. A rule whose regex
//! fails to compile is skipped, so extraction never panics.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    IpAddress,
    Url,
    Hash,
    Email,
    Port,
    Cve,
    MitreTechnique,
    FilePath,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::IpAddress => "ip_address",
            EntityKind::Url => "url",
            EntityKind::Hash => "hash",
            EntityKind::Email => "email",
            EntityKind::Port => "port",
            EntityKind::Cve => "cve",
            EntityKind::MitreTechnique => "mitre_technique",
            EntityKind::FilePath => "file_path",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractedEntity {
    pub kind: EntityKind,
    pub value: String,
    /// Byte offset of `value` in the source text.
    pub position: usize,
}

macro_rules! ioc_pattern {
    ($name:ident, $regex_str:expr) => {
        static $name: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new($regex_str).ok());
    };
}

ioc_pattern!(RE_URL, r#"(?i)\bhttps?://[^\s<>"'`]+"#);
ioc_pattern!(RE_EMAIL, r"[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}");
ioc_pattern!(
    RE_IPV4,
    r"\b(?:(?:25[0-5]|2[0-4]\d|[01]?\d\d?)\.){3}(?:25[0-5]|2[0-4]\d|[01]?\d\d?)\b"
);
// SHA-256, SHA-1, MD5; longest alternative first.
ioc_pattern!(RE_HASH, r"\b(?:[a-fA-F0-9]{64}|[a-fA-F0-9]{40}|[a-fA-F0-9]{32})\b");
ioc_pattern!(RE_CVE, r"(?i)\bCVE-\d{4}-\d{4,7}\b");
ioc_pattern!(RE_MITRE, r"\bT\d{4}(?:\.\d{3})?\b");
ioc_pattern!(RE_PORT_WORD, r"(?i)\bport\s+(\d{1,5})\b");
ioc_pattern!(RE_PORT_SUFFIX, r"(?i)(?:\d|localhost|\.[a-z]{2,}):(\d{1,5})\b");
ioc_pattern!(RE_FILE_PATH, r"(?:^|[\s(=])((?:/[\w.\-]+)+/?)");

/// Rules in priority order.
static RULES: [(EntityKind, &LazyLock<Option<Regex>>); 9] = [
    (EntityKind::Url, &RE_URL),
    (EntityKind::Email, &RE_EMAIL),
    (EntityKind::IpAddress, &RE_IPV4),
    (EntityKind::Hash, &RE_HASH),
    (EntityKind::Cve, &RE_CVE),
    (EntityKind::MitreTechnique, &RE_MITRE),
    (EntityKind::Port, &RE_PORT_WORD),
    (EntityKind::Port, &RE_PORT_SUFFIX),
    (EntityKind::FilePath, &RE_FILE_PATH),
];

struct Candidate {
    start: usize,
    end: usize,
    rule: usize,
    kind: EntityKind,
}

/// Extract every recognised indicator from `text`, ordered by position.
pub fn extract(text: &str) -> Vec<ExtractedEntity> {
    if text.is_empty() {
        return Vec::new();
    }

    let mut candidates = Vec::new();
    for (rule, (kind, pattern)) in RULES.iter().enumerate() {
        let Some(re) = pattern.as_ref() else {
            continue;
        };
        for caps in re.captures_iter(text) {
            // A capture group narrows the value; otherwise take the whole match.
            let Some(m) = caps.get(1).or_else(|| caps.get(0)) else {
                continue;
            };
            let mut end = m.end();
            if *kind == EntityKind::Url {
                end = m.start() + m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?', ')', ']']).len();
            }
            candidates.push(Candidate { start: m.start(), end, rule, kind: *kind });
        }
    }
    candidates.sort_by_key(|c| (c.start, c.rule));

    let mut out = Vec::new();
    let mut cursor = 0;
    for c in candidates {
        if c.start < cursor || c.start >= c.end {
            continue;
        }
        let value = &text[c.start..c.end];
        if c.kind == EntityKind::Port && !is_valid_port(value) {
            continue;
        }
        out.push(ExtractedEntity { kind: c.kind, value: value.to_string(), position: c.start });
        cursor = c.end;
    }
    out
}

/// Only the entities of `kind`.
pub fn extract_kind(text: &str, kind: EntityKind) -> Vec<ExtractedEntity> {
    extract(text).into_iter().filter(|e| e.kind == kind).collect()
}

fn is_valid_port(value: &str) -> bool {
    value.parse::<u32>().is_ok_and(|p| (1..=65_535).contains(&p))
}
