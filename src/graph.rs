//! In-memory knowledge graph of directed, labelled triplets.
//!
//! Nodes are created implicitly by [`KnowledgeGraph::add_triplet`] and can be
//! enriched with labels and properties via [`KnowledgeGraph::add_entity`].
//! Edges are kept in insertion order with subject and object indices, so a
//! traversal touches only the edges of the nodes it visits. Adding the same
//! triplet twice stores two edges.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::AppError;

// ── Types ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Entity {
    pub name: String,
    pub labels: BTreeSet<String>,
    pub properties: BTreeMap<String, String>,
}

impl Entity {
    fn named(name: &str) -> Self {
        Self { name: name.to_string(), ..Self::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Triplet {
    pub subject: String,
    pub relationship: String,
    pub object: String,
    pub properties: BTreeMap<String, String>,
}

impl fmt::Display for Triplet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.subject, self.relationship, self.object)
    }
}

/// An entity reached by traversal, with the edge that first reached it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelatedEntity {
    pub entity: Entity,
    /// Relationship label of `edge`.
    pub relationship: String,
    pub edge: Triplet,
    /// Hops from the start node (1 = direct neighbour).
    pub distance: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphProviderKind {
    InMemory,
}

impl FromStr for GraphProviderKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in_memory" | "memory" | "inmemory" => Ok(GraphProviderKind::InMemory),
            _ => Err(AppError::Config(format!("unknown knowledge graph provider: {s}"))),
        }
    }
}

// ── Storage ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct GraphData {
    entities: HashMap<String, Entity>,
    /// Entity names in first-seen order.
    order: Vec<String>,
    triplets: Vec<Triplet>,
    subject_index: HashMap<String, Vec<usize>>,
    object_index: HashMap<String, Vec<usize>>,
}

impl GraphData {
    fn ensure_entity(&mut self, name: &str) -> &mut Entity {
        if !self.entities.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.entities.entry(name.to_string()).or_insert_with(|| Entity::named(name))
    }

    /// Exact name first, then a case-insensitive match.
    fn resolve(&self, name: &str) -> Option<&str> {
        if let Some(e) = self.entities.get(name) {
            return Some(e.name.as_str());
        }
        let lower = name.to_lowercase();
        self.order.iter().find(|n| n.to_lowercase() == lower).map(String::as_str)
    }

    /// Edge indices touching `name`: outgoing first, then incoming.
    fn edges_of(&self, name: &str) -> impl Iterator<Item = usize> + '_ {
        let out = self.subject_index.get(name).into_iter().flatten().copied();
        let inc = self.object_index.get(name).into_iter().flatten().copied();
        out.chain(inc)
    }
}

#[derive(Debug, Default)]
pub struct KnowledgeGraph {
    data: RwLock<GraphData>,
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build(kind: GraphProviderKind) -> Self {
        match kind {
            GraphProviderKind::InMemory => Self::new(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, GraphData> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, GraphData> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a directed edge, creating either node on first sight. Returns
    /// `false` only if a name or the relationship is blank.
    pub fn add_triplet(
        &self,
        subject: &str,
        relationship: &str,
        object: &str,
        properties: BTreeMap<String, String>,
    ) -> bool {
        let (subject, relationship, object) = (subject.trim(), relationship.trim(), object.trim());
        if subject.is_empty() || relationship.is_empty() || object.is_empty() {
            warn!(subject, relationship, object, "rejected triplet with blank field");
            return false;
        }

        let mut g = self.write();
        g.ensure_entity(subject);
        g.ensure_entity(object);
        let idx = g.triplets.len();
        g.triplets.push(Triplet {
            subject: subject.to_string(),
            relationship: relationship.to_string(),
            object: object.to_string(),
            properties,
        });
        g.subject_index.entry(subject.to_string()).or_default().push(idx);
        g.object_index.entry(object.to_string()).or_default().push(idx);
        debug!(subject, relationship, object, "triplet added");
        true
    }

    /// Create `name` or merge `labels` and `properties` into it. Existing
    /// property values are overwritten.
    pub fn add_entity(
        &self,
        name: &str,
        labels: impl IntoIterator<Item = String>,
        properties: BTreeMap<String, String>,
    ) -> bool {
        let name = name.trim();
        if name.is_empty() {
            return false;
        }
        let mut g = self.write();
        let entity = g.ensure_entity(name);
        entity.labels.extend(labels);
        entity.properties.extend(properties);
        true
    }

    pub fn get_entity(&self, name: &str) -> Option<Entity> {
        let g = self.read();
        let resolved = g.resolve(name)?;
        g.entities.get(resolved).cloned()
    }

    pub fn entity_count(&self) -> usize {
        self.read().entities.len()
    }

    pub fn triplet_count(&self) -> usize {
        self.read().triplets.len()
    }

    /// Every edge touching `name`, in insertion order.
    pub fn triplets_for(&self, name: &str) -> Vec<Triplet> {
        let g = self.read();
        let Some(resolved) = g.resolve(name) else {
            return Vec::new();
        };
        let mut idx: Vec<usize> = g.edges_of(resolved).collect();
        idx.sort_unstable();
        idx.dedup();
        idx.into_iter().map(|i| g.triplets[i].clone()).collect()
    }

    /// Breadth-first traversal from `name` along edges in both directions.
    ///
    /// Returns at most `limit` distinct entities no further than `depth` hops
    /// away, nearest first. The start node is not included. An unknown name
    /// yields an empty vec.
    pub fn find_related_entities(&self, name: &str, depth: usize, limit: usize) -> Vec<RelatedEntity> {
        let g = self.read();
        let Some(start) = g.resolve(name) else {
            return Vec::new();
        };

        let mut related = Vec::new();
        let mut visited: HashSet<&str> = HashSet::from([start]);
        let mut queue: VecDeque<(&str, usize)> = VecDeque::from([(start, 0)]);

        while let Some((current, dist)) = queue.pop_front() {
            if dist >= depth {
                continue;
            }
            for i in g.edges_of(current) {
                if related.len() >= limit {
                    return related;
                }
                let edge = &g.triplets[i];
                let neighbour = if edge.subject == current { edge.object.as_str() } else { edge.subject.as_str() };
                if !visited.insert(neighbour) {
                    continue;
                }
                if let Some(entity) = g.entities.get(neighbour) {
                    related.push(RelatedEntity {
                        entity: entity.clone(),
                        relationship: edge.relationship.clone(),
                        edge: edge.clone(),
                        distance: dist + 1,
                    });
                }
                queue.push_back((neighbour, dist + 1));
            }
        }
        related
    }

    /// Names of known entities that occur in `text` (case-insensitive), in
    /// first-seen order. Names shorter than three characters are ignored.
    pub fn entities_mentioned_in(&self, text: &str) -> Vec<String> {
        let haystack = text.to_lowercase();
        let g = self.read();
        g.order
            .iter()
            .filter(|n| n.chars().count() >= 3 && haystack.contains(&n.to_lowercase()))
            .cloned()
            .collect()
    }

    /// Full reset: every node and edge is dropped.
    pub fn clear(&self) {
        *self.write() = GraphData::default();
    }
}
