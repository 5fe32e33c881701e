//! Dependency graph over invalidation targets.
//!
//! Edges say "when `source` is invalidated, `dependent` follows", optionally
//! after a delay. The relation may contain cycles; the invalidation walk
//! dedupes visited nodes so traversal always terminates.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::lock::recover;

const SOURCE: &str = "graph";

/// A node the invalidation walk understands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Target {
    /// A tag name; resolves to every key carrying it.
    Tag(String),
    /// A single cache key.
    Key(String),
    /// An opaque external locator. Has no direct store effect; it exists to
    /// drive dependents that live outside this store.
    Locator(String),
}

impl Target {
    pub fn tag(name: impl Into<String>) -> Self {
        Self::Tag(name.into())
    }

    pub fn key(name: impl Into<String>) -> Self {
        Self::Key(name.into())
    }

    pub fn locator(name: impl Into<String>) -> Self {
        Self::Locator(name.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Target::Tag(_) => "tag",
            Target::Key(_) => "key",
            Target::Locator(_) => "locator",
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Target::Tag(name) | Target::Key(name) | Target::Locator(name) => name,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.name())
    }
}

/// How matched keys are treated when invalidation reaches them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
    /// Hard-evict matched keys and refresh them immediately.
    Aggressive,
    /// Soft-stale only; the next reader or the sweeper deals with it.
    Lazy,
    /// Soft-stale everything, refresh only keys the access policy ranks hot.
    #[default]
    Smart,
}

impl RefreshMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshMode::Aggressive => "aggressive",
            RefreshMode::Lazy => "lazy",
            RefreshMode::Smart => "smart",
        }
    }
}

/// An edge out of a source target. The source is the map key in the graph.
#[derive(Debug, Clone)]
pub struct DependencyEdge {
    pub dependent: Target,
    /// Zero means the dependent is walked in the same pass; positive values
    /// schedule a delayed cascade job instead.
    pub delay: Duration,
    pub mode: RefreshMode,
}

/// Directed dependency relation between targets.
///
/// Mutation is configuration-time and infrequent, so one coarse lock over
/// the whole relation is enough; lookups clone the edge list out.
pub struct DependencyGraph {
    edges: RwLock<HashMap<Target, Vec<DependencyEdge>>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            edges: RwLock::new(HashMap::new()),
        }
    }

    /// Add or update the edge `source → dependent`.
    ///
    /// Registering the same pair again replaces its delay and mode.
    pub fn register(&self, source: Target, dependent: Target, delay: Duration, mode: RefreshMode) {
        let mut edges = recover(self.edges.write(), SOURCE, "register");
        let list = edges.entry(source).or_default();
        match list.iter_mut().find(|edge| edge.dependent == dependent) {
            Some(existing) => {
                existing.delay = delay;
                existing.mode = mode;
            }
            None => list.push(DependencyEdge {
                dependent,
                delay,
                mode,
            }),
        }
    }

    /// Remove the edge `source → dependent`. Returns whether it existed.
    pub fn remove(&self, source: &Target, dependent: &Target) -> bool {
        let mut edges = recover(self.edges.write(), SOURCE, "remove");
        let Some(list) = edges.get_mut(source) else {
            return false;
        };
        let before = list.len();
        list.retain(|edge| edge.dependent != *dependent);
        let removed = list.len() < before;
        if list.is_empty() {
            edges.remove(source);
        }
        removed
    }

    /// All edges out of a source, cloned out of the lock.
    pub fn edges_from(&self, source: &Target) -> Vec<DependencyEdge> {
        recover(self.edges.read(), SOURCE, "edges_from")
            .get(source)
            .cloned()
            .unwrap_or_default()
    }

    pub fn edge_count(&self) -> usize {
        recover(self.edges.read(), SOURCE, "edge_count")
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn clear(&self) {
        recover(self.edges.write(), SOURCE, "clear").clear();
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}
