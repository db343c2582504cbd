//! Group numbering across grouping levels
//!
//! Layers live in an arena indexed by depth. Layer `d` numbers the groups
//! after `d` explodes with dense ids `1..=num_groups`; id 0 is "no group".
//! Every group of layer `d > 0` records its parent id in layer `d - 1` and
//! its own label. Layer 0 holds the single root group.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::errors::{ExecutionError, ExecutionResult};
use crate::language::Term;

/// Label of one group within its parent
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GroupKey {
    Term(Term),
    /// Bucket, time range or predicate outcome
    Label(String),
    /// Catch-all child for documents no other child took
    Default,
}

impl GroupKey {
    pub fn label(text: impl Into<String>) -> Self {
        GroupKey::Label(text.into())
    }

    pub fn is_default(&self) -> bool {
        matches!(self, GroupKey::Default)
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::Term(term) => write!(f, "{}", term.to_text()),
            GroupKey::Label(label) => write!(f, "{}", label),
            GroupKey::Default => write!(f, "DEFAULT"),
        }
    }
}

#[derive(Debug, Clone)]
struct Layer {
    /// index = group id; slot 0 is unused
    parents: Vec<usize>,
    keys: Vec<GroupKey>,
}

impl Layer {
    fn root() -> Self {
        Self {
            parents: vec![0, 0],
            keys: vec![GroupKey::Default, GroupKey::label("")],
        }
    }

    fn num_groups(&self) -> usize {
        self.parents.len() - 1
    }
}

/// One new group of a layer being built
#[derive(Debug, Clone, PartialEq)]
pub struct ChildGroup {
    pub parent: usize,
    pub key: GroupKey,
}

#[derive(Debug, Clone)]
pub struct GroupKeySet {
    layers: Vec<Layer>,
}

impl GroupKeySet {
    /// A single root group at depth 0
    pub fn new() -> Self {
        Self {
            layers: vec![Layer::root()],
        }
    }

    /// Number of explodes currently applied
    pub fn depth(&self) -> usize {
        self.layers.len() - 1
    }

    fn top(&self) -> &Layer {
        &self.layers[self.layers.len() - 1]
    }

    pub fn num_groups(&self) -> usize {
        self.top().num_groups()
    }

    /// Parent of `group` in the current layer
    pub fn parent(&self, group: usize) -> usize {
        self.top().parents.get(group).copied().unwrap_or(0)
    }

    pub fn key(&self, group: usize) -> Option<&GroupKey> {
        if self.depth() == 0 || group == 0 {
            return None;
        }
        self.top().keys.get(group)
    }

    pub fn is_default(&self, group: usize) -> bool {
        self.key(group).map_or(false, GroupKey::is_default)
    }

    /// The id `group` of the current layer descends from at `depth`
    pub fn ancestor(&self, group: usize, depth: usize) -> ExecutionResult<usize> {
        let current = self.depth();
        if depth > current {
            return Err(ExecutionError::consistency(format!(
                "lookup at depth {} read from depth {}",
                depth, current
            )));
        }
        let mut g = group;
        for layer in self.layers[depth + 1..].iter().rev() {
            g = layer.parents.get(g).copied().unwrap_or(0);
        }
        Ok(g)
    }

    /// Labels from the first grouping level down to `group`
    pub fn key_path(&self, group: usize) -> Vec<GroupKey> {
        let mut path = Vec::with_capacity(self.depth());
        let mut g = group;
        for layer in self.layers[1..].iter().rev() {
            path.push(layer.keys.get(g).cloned().unwrap_or(GroupKey::Default));
            g = layer.parents.get(g).copied().unwrap_or(0);
        }
        path.reverse();
        path
    }

    /// Start a new layer. Children get ids `1..=children.len()` in order.
    pub fn push_layer(&mut self, children: Vec<ChildGroup>) {
        let mut parents = Vec::with_capacity(children.len() + 1);
        let mut keys = Vec::with_capacity(children.len() + 1);
        parents.push(0);
        keys.push(GroupKey::Default);
        for child in children {
            parents.push(child.parent);
            keys.push(child.key);
        }
        self.layers.push(Layer { parents, keys });
    }

    /// Drop the current layer; returns the child-to-parent mapping
    pub fn pop_layer(&mut self) -> ExecutionResult<Vec<usize>> {
        if self.layers.len() == 1 {
            return Err(ExecutionError::consistency("regroup into parent at depth 0"));
        }
        let layer = self.layers.pop().map(|l| l.parents).unwrap_or_default();
        Ok(layer)
    }

    /// Keep the groups of the current layer for which `keep[g]` holds and
    /// renumber them densely. Returns the old-to-new mapping (0 = dropped).
    pub fn retain(&mut self, keep: &[bool]) -> Vec<usize> {
        let last = self.layers.len() - 1;
        let layer = &mut self.layers[last];
        let mut mapping = vec![0; layer.parents.len()];
        let mut parents = vec![0];
        let mut keys = vec![GroupKey::Default];
        for g in 1..layer.parents.len() {
            if keep.get(g).copied().unwrap_or(false) {
                mapping[g] = parents.len();
                parents.push(layer.parents[g]);
                keys.push(layer.keys[g].clone());
            }
        }
        layer.parents = parents;
        layer.keys = keys;
        mapping
    }
}

impl Default for GroupKeySet {
    fn default() -> Self {
        Self::new()
    }
}
