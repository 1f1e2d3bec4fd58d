//! The revision graph: changesets, phases, and obsolescence
//!
//! This module maintains the append-only DAG of changesets. Each node has
//! one or two parents; the changelog records nodes in topological order
//! (parents always precede children), which the ancestor algorithms rely
//! on. Nodes are never rewritten: history editing records obsolescence
//! markers, and "effective visibility" is a derived view over the
//! unchanged node set.
//!
//! Visibility of a changeset moves one-directionally:
//! Visible, then Obsoleted (a marker names a successor), then Pruned
//! (obsoleted with zero successors). Obsoleted and pruned changesets stay
//! retrievable when hidden nodes are explicitly requested.

use crate::error::{ArgentError, Result};
use crate::transaction::Transaction;
use crate::types::{Changeset, ChangesetId, ObsolescenceMarker, Phase};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Phase assignments persisted next to the changelog
///
/// Only non-default entries are stored; absent changesets are draft.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PhaseTable {
    phases: BTreeMap<ChangesetId, Phase>,
}

/// The changeset DAG plus its derived indexes
pub struct RevisionGraph {
    root: PathBuf,
    /// Changesets in changelog (topological) order
    order: Vec<ChangesetId>,
    /// Node lookup
    nodes: HashMap<ChangesetId, Changeset>,
    /// Position of each node in `order`
    index: HashMap<ChangesetId, usize>,
    /// Children index derived from parent pointers
    children: HashMap<ChangesetId, Vec<ChangesetId>>,
    /// Non-default phase assignments
    phases: BTreeMap<ChangesetId, Phase>,
    /// Append-only obsolescence markers
    markers: Vec<ObsolescenceMarker>,
}

impl std::fmt::Debug for RevisionGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionGraph")
            .field("changesets", &self.order.len())
            .field("markers", &self.markers.len())
            .finish()
    }
}

impl RevisionGraph {
    /// Create an empty graph rooted at the repository metadata directory
    pub fn init(root: PathBuf) -> Result<Self> {
        let graph = Self::empty(root);
        Ok(graph)
    }

    /// Load the graph from disk
    pub fn open(root: PathBuf) -> Result<Self> {
        let mut graph = Self::empty(root);
        graph.load()?;
        Ok(graph)
    }

    fn empty(root: PathBuf) -> Self {
        Self {
            root,
            order: Vec::new(),
            nodes: HashMap::new(),
            index: HashMap::new(),
            children: HashMap::new(),
            phases: BTreeMap::new(),
            markers: Vec::new(),
        }
    }

    /// Re-read committed state, discarding in-memory mutations
    pub fn reload(&mut self) -> Result<()> {
        self.order.clear();
        self.nodes.clear();
        self.index.clear();
        self.children.clear();
        self.phases.clear();
        self.markers.clear();
        self.load()
    }

    fn load(&mut self) -> Result<()> {
        let changelog = self.root.join("changelog.json");
        if changelog.exists() {
            let text = fs::read_to_string(&changelog)?;
            let changesets: Vec<Changeset> = serde_json::from_str(&text)?;
            for changeset in changesets {
                self.link(changeset);
            }
        }
        let phases = self.root.join("phases.json");
        if phases.exists() {
            let text = fs::read_to_string(&phases)?;
            let table: PhaseTable = serde_json::from_str(&text)?;
            self.phases = table.phases;
        }
        let obsolete = self.root.join("obsolete.json");
        if obsolete.exists() {
            let text = fs::read_to_string(&obsolete)?;
            self.markers = serde_json::from_str(&text)?;
        }
        trace!(
            "loaded graph: {} changesets, {} markers",
            self.order.len(),
            self.markers.len()
        );
        Ok(())
    }

    fn link(&mut self, changeset: Changeset) {
        let id = changeset.id.clone();
        self.index.insert(id.clone(), self.order.len());
        self.order.push(id.clone());
        for parent in changeset.parents() {
            self.children
                .entry(parent.to_string())
                .or_default()
                .push(id.clone());
        }
        self.nodes.insert(id, changeset);
    }

    /// Stage the persisted graph files into a transaction
    fn stage(&self, txn: &mut Transaction) -> Result<()> {
        let changesets: Vec<&Changeset> = self
            .order
            .iter()
            .map(|id| &self.nodes[id])
            .collect();
        txn.write(
            Path::new("changelog.json"),
            serde_json::to_string_pretty(&changesets)?.into_bytes(),
        );
        let table = PhaseTable {
            phases: self.phases.clone(),
        };
        txn.write(
            Path::new("phases.json"),
            serde_json::to_string_pretty(&table)?.into_bytes(),
        );
        txn.write(
            Path::new("obsolete.json"),
            serde_json::to_string_pretty(&self.markers)?.into_bytes(),
        );
        Ok(())
    }

    /// Append a changeset to the graph
    ///
    /// Returns `NothingChanged` when a non-merge changeset carries the
    /// same manifest as its first parent - an empty commit. Merge
    /// changesets are exempt: a no-op merge still records the second
    /// parent and is a legitimate node. Re-committing an identical
    /// changeset is idempotent and also reports `NothingChanged`.
    pub fn commit(&mut self, txn: &mut Transaction, changeset: Changeset) -> Result<ChangesetId> {
        if self.nodes.contains_key(&changeset.id) {
            return Err(ArgentError::NothingChanged);
        }
        for parent in changeset.parents() {
            if !self.nodes.contains_key(parent) {
                return Err(ArgentError::ChangesetNotFound(parent.to_string()));
            }
        }
        if !changeset.is_merge() {
            if let Some(parent) = self.nodes.get(&changeset.parent1) {
                if parent.manifest_id == changeset.manifest_id
                    && parent.branch == changeset.branch
                {
                    return Err(ArgentError::NothingChanged);
                }
            }
        }

        let id = changeset.id.clone();
        debug!("committing changeset {}", &id[..12]);
        self.link(changeset);
        self.stage(txn)?;
        Ok(id)
    }

    /// Look up a changeset
    pub fn get(&self, id: &str) -> Result<&Changeset> {
        self.nodes
            .get(id)
            .ok_or_else(|| ArgentError::ChangesetNotFound(id.to_string()))
    }

    /// Whether a changeset exists (hidden or not)
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Most recently committed changeset
    pub fn tip(&self) -> Option<&Changeset> {
        self.order.last().map(|id| &self.nodes[id])
    }

    /// All changeset ids in changelog order, including hidden ones
    pub fn all_ids(&self) -> &[ChangesetId] {
        &self.order
    }

    /// Number of changesets
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the graph has no changesets
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Direct children of a changeset
    pub fn children_of(&self, id: &str) -> &[ChangesetId] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Lazy iterator over ancestors of `id`, including `id` itself,
    /// yielded newest-first by changelog position
    pub fn ancestors<'a>(&'a self, id: &str) -> Ancestors<'a> {
        let mut heap = BinaryHeap::new();
        let mut seen = HashSet::new();
        if let Some(&pos) = self.index.get(id) {
            heap.push(pos);
            seen.insert(pos);
        }
        Ancestors {
            graph: self,
            heap,
            seen,
        }
    }

    /// Whether `a` is an ancestor of `b` (inclusive: a node is its own
    /// ancestor)
    pub fn is_ancestor(&self, a: &str, b: &str) -> bool {
        let (Some(&pos_a), Some(_)) = (self.index.get(a), self.index.get(b)) else {
            return false;
        };
        for ancestor in self.ancestors(b) {
            let pos = self.index[&ancestor.id];
            if ancestor.id == a {
                return true;
            }
            // Ancestors are yielded in descending changelog position, so
            // once we pass a's position it can no longer appear.
            if pos < pos_a {
                return false;
            }
        }
        false
    }

    /// Lowest common ancestor of two changesets
    ///
    /// Walks both ancestor cones newest-first; the first node reached
    /// from both sides is a lowest common ancestor.
    pub fn common_ancestor(&self, a: &str, b: &str) -> Option<ChangesetId> {
        if !self.contains(a) || !self.contains(b) {
            return None;
        }
        let ancestors_a: HashSet<ChangesetId> =
            self.ancestors(a).map(|c| c.id.clone()).collect();
        self.ancestors(b)
            .find(|c| ancestors_a.contains(&c.id))
            .map(|c| c.id.clone())
    }

    /// Heads: changesets with no children, optionally restricted to a
    /// named branch (where only same-branch children count)
    pub fn heads(&self, branch: Option<&str>) -> Vec<ChangesetId> {
        self.order
            .iter()
            .filter(|id| {
                let node = &self.nodes[*id];
                if let Some(branch) = branch {
                    if node.branch != branch {
                        return false;
                    }
                    !self
                        .children_of(id)
                        .iter()
                        .any(|child| self.nodes[child].branch == branch)
                } else {
                    self.children_of(id).is_empty()
                }
            })
            .cloned()
            .collect()
    }

    /// Phase of a changeset (draft when never explicitly set)
    pub fn phase(&self, id: &str) -> Phase {
        self.phases.get(id).copied().unwrap_or(Phase::Draft)
    }

    /// Assign a phase
    ///
    /// Publishing (moving towards `Public`) also publishes ancestors so
    /// a public changeset never has a draft ancestor.
    pub fn set_phase(&mut self, txn: &mut Transaction, id: &str, phase: Phase) -> Result<()> {
        if !self.contains(id) {
            return Err(ArgentError::ChangesetNotFound(id.to_string()));
        }
        if phase == Phase::Public {
            let ancestor_ids: Vec<ChangesetId> =
                self.ancestors(id).map(|c| c.id.clone()).collect();
            for ancestor in ancestor_ids {
                self.phases.insert(ancestor, Phase::Public);
            }
        } else {
            self.phases.insert(id.to_string(), phase);
        }
        self.stage(txn)?;
        Ok(())
    }

    /// Record an obsolescence marker
    ///
    /// Rejects markers that would make the precursor transitively its own
    /// successor: markers form chains, never cycles.
    pub fn obsolete(
        &mut self,
        txn: &mut Transaction,
        precursor: &str,
        successors: Vec<ChangesetId>,
        operation: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<()> {
        if !self.contains(precursor) {
            return Err(ArgentError::ChangesetNotFound(precursor.to_string()));
        }
        for successor in &successors {
            if successor == precursor || self.chain_reaches(successor, precursor) {
                return Err(ArgentError::abort(format!(
                    "obsolescence marker would create a cycle through {}",
                    &precursor[..12]
                )));
            }
        }
        self.markers.push(ObsolescenceMarker {
            precursor: precursor.to_string(),
            successors,
            operation: operation.to_string(),
            recorded_at: chrono::Utc::now().fixed_offset(),
            metadata,
        });
        self.stage(txn)?;
        Ok(())
    }

    /// Whether following successor chains from `from` reaches `target`
    fn chain_reaches(&self, from: &str, target: &str) -> bool {
        let mut queue = VecDeque::from([from.to_string()]);
        let mut seen = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if id == target {
                return true;
            }
            for marker in self.markers.iter().filter(|m| m.precursor == id) {
                queue.extend(marker.successors.iter().cloned());
            }
        }
        false
    }

    /// Whether any marker names this changeset as a precursor
    pub fn is_obsolete(&self, id: &str) -> bool {
        self.markers.iter().any(|m| m.precursor == id)
    }

    /// Resolve a changeset to its effective successors
    ///
    /// Follows marker chains to their non-obsolete ends. A non-obsolete
    /// changeset resolves to itself. A changeset whose chains all end in
    /// prunes has no successor, which is an error the caller reports.
    pub fn effective_successors(&self, id: &str) -> Result<Vec<ChangesetId>> {
        if !self.is_obsolete(id) {
            return Ok(vec![id.to_string()]);
        }
        let mut result = Vec::new();
        let mut queue = VecDeque::from([id.to_string()]);
        let mut seen = HashSet::new();
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if current != id && !self.is_obsolete(&current) {
                if !result.contains(&current) {
                    result.push(current);
                }
                continue;
            }
            for marker in self.markers.iter().filter(|m| m.precursor == current) {
                queue.extend(marker.successors.iter().cloned());
            }
        }
        if result.is_empty() {
            return Err(ArgentError::NoSuccessor(id.to_string()));
        }
        Ok(result)
    }

    /// Whether a changeset is hidden from default views
    ///
    /// Hidden means obsolete and not an ancestor of any visible
    /// (non-obsolete) changeset.
    pub fn is_hidden(&self, id: &str) -> bool {
        !self.visible_set().contains(id)
    }

    /// All visible changeset ids in changelog order
    pub fn visible_ids(&self) -> Vec<ChangesetId> {
        let visible = self.visible_set();
        self.order
            .iter()
            .filter(|id| visible.contains(*id))
            .cloned()
            .collect()
    }

    /// The visible set: non-obsolete changesets plus all their ancestors
    fn visible_set(&self) -> HashSet<ChangesetId> {
        let mut visible = HashSet::new();
        let mut stack: Vec<&str> = self
            .order
            .iter()
            .filter(|id| !self.is_obsolete(id))
            .map(String::as_str)
            .collect();
        while let Some(id) = stack.pop() {
            if !visible.insert(id.to_string()) {
                continue;
            }
            for parent in self.nodes[id].parents() {
                if self.index.contains_key(parent) && !visible.contains(parent) {
                    stack.push(parent);
                }
            }
        }
        visible
    }

    /// All obsolescence markers, oldest first
    pub fn markers(&self) -> &[ObsolescenceMarker] {
        &self.markers
    }
}

/// Lazy ancestor iterator yielding newest-first by changelog position
pub struct Ancestors<'a> {
    graph: &'a RevisionGraph,
    heap: BinaryHeap<usize>,
    seen: HashSet<usize>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a Changeset;

    fn next(&mut self) -> Option<Self::Item> {
        let pos = self.heap.pop()?;
        let node = &self.graph.nodes[&self.graph.order[pos]];
        for parent in node.parents() {
            if let Some(&parent_pos) = self.graph.index.get(parent) {
                if self.seen.insert(parent_pos) {
                    self.heap.push(parent_pos);
                }
            }
        }
        Some(node)
    }
}
