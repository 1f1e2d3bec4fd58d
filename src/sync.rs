//! Repository synchronization: peers, set discovery, pull and push
//!
//! Synchronization never enumerates the whole remote graph. A sampled
//! bisection narrows down the common set: each round sends a bounded,
//! deterministically sampled probe of still-undecided nodes, and the
//! peer's yes/no answers decide whole ancestor or descendant cones at
//! once.
//!
//! Transfers move only missing, reachable changesets together with the
//! manifests and file revisions they need. Secret changesets never leave
//! their repository implicitly, and the phase of what does move is
//! preserved: a changeset that is public anywhere stays public.

use crate::error::{ArgentError, Result};
use crate::graph::RevisionGraph;
use crate::resolve::RemoteIndex;
use crate::store::ContentStore;
use crate::transaction::{Transaction, TransactionManager};
use crate::types::{Changeset, ChangesetId, Manifest, ManifestId, Phase, RevisionId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Probe size cap per discovery round
const SAMPLE_LIMIT: usize = 100;

/// One file revision in transit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransfer {
    /// Repository path
    pub path: String,
    /// Revision identifier (recomputed and checked on arrival)
    pub id: RevisionId,
    /// First parent revision
    pub parent1: Option<RevisionId>,
    /// Second parent revision
    pub parent2: Option<RevisionId>,
    /// Copy source, if copy-tracked
    pub copy_from: Option<(String, RevisionId)>,
    /// Full content
    pub content: Vec<u8>,
}

/// A self-contained group of changesets and their data
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Bundle {
    /// Changesets in changelog order (parents before children)
    pub changesets: Vec<Changeset>,
    /// Manifests referenced by the changesets
    pub manifests: BTreeMap<ManifestId, Manifest>,
    /// File revisions referenced by the manifests
    pub files: Vec<FileTransfer>,
    /// Phase of each changeset at the source
    pub phases: BTreeMap<ChangesetId, Phase>,
}

impl Bundle {
    /// Whether the bundle transfers nothing
    pub fn is_empty(&self) -> bool {
        self.changesets.is_empty()
    }
}

/// A synchronization counterpart
///
/// Capability strings gate optional features; a peer without a
/// capability degrades gracefully instead of failing (e.g. no
/// `prefix-lookup` means remote prefix resolution is simply skipped).
pub trait Peer {
    /// Advertised capability strings
    fn capabilities(&self) -> BTreeSet<String>;

    /// Current heads of the peer's visible graph
    fn heads(&self) -> Result<Vec<ChangesetId>>;

    /// For each id, whether the peer has it
    fn known(&self, ids: &[ChangesetId]) -> Result<Vec<bool>>;

    /// Assemble a bundle of everything reachable from `heads` that is
    /// not reachable from `common`, excluding secret changesets
    fn bundle(&self, heads: &[ChangesetId], common: &[ChangesetId]) -> Result<Bundle>;

    /// Apply a bundle sent by a pushing client
    fn unbundle(&mut self, bundle: &Bundle) -> Result<usize>;

    /// Resolve a hex prefix, when the `prefix-lookup` capability is
    /// advertised
    fn lookup_prefix(&self, prefix: &str) -> Result<Option<ChangesetId>>;
}

/// Adapter exposing a peer as a secondary resolution index
pub struct PeerIndex<'a>(pub &'a dyn Peer);

impl<'a> RemoteIndex for PeerIndex<'a> {
    fn lookup_prefix(&self, prefix: &str) -> std::result::Result<Option<ChangesetId>, String> {
        if !self.0.capabilities().contains("prefix-lookup") {
            return Ok(None);
        }
        self.0.lookup_prefix(prefix).map_err(|e| e.to_string())
    }
}

/// Find the common set between the local graph and a peer
///
/// Returns the heads of the common set (every common node is an
/// ancestor of one of them). Probes are sampled with a deterministic
/// stride over the undecided region, capped per round, so discovery
/// cost scales with the exchange size rather than repository size.
pub fn discover_common(local: &RevisionGraph, peer: &dyn Peer) -> Result<Vec<ChangesetId>> {
    if local.is_empty() {
        return Ok(Vec::new());
    }

    // Cheap first round: the peer's heads decide their whole cones.
    let mut common: HashSet<ChangesetId> = HashSet::new();
    let mut undecided: BTreeSet<ChangesetId> = local.visible_ids().into_iter().collect();
    for head in peer.heads()? {
        if local.contains(&head) {
            for ancestor in local.ancestors(&head) {
                common.insert(ancestor.id.clone());
                undecided.remove(&ancestor.id);
            }
        }
    }

    let mut round = 0usize;
    while !undecided.is_empty() {
        round += 1;
        let sample = stride_sample(local, &undecided, SAMPLE_LIMIT);
        debug!(
            "discovery round {}: {} undecided, probing {}",
            round,
            undecided.len(),
            sample.len()
        );
        let answers = peer.known(&sample)?;
        for (id, known) in sample.iter().zip(answers) {
            if known {
                // Everything below a known node is known too.
                for ancestor in local.ancestors(id) {
                    common.insert(ancestor.id.clone());
                    undecided.remove(&ancestor.id);
                }
            } else {
                // Everything above an unknown node is unknown too.
                let mut queue = vec![id.clone()];
                while let Some(current) = queue.pop() {
                    if undecided.remove(&current) {
                        queue.extend(local.children_of(&current).iter().cloned());
                    }
                }
            }
        }
    }

    // Reduce the common set to its heads.
    let heads: Vec<ChangesetId> = common
        .iter()
        .filter(|id| {
            !local
                .children_of(id)
                .iter()
                .any(|child| common.contains(child))
        })
        .cloned()
        .collect();
    info!(
        "discovery finished after {} rounds: {} common heads",
        round,
        heads.len()
    );
    Ok(sorted_by_changelog(local, heads))
}

/// Deterministic stride sample over the undecided set
///
/// Takes every k-th element in changelog order where k spreads the cap
/// across the whole set; the same inputs always probe the same nodes.
fn stride_sample(
    local: &RevisionGraph,
    undecided: &BTreeSet<ChangesetId>,
    limit: usize,
) -> Vec<ChangesetId> {
    let ordered: Vec<&ChangesetId> = local
        .all_ids()
        .iter()
        .filter(|id| undecided.contains(*id))
        .collect();
    if ordered.len() <= limit {
        return ordered.into_iter().cloned().collect();
    }
    let stride = ordered.len().div_ceil(limit);
    ordered
        .iter()
        .step_by(stride)
        .map(|id| (*id).clone())
        .collect()
}

fn sorted_by_changelog(graph: &RevisionGraph, ids: Vec<ChangesetId>) -> Vec<ChangesetId> {
    let set: HashSet<ChangesetId> = ids.into_iter().collect();
    graph
        .all_ids()
        .iter()
        .filter(|id| set.contains(*id))
        .cloned()
        .collect()
}

/// Outcome of a pull
#[derive(Debug, Default)]
pub struct PullReport {
    /// Changesets added to the local graph
    pub added: usize,
    /// Recoverable problems (e.g. revision sources the peer did not know)
    pub warnings: Vec<String>,
}

/// Pull missing changesets from a peer into the local repository
///
/// `revs` bounds the pull to specific remote revisions; `None` pulls
/// everything the peer will serve. Re-running a bounded pull converges:
/// already-present data is skipped, and revision sources the peer does
/// not recognize degrade to warnings instead of failing the whole pull.
pub fn pull(
    graph: &mut RevisionGraph,
    store: &ContentStore,
    txn: &mut Transaction,
    peer: &dyn Peer,
    revs: Option<&[String]>,
) -> Result<PullReport> {
    let mut report = PullReport::default();
    let common = discover_common(graph, peer)?;

    let heads = match revs {
        None => peer.heads()?,
        Some(specs) => {
            let mut resolved = Vec::new();
            for spec in specs {
                match peer.lookup_prefix(spec) {
                    Ok(Some(id)) => resolved.push(id),
                    Ok(None) => {
                        warn!("remote does not know revision source {:?}", spec);
                        report
                            .warnings
                            .push(format!("unknown revision source {:?}", spec));
                    }
                    Err(err) => {
                        warn!("remote lookup of {:?} failed: {}", spec, err);
                        report
                            .warnings
                            .push(format!("could not resolve {:?}: {}", spec, err));
                    }
                }
            }
            resolved
        }
    };

    let bundle = peer.bundle(&heads, &common)?;
    report.added = apply_bundle(graph, store, txn, &bundle, false)?;
    if report.added == 0 && report.warnings.is_empty() {
        return Err(ArgentError::NoChangesFound);
    }
    info!("pulled {} changesets", report.added);
    Ok(report)
}

/// Push local changesets to a peer
///
/// Secret changesets stay home. A push that would create a new head on
/// the peer fails with `MultipleHeadsRejected` unless forced. Returns
/// the ids of the pushed changesets so the caller can publish them.
pub fn push(
    graph: &RevisionGraph,
    store: &ContentStore,
    peer: &mut dyn Peer,
    force: bool,
) -> Result<Vec<ChangesetId>> {
    let common = discover_common(graph, peer)?;
    let common_cone: HashSet<ChangesetId> = common
        .iter()
        .flat_map(|head| graph.ancestors(head).map(|cs| cs.id.clone()))
        .collect();

    let outgoing: Vec<ChangesetId> = graph
        .visible_ids()
        .into_iter()
        .filter(|id| !common_cone.contains(id))
        .filter(|id| graph.phase(id) != Phase::Secret)
        .collect();
    if outgoing.is_empty() {
        return Err(ArgentError::NoChangesFound);
    }

    if !force {
        check_new_heads(graph, peer, &outgoing, &common_cone)?;
    }

    let bundle = build_bundle(graph, store, &outgoing)?;
    let applied = peer.unbundle(&bundle)?;
    info!("pushed {} changesets", applied);
    Ok(outgoing)
}

/// Reject a push that would leave the peer with more heads than before
fn check_new_heads(
    graph: &RevisionGraph,
    peer: &dyn Peer,
    outgoing: &[ChangesetId],
    common_cone: &HashSet<ChangesetId>,
) -> Result<()> {
    let remote_heads = peer.heads()?;
    let outgoing_set: HashSet<&ChangesetId> = outgoing.iter().collect();
    let outgoing_heads: Vec<&ChangesetId> = outgoing
        .iter()
        .filter(|id| {
            !graph
                .children_of(id)
                .iter()
                .any(|child| outgoing_set.contains(child))
        })
        .collect();

    for head in outgoing_heads {
        // A pushed head replaces a remote head when it descends from one;
        // anything else adds a head.
        let supersedes = remote_heads.iter().any(|remote| {
            common_cone.contains(remote) && graph.contains(remote) && graph.is_ancestor(remote, head)
        });
        if !supersedes && !remote_heads.is_empty() {
            return Err(ArgentError::MultipleHeadsRejected(head[..12].to_string()));
        }
    }
    Ok(())
}

/// Collect the transfer payload for a set of changesets
pub fn build_bundle(
    graph: &RevisionGraph,
    store: &ContentStore,
    ids: &[ChangesetId],
) -> Result<Bundle> {
    let mut bundle = Bundle::default();
    let ordered = sorted_by_changelog(graph, ids.to_vec());
    let mut sent_files: HashSet<RevisionId> = HashSet::new();

    for id in &ordered {
        let changeset = graph.get(id)?;
        bundle.changesets.push(changeset.clone());
        bundle.phases.insert(id.clone(), graph.phase(id));

        if !bundle.manifests.contains_key(&changeset.manifest_id) {
            let manifest = store.get_manifest(&changeset.manifest_id)?;
            for (path, entry) in manifest.iter() {
                if !sent_files.insert(entry.revision_id.clone()) {
                    continue;
                }
                let (parent1, parent2) = store.revision_parents(&entry.revision_id)?;
                bundle.files.push(FileTransfer {
                    path: path.clone(),
                    id: entry.revision_id.clone(),
                    parent1,
                    parent2,
                    copy_from: store.copy_info(&entry.revision_id)?,
                    content: store.get(&entry.revision_id)?,
                });
            }
            bundle
                .manifests
                .insert(changeset.manifest_id.clone(), manifest);
        }
    }
    Ok(bundle)
}

/// Apply a bundle to the local graph and store
///
/// Already-present changesets, manifests, and file revisions are
/// skipped, which is what makes interrupted transfers resumable. When
/// `serving` is true the bundle came from a pushing client and its
/// phases are honored as-is; otherwise secret never arrives implicitly.
pub fn apply_bundle(
    graph: &mut RevisionGraph,
    store: &ContentStore,
    txn: &mut Transaction,
    bundle: &Bundle,
    serving: bool,
) -> Result<usize> {
    for file in &bundle.files {
        let id = store.put(
            txn,
            &file.path,
            &file.content,
            file.parent1.as_ref(),
            file.parent2.as_ref(),
            file.copy_from.clone(),
        )?;
        if id != file.id {
            return Err(ArgentError::HashMismatch {
                expected: file.id.clone(),
                actual: id,
            });
        }
    }
    for manifest in bundle.manifests.values() {
        store.put_manifest(txn, manifest)?;
    }

    let mut added = 0usize;
    for changeset in &bundle.changesets {
        if graph.contains(&changeset.id) {
            continue;
        }
        let computed = changeset.compute_id();
        if computed != changeset.id {
            return Err(ArgentError::HashMismatch {
                expected: changeset.id.clone(),
                actual: computed,
            });
        }
        graph.commit(txn, changeset.clone())?;
        added += 1;

        let phase = match bundle.phases.get(&changeset.id) {
            Some(Phase::Public) => Phase::Public,
            Some(Phase::Secret) if serving => Phase::Secret,
            _ => Phase::Draft,
        };
        if phase != Phase::Draft {
            graph.set_phase(txn, &changeset.id, phase)?;
        }
    }
    Ok(added)
}

/// A peer backed by another repository on the local filesystem
pub struct LocalPeer {
    graph: RevisionGraph,
    store: ContentStore,
    manager: TransactionManager,
}

impl LocalPeer {
    /// Open the repository at `working_root` as a peer
    pub fn open(working_root: PathBuf) -> Result<Self> {
        let meta = working_root.join(".argent");
        if !meta.is_dir() {
            return Err(ArgentError::RepositoryNotFound(working_root));
        }
        Ok(Self {
            graph: RevisionGraph::open(meta.clone())?,
            store: ContentStore::open(meta.join("store"))?,
            manager: TransactionManager::new(meta),
        })
    }

    /// Reload after external changes (tests mostly)
    pub fn reload(&mut self) -> Result<()> {
        self.graph.reload()?;
        self.store.reload()
    }

    /// The peer's graph, for assertions in tests
    pub fn graph(&self) -> &RevisionGraph {
        &self.graph
    }
}

impl Peer for LocalPeer {
    fn capabilities(&self) -> BTreeSet<String> {
        ["prefix-lookup", "bundle", "unbundle"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn heads(&self) -> Result<Vec<ChangesetId>> {
        // Heads of the servable subgraph: visible and not secret. A
        // secret tip's draft ancestors still surface as heads here.
        let eligible: HashSet<ChangesetId> = self
            .graph
            .visible_ids()
            .into_iter()
            .filter(|id| self.graph.phase(id) != Phase::Secret)
            .collect();
        Ok(self
            .graph
            .all_ids()
            .iter()
            .filter(|id| eligible.contains(*id))
            .filter(|id| {
                !self
                    .graph
                    .children_of(id)
                    .iter()
                    .any(|child| eligible.contains(child))
            })
            .cloned()
            .collect())
    }

    fn known(&self, ids: &[ChangesetId]) -> Result<Vec<bool>> {
        Ok(ids.iter().map(|id| self.graph.contains(id)).collect())
    }

    fn bundle(&self, heads: &[ChangesetId], common: &[ChangesetId]) -> Result<Bundle> {
        let common_cone: HashSet<ChangesetId> = common
            .iter()
            .filter(|id| self.graph.contains(id))
            .flat_map(|head| self.graph.ancestors(head).map(|cs| cs.id.clone()))
            .collect();

        let mut wanted: Vec<ChangesetId> = Vec::new();
        let mut seen: HashSet<ChangesetId> = HashSet::new();
        for head in heads {
            if !self.graph.contains(head) {
                continue;
            }
            for ancestor in self.graph.ancestors(head) {
                if common_cone.contains(&ancestor.id) || !seen.insert(ancestor.id.clone()) {
                    continue;
                }
                // Secret changesets are never served implicitly.
                if self.graph.phase(&ancestor.id) == Phase::Secret {
                    continue;
                }
                wanted.push(ancestor.id.clone());
            }
        }
        build_bundle(&self.graph, &self.store, &wanted)
    }

    fn unbundle(&mut self, bundle: &Bundle) -> Result<usize> {
        let mut txn = self.manager.begin("unbundle")?;
        let added = match apply_bundle(&mut self.graph, &self.store, &mut txn, bundle, true) {
            Ok(added) => added,
            Err(err) => {
                txn.abort();
                self.graph.reload()?;
                self.store.reload()?;
                return Err(err);
            }
        };
        txn.commit()?;
        Ok(added)
    }

    fn lookup_prefix(&self, prefix: &str) -> Result<Option<ChangesetId>> {
        let mut matches = self
            .graph
            .all_ids()
            .iter()
            .filter(|id| id.starts_with(prefix));
        match (matches.next(), matches.next()) {
            (Some(id), None) => Ok(Some(id.clone())),
            (Some(_), Some(_)) => Err(ArgentError::AmbiguousIdentifier(prefix.to_string())),
            (None, _) => Ok(None),
        }
    }
}
