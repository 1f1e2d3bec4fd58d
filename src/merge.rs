//! Three-way merge: manifest classification, diff3 text merge, tool
//! dispatch, and persistent merge state
//!
//! A merge runs in three layers. Manifest classification compares the
//! local, other, and common-ancestor manifests and decides per path
//! whether a side wins outright, the file needs a content merge, or the
//! situation is a conflict a human must see (modify/delete, flag
//! disagreement). Content merging aligns both sides against the ancestor
//! with an LCS line diff and applies non-overlapping hunks automatically;
//! overlapping hunks become conflict markers. Tool dispatch lets ordered
//! glob rules route individual paths to an internal strategy or an
//! external program.
//!
//! The per-file outcome of an interrupted merge is persisted so resolve,
//! continue, and abort work across process restarts.

use crate::error::{ArgentError, Result};
use crate::graph::RevisionGraph;
use crate::transaction::Transaction;
use crate::types::{BackoutOptions, ChangesetId, FileFlag, Manifest, RevisionId};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::process::Command;
use tracing::{debug, warn};

/// File name of the persisted merge state
pub const MERGE_STATE_FILE: &str = "merge-state.json";

/// Bytes scanned when sniffing for binary content
const BINARY_SNIFF_LEN: usize = 8000;

/// Per-path decision from manifest-level classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeAction {
    /// Keep the local revision unchanged
    Keep,
    /// Take the other side's revision
    Take,
    /// Delete the file (other side removed an unmodified file)
    Remove,
    /// Both sides changed the file: content merge required
    Merge,
    /// One side modified, the other deleted
    DeleteModifyConflict {
        /// True when the deletion happened locally
        deleted_locally: bool,
    },
    /// Sides disagree on the file flag (exec bit, symlink)
    FlagConflict,
}

/// Classify every path across local, other, and their common ancestor
///
/// Follows the usual three-way rules: an unchanged side yields to the
/// changed one, identical changes collapse, and divergent changes
/// require a content merge or surface as a conflict.
pub fn classify(
    ancestor: &Manifest,
    local: &Manifest,
    other: &Manifest,
) -> Vec<(String, MergeAction)> {
    let mut paths: BTreeSet<&String> = BTreeSet::new();
    paths.extend(ancestor.iter().map(|(p, _)| p));
    paths.extend(local.iter().map(|(p, _)| p));
    paths.extend(other.iter().map(|(p, _)| p));

    let mut actions = Vec::new();
    for path in paths {
        let base = ancestor.get(path);
        let ours = local.get(path);
        let theirs = other.get(path);

        let action = match (ours, theirs) {
            (Some(l), Some(o)) => {
                if l.revision_id == o.revision_id && l.flags == o.flags {
                    MergeAction::Keep
                } else {
                    let local_changed = base.map_or(true, |b| {
                        b.revision_id != l.revision_id || b.flags != l.flags
                    });
                    let other_changed = base.map_or(true, |b| {
                        b.revision_id != o.revision_id || b.flags != o.flags
                    });
                    match (local_changed, other_changed) {
                        (false, true) => MergeAction::Take,
                        (true, false) => MergeAction::Keep,
                        _ => {
                            if l.flags != o.flags
                                && base.map_or(true, |b| {
                                    b.flags != l.flags && b.flags != o.flags
                                })
                            {
                                MergeAction::FlagConflict
                            } else {
                                MergeAction::Merge
                            }
                        }
                    }
                }
            }
            (Some(l), None) => match base {
                // Added locally, other side never had it.
                None => MergeAction::Keep,
                Some(b) if b.revision_id == l.revision_id && b.flags == l.flags => {
                    // Other deleted a file we did not touch.
                    MergeAction::Remove
                }
                Some(_) => MergeAction::DeleteModifyConflict {
                    deleted_locally: false,
                },
            },
            (None, Some(o)) => match base {
                // Added on the other side.
                None => MergeAction::Take,
                Some(b) if b.revision_id == o.revision_id && b.flags == o.flags => {
                    // We deleted it, other side did not touch it: stays gone.
                    MergeAction::Keep
                }
                Some(_) => MergeAction::DeleteModifyConflict {
                    deleted_locally: true,
                },
            },
            (None, None) => continue,
        };
        actions.push((path.clone(), action));
    }
    actions
}

/// Result of a diff3 premerge
#[derive(Debug, PartialEq, Eq)]
pub enum Premerge {
    /// All hunks applied without overlap
    Clean(Vec<u8>),
    /// Output contains conflict markers
    Conflicted {
        /// Merged content with markers embedded
        content: Vec<u8>,
        /// Number of conflict regions
        conflicts: usize,
    },
}

/// Whether content looks binary (NUL byte in the leading window)
pub fn is_binary(data: &[u8]) -> bool {
    data.iter().take(BINARY_SNIFF_LEN).any(|&b| b == 0)
}

fn split_lines(data: &[u8]) -> Vec<&str> {
    let text = std::str::from_utf8(data).unwrap_or("");
    if text.is_empty() {
        return Vec::new();
    }
    text.split_inclusive('\n').collect()
}

/// Matched line pairs between two sequences, via LCS dynamic programming
fn lcs_matches(a: &[&str], b: &[&str]) -> Vec<(usize, usize)> {
    let mut table = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            table[i][j] = if a[i] == b[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }
    let mut matches = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] == b[j] {
            matches.push((i, j));
            i += 1;
            j += 1;
        } else if table[i + 1][j] >= table[i][j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }
    matches
}

/// Three-way text merge with conflict markers
///
/// Aligns local and other against the base; regions where only one side
/// diverges take that side's text, identical divergences collapse, and
/// the rest become a marker block quoting local, base, and other.
pub fn merge_text(base: &[u8], local: &[u8], other: &[u8]) -> Premerge {
    let base_lines = split_lines(base);
    let local_lines = split_lines(local);
    let other_lines = split_lines(other);

    let local_map: BTreeMap<usize, usize> =
        lcs_matches(&base_lines, &local_lines).into_iter().collect();
    let other_map: BTreeMap<usize, usize> =
        lcs_matches(&base_lines, &other_lines).into_iter().collect();

    let mut out = String::new();
    let mut conflicts = 0usize;
    let (mut bi, mut li, mut oi) = (0usize, 0usize, 0usize);

    while bi < base_lines.len() || li < local_lines.len() || oi < other_lines.len() {
        // Stable run: base line matched at the current cursor on both sides.
        if bi < base_lines.len()
            && local_map.get(&bi) == Some(&li)
            && other_map.get(&bi) == Some(&oi)
        {
            out.push_str(base_lines[bi]);
            bi += 1;
            li += 1;
            oi += 1;
            continue;
        }

        // Unstable chunk: scan to the next base line anchored on both sides.
        let mut anchor = bi;
        while anchor < base_lines.len() {
            if let (Some(&al), Some(&ao)) = (local_map.get(&anchor), other_map.get(&anchor)) {
                if al >= li && ao >= oi {
                    break;
                }
            }
            anchor += 1;
        }
        let (local_end, other_end) = if anchor < base_lines.len() {
            (local_map[&anchor], other_map[&anchor])
        } else {
            (local_lines.len(), other_lines.len())
        };

        let base_chunk = &base_lines[bi..anchor];
        let local_chunk = &local_lines[li..local_end];
        let other_chunk = &other_lines[oi..other_end];

        if local_chunk == base_chunk {
            out.extend(other_chunk.iter().copied());
        } else if other_chunk == base_chunk || local_chunk == other_chunk {
            out.extend(local_chunk.iter().copied());
        } else {
            conflicts += 1;
            ensure_newline(&mut out);
            out.push_str("<<<<<<< local\n");
            out.extend(local_chunk.iter().copied());
            ensure_newline(&mut out);
            out.push_str("||||||| base\n");
            out.extend(base_chunk.iter().copied());
            ensure_newline(&mut out);
            out.push_str("=======\n");
            out.extend(other_chunk.iter().copied());
            ensure_newline(&mut out);
            out.push_str(">>>>>>> other\n");
        }

        bi = anchor;
        li = local_end;
        oi = other_end;
    }

    if conflicts == 0 {
        Premerge::Clean(out.into_bytes())
    } else {
        Premerge::Conflicted {
            content: out.into_bytes(),
            conflicts,
        }
    }
}

fn ensure_newline(out: &mut String) {
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
}

/// A merge strategy for one or more paths
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool", rename_all = "kebab-case")]
pub enum MergeTool {
    /// diff3 premerge with conflict markers
    InternalMerge,
    /// Resolve by keeping the local version
    InternalKeepLocal,
    /// Resolve by taking the other version
    InternalTakeOther,
    /// Run an external program over (local, base, other) temp files;
    /// exit status 0 means the rewritten local file is the result
    External {
        /// Program name or path, resolved through `PATH`
        program: String,
    },
}

/// Ordered path-pattern rules selecting a merge tool
///
/// The first matching rule wins; unmatched paths use the internal
/// diff3 merge.
pub struct MergeToolRules {
    rules: Vec<(GlobMatcher, MergeTool)>,
}

impl Default for MergeToolRules {
    fn default() -> Self {
        Self::new()
    }
}

impl MergeToolRules {
    /// Empty rule set (everything merges internally)
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule; order of insertion is precedence order
    pub fn add_rule(&mut self, pattern: &str, tool: MergeTool) -> Result<()> {
        let matcher = Glob::new(pattern)
            .map_err(|e| ArgentError::abort(format!("bad merge pattern {:?}: {}", pattern, e)))?
            .compile_matcher();
        self.rules.push((matcher, tool));
        Ok(())
    }

    /// Tool selected for a path
    pub fn tool_for(&self, path: &str) -> &MergeTool {
        for (matcher, tool) in &self.rules {
            if matcher.is_match(path) {
                return tool;
            }
        }
        &MergeTool::InternalMerge
    }
}

/// Outcome of merging one file's content
#[derive(Debug, PartialEq, Eq)]
pub enum FileMergeOutcome {
    /// Premerge applied every hunk without overlap
    ResolvedClean(Vec<u8>),
    /// A tool (internal strategy or external program) decided the result
    ResolvedByTool(Vec<u8>),
    /// Conflicts remain; content carries markers (or the untouched local
    /// bytes when markers are impossible, e.g. binary)
    Unresolved(Vec<u8>),
}

/// Merge one file's content according to the selected tool
///
/// Binary content, symlinks, and flag disagreements are never merged
/// automatically: under the internal merge they stay unresolved with
/// the local bytes untouched, so only an explicit strategy or external
/// tool can decide them.
pub fn merge_file(
    path: &str,
    base: Option<&[u8]>,
    local: &[u8],
    other: &[u8],
    local_flag: FileFlag,
    other_flag: FileFlag,
    rules: &MergeToolRules,
) -> Result<FileMergeOutcome> {
    match rules.tool_for(path) {
        MergeTool::InternalKeepLocal => Ok(FileMergeOutcome::ResolvedByTool(local.to_vec())),
        MergeTool::InternalTakeOther => Ok(FileMergeOutcome::ResolvedByTool(other.to_vec())),
        MergeTool::External { program } => run_external(program, base, local, other),
        MergeTool::InternalMerge => {
            let unmergeable = local_flag == FileFlag::Symlink
                || other_flag == FileFlag::Symlink
                || local_flag != other_flag
                || is_binary(local)
                || is_binary(other)
                || base.map_or(false, is_binary);
            if unmergeable {
                debug!("{}: not auto-mergeable, leaving unresolved", path);
                return Ok(FileMergeOutcome::Unresolved(local.to_vec()));
            }
            match merge_text(base.unwrap_or(b""), local, other) {
                Premerge::Clean(content) => Ok(FileMergeOutcome::ResolvedClean(content)),
                Premerge::Conflicted { content, .. } => Ok(FileMergeOutcome::Unresolved(content)),
            }
        }
    }
}

fn run_external(
    program: &str,
    base: Option<&[u8]>,
    local: &[u8],
    other: &[u8],
) -> Result<FileMergeOutcome> {
    let dir = tempfile::tempdir()?;
    let local_path = dir.path().join("local");
    let base_path = dir.path().join("base");
    let other_path = dir.path().join("other");
    fs::write(&local_path, local)?;
    fs::write(&base_path, base.unwrap_or(b""))?;
    fs::write(&other_path, other)?;

    let status = Command::new(program)
        .arg(&local_path)
        .arg(&base_path)
        .arg(&other_path)
        .status()
        .map_err(|e| ArgentError::MergeToolFailed(format!("{}: {}", program, e)))?;
    if status.success() {
        Ok(FileMergeOutcome::ResolvedByTool(fs::read(&local_path)?))
    } else {
        warn!("merge tool {} exited with {}", program, status);
        Ok(FileMergeOutcome::Unresolved(local.to_vec()))
    }
}

/// Resolution state of one file in an interrupted merge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionState {
    /// Still carries conflicts
    Unresolved,
    /// Marked resolved by the user
    Resolved,
    /// A merge tool produced the result
    ResolvedByTool,
}

/// Per-file record in the persisted merge state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeStateEntry {
    /// Working-copy path
    pub path: String,
    /// Current resolution state
    pub state: ResolutionState,
    /// File revision on the local side
    pub local_id: RevisionId,
    /// File revision on the other side
    pub other_id: RevisionId,
    /// Path of the ancestor version (differs under renames)
    pub ancestor_path: String,
    /// Ancestor file revision; absent in version-1 records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ancestor_id: Option<RevisionId>,
    /// Digest of the local content at merge time, to detect edits
    pub content_hash: String,
}

/// Persisted state of an in-progress merge
///
/// Version 2 is written; version 1 files (without per-entry ancestor
/// revisions) still load, their `ancestor_id` reading as `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeState {
    /// Format version (1 or 2)
    pub version: u32,
    /// Local (working copy parent) changeset
    pub local: ChangesetId,
    /// Other (merged-in) changeset
    pub other: ChangesetId,
    /// Per-file records keyed by path
    pub entries: BTreeMap<String, MergeStateEntry>,
}

impl MergeState {
    /// Start tracking a new merge
    pub fn new(local: ChangesetId, other: ChangesetId) -> Self {
        Self {
            version: 2,
            local,
            other,
            entries: BTreeMap::new(),
        }
    }

    /// Load the persisted merge state, if a merge is in progress
    pub fn load(root: &Path) -> Result<Option<Self>> {
        let path = root.join(MERGE_STATE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        let state: MergeState = serde_json::from_str(&text)?;
        if state.version == 0 || state.version > 2 {
            return Err(ArgentError::corruption(format!(
                "unsupported merge state version {}",
                state.version
            )));
        }
        Ok(Some(state))
    }

    /// Stage the merge state into a transaction (always as version 2)
    pub fn write(&mut self, txn: &mut Transaction) -> Result<()> {
        self.version = 2;
        txn.write(
            Path::new(MERGE_STATE_FILE),
            serde_json::to_string_pretty(self)?.into_bytes(),
        );
        Ok(())
    }

    /// Stage removal of the merge state (merge finished or aborted)
    pub fn clear(txn: &mut Transaction) {
        txn.remove(Path::new(MERGE_STATE_FILE));
    }

    /// Record a file's outcome
    pub fn record(&mut self, entry: MergeStateEntry) {
        self.entries.insert(entry.path.clone(), entry);
    }

    /// Change the resolution state of a recorded file
    pub fn mark(&mut self, path: &str, state: ResolutionState) -> Result<()> {
        let entry = self
            .entries
            .get_mut(path)
            .ok_or_else(|| ArgentError::abort(format!("no merge record for {}", path)))?;
        entry.state = state;
        Ok(())
    }

    /// Paths still unresolved, sorted
    pub fn unresolved(&self) -> Vec<&str> {
        self.entries
            .values()
            .filter(|e| e.state == ResolutionState::Unresolved)
            .map(|e| e.path.as_str())
            .collect()
    }

    /// Whether every file is resolved
    pub fn is_clean(&self) -> bool {
        self.entries
            .values()
            .all(|e| e.state != ResolutionState::Unresolved)
    }
}

/// Digest used for merge-state content hashes
pub fn content_digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Validate a backout request and choose the parent to revert towards
///
/// The target must be an ancestor of the working-copy parent. A merge
/// target is ambiguous without an explicit `--parent`, and a supplied
/// parent must actually be one of the target's parents. `--merge` and
/// `--no-commit` cannot be combined.
pub fn backout_parent(
    graph: &RevisionGraph,
    wdir_parent: &str,
    target: &ChangesetId,
    options: &BackoutOptions,
) -> Result<ChangesetId> {
    if options.merge && options.no_commit {
        return Err(ArgentError::IncompatibleOptions {
            left: "--merge".to_string(),
            right: "--no-commit".to_string(),
        });
    }
    if !graph.is_ancestor(target, wdir_parent) {
        return Err(ArgentError::NotAnAncestor);
    }
    let changeset = graph.get(target)?;
    match (&options.parent, changeset.is_merge()) {
        (None, true) => Err(ArgentError::AmbiguousParent),
        (None, false) => Ok(changeset.parent1.clone()),
        (Some(requested), _) => {
            let matched = changeset
                .parents()
                .into_iter()
                .find(|p| p.starts_with(requested.as_str()));
            match matched {
                Some(parent) => Ok(parent.to_string()),
                None => Err(ArgentError::InvalidParent {
                    parent: requested.clone(),
                    node: changeset.short_id().to_string(),
                }),
            }
        }
    }
}
