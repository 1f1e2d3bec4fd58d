//! Core data types used throughout the Argent engine
//!
//! This module contains the fundamental data structures shared across
//! components:
//!
//! - **History**: [`Changeset`], [`Manifest`], [`ManifestEntry`] - the
//!   immutable revision graph nodes and their file trees
//! - **Classification**: [`Phase`], [`FileFlag`] - per-changeset and
//!   per-file attributes
//! - **History rewriting**: [`ObsolescenceMarker`] - append-only
//!   precursor/successor edges
//! - **Operations**: [`CommitOptions`], [`BackoutOptions`], [`UpdateStats`] -
//!   operation parameters and results
//!
//! Changeset identifiers are 64-character hex SHA-256 digests computed as a
//! pure function of content and parents: committing byte-identical
//! content+parents+metadata always produces the same identifier.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Identifier of a changeset (64-character hex SHA-256 digest)
pub type ChangesetId = String;

/// Identifier of a stored file revision
pub type RevisionId = String;

/// Identifier of a manifest
pub type ManifestId = String;

/// The null identifier, used for absent parents
pub const NULL_ID: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Returns true if the given identifier is the null revision
pub fn is_null(id: &str) -> bool {
    id == NULL_ID
}

/// An immutable node in the revision graph
///
/// A changeset records one or two parents, a manifest (the file tree at
/// that point), and commit metadata. Its identifier is derived from all of
/// these, so a changeset can never be mutated in place - history rewriting
/// records obsolescence markers instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Changeset {
    /// Content-derived identifier
    pub id: ChangesetId,
    /// First parent (NULL_ID for a root changeset)
    pub parent1: ChangesetId,
    /// Second parent (None for non-merge changesets)
    pub parent2: Option<ChangesetId>,
    /// Identifier of the manifest describing the file tree
    pub manifest_id: ManifestId,
    /// Committer, conventionally "Name <email>"
    pub user: String,
    /// Commit timestamp with timezone offset
    pub date: DateTime<FixedOffset>,
    /// Named branch this changeset belongs to
    pub branch: String,
    /// Free-text commit message
    pub description: String,
    /// Extra key-value metadata (backout_source, transplant_source, ...)
    pub extra: BTreeMap<String, String>,
}

impl Changeset {
    /// Create a changeset, deriving its identifier from the content
    ///
    /// The identifier is a SHA-256 digest over a canonical serialization of
    /// every field. Two calls with identical arguments produce identical
    /// identifiers, which is what makes "nothing changed" detection and
    /// idempotent re-commits possible.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        parent1: ChangesetId,
        parent2: Option<ChangesetId>,
        manifest_id: ManifestId,
        user: String,
        date: DateTime<FixedOffset>,
        branch: String,
        description: String,
        extra: BTreeMap<String, String>,
    ) -> Self {
        let mut changeset = Self {
            id: String::new(),
            parent1,
            parent2,
            manifest_id,
            user,
            date,
            branch,
            description,
            extra,
        };
        changeset.id = changeset.compute_id();
        changeset
    }

    /// Compute the content-derived identifier
    ///
    /// Fields are fed to the hasher in a fixed order with length-free
    /// newline separators; `extra` iterates in BTreeMap key order so the
    /// digest is stable across runs.
    pub fn compute_id(&self) -> ChangesetId {
        let mut hasher = Sha256::new();
        hasher.update(&self.parent1);
        hasher.update(b"\n");
        hasher.update(self.parent2.as_deref().unwrap_or(NULL_ID));
        hasher.update(b"\n");
        hasher.update(&self.manifest_id);
        hasher.update(b"\n");
        hasher.update(&self.user);
        hasher.update(b"\n");
        hasher.update(self.date.to_rfc3339());
        hasher.update(b"\n");
        hasher.update(&self.branch);
        hasher.update(b"\n");
        hasher.update(&self.description);
        for (key, value) in &self.extra {
            hasher.update(b"\n");
            hasher.update(key);
            hasher.update(b"=");
            hasher.update(value);
        }
        hex::encode(hasher.finalize())
    }

    /// Whether this changeset has two parents
    pub fn is_merge(&self) -> bool {
        self.parent2.is_some()
    }

    /// The non-null parents of this changeset
    pub fn parents(&self) -> Vec<&str> {
        let mut parents = Vec::new();
        if !is_null(&self.parent1) {
            parents.push(self.parent1.as_str());
        }
        if let Some(p2) = &self.parent2 {
            if !is_null(p2) {
                parents.push(p2.as_str());
            }
        }
        parents
    }

    /// Short identifier for display (first 12 characters)
    pub fn short_id(&self) -> &str {
        &self.id[..12.min(self.id.len())]
    }

    /// First line of the description, for one-line log output
    pub fn summary_line(&self) -> &str {
        self.description.lines().next().unwrap_or("")
    }
}

/// Per-file flags recorded in a manifest
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FileFlag {
    /// Ordinary file
    Regular,
    /// Executable bit set
    Executable,
    /// Symbolic link; the stored content is the link target
    Symlink,
}

/// One entry in a manifest: a file revision pointer plus flags
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Revision of this file's content in the store
    pub revision_id: RevisionId,
    /// File flags
    pub flags: FileFlag,
}

/// Point-in-time mapping from file path to file revision
///
/// Paths are repo-relative, `/`-separated strings. The BTreeMap keeps
/// iteration deterministic, which matters because the manifest identifier
/// (and through it every changeset identifier) is derived from iteration
/// order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    /// File entries keyed by repo-relative path
    pub entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    /// Create an empty manifest
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry
    pub fn insert(&mut self, path: impl Into<String>, revision_id: RevisionId, flags: FileFlag) {
        self.entries.insert(
            path.into(),
            ManifestEntry { revision_id, flags },
        );
    }

    /// Look up an entry by path
    pub fn get(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.get(path)
    }

    /// Remove an entry, returning it if present
    pub fn remove(&mut self, path: &str) -> Option<ManifestEntry> {
        self.entries.remove(path)
    }

    /// Whether a path is tracked by this manifest
    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Number of files
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the manifest is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over (path, entry) pairs in path order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ManifestEntry)> {
        self.entries.iter()
    }

    /// Compute the manifest identifier: a digest over all entries
    pub fn compute_id(&self) -> ManifestId {
        let mut hasher = Sha256::new();
        for (path, entry) in &self.entries {
            hasher.update(path);
            hasher.update(b"\0");
            hasher.update(&entry.revision_id);
            hasher.update(match entry.flags {
                FileFlag::Regular => b"-",
                FileFlag::Executable => b"x",
                FileFlag::Symlink => b"l",
            });
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

/// Visibility and mutability classification of a changeset
///
/// Phases order as `Public < Draft < Secret`. Public changesets are
/// immutable and shared; draft changesets are local and exchangeable;
/// secret changesets are never transferred unless explicitly requested.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Shared, immutable history
    Public,
    /// Local history, eligible for exchange
    Draft,
    /// Local history, excluded from exchange
    Secret,
}

impl Phase {
    /// Parse a phase name
    pub fn parse(name: &str) -> Option<Phase> {
        match name {
            "public" => Some(Phase::Public),
            "draft" => Some(Phase::Draft),
            "secret" => Some(Phase::Secret),
            _ => None,
        }
    }

    /// The phase name as used in user output
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Public => "public",
            Phase::Draft => "draft",
            Phase::Secret => "secret",
        }
    }
}

/// Append-only record that one changeset was superseded by others
///
/// A marker with an empty successor set records a prune. Markers are never
/// removed; chains of markers are resolved by following successors to the
/// first non-obsolete end.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObsolescenceMarker {
    /// The superseded changeset
    pub precursor: ChangesetId,
    /// Replacement changesets (empty = pruned)
    pub successors: Vec<ChangesetId>,
    /// Operation that created the marker (amend, rebase, histedit, prune)
    pub operation: String,
    /// When the marker was recorded
    pub recorded_at: DateTime<FixedOffset>,
    /// Extra marker metadata
    pub metadata: BTreeMap<String, String>,
}

/// Options for commit operations
#[derive(Debug, Clone)]
pub struct CommitOptions {
    /// Commit message
    pub message: String,
    /// Committer identity
    pub user: String,
    /// Fixed timestamp; `None` means "now"
    pub date: Option<DateTime<FixedOffset>>,
    /// Branch override; `None` inherits the working copy branch
    pub branch: Option<String>,
    /// Extra metadata to record on the changeset
    pub extra: BTreeMap<String, String>,
}

impl CommitOptions {
    /// Commit options with just a message and user
    pub fn new(message: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            user: user.into(),
            date: None,
            branch: None,
            extra: BTreeMap::new(),
        }
    }
}

/// Options for backout operations
#[derive(Debug, Clone, Default)]
pub struct BackoutOptions {
    /// Which parent to diff against when backing out a merge
    pub parent: Option<String>,
    /// Merge the backout with the current working copy parent
    pub merge: bool,
    /// Leave the inverse diff uncommitted in the working copy
    pub no_commit: bool,
    /// Override the generated commit message
    pub message: Option<String>,
}

/// Statistics from an update (checkout) operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateStats {
    /// Files updated to the target revision
    pub updated: usize,
    /// Files merged with local changes
    pub merged: usize,
    /// Files removed
    pub removed: usize,
    /// Files left with unresolved conflicts
    pub unresolved: usize,
}

impl UpdateStats {
    /// Whether the update completed without conflicts
    pub fn is_clean(&self) -> bool {
        self.unresolved == 0
    }
}
