//! Working copy state tracking
//!
//! The dirstate records, for every tracked file, what the engine last knew
//! about it: its lifecycle state (normal, added, removed, merged), the
//! cached stat fields used to skip content reads, and an optional copy
//! source. It also carries the working copy's parent changesets and the
//! active named branch.
//!
//! Status detection uses a stat fast path: a file whose mode, size, and
//! mtime all match the recorded values is clean without reading it. The
//! mtime is only trusted at whole-second granularity, so a file whose
//! mtime equals the second the dirstate was written is ambiguous (it may
//! have been modified again within the same clock tick). Ambiguous
//! entries store `mtime: None` and always fall back to content
//! comparison.

use crate::error::Result;
use crate::transaction::Transaction;
use crate::types::{ChangesetId, NULL_ID};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{trace, warn};
use walkdir::WalkDir;

/// Name of the ignore file at the working copy root
const IGNORE_FILE: &str = ".argentignore";

/// Lifecycle state of a tracked file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryState {
    /// Tracked and unmodified as of the recorded stat
    Normal,
    /// Scheduled for addition in the next commit
    Added,
    /// Scheduled for removal in the next commit
    Removed,
    /// Touched by an in-progress merge; always content-checked
    Merged,
}

/// Per-file dirstate record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirstateEntry {
    /// Lifecycle state
    pub state: EntryState,
    /// Recorded file mode (permission bits)
    pub mode: u32,
    /// Recorded size in bytes
    pub size: u64,
    /// Recorded mtime in whole seconds; `None` means unreliable and
    /// forces content comparison
    pub mtime: Option<i64>,
    /// Path this file was copied from, if copy-tracked
    pub copy_source: Option<String>,
}

/// Serialized dirstate file layout
#[derive(Debug, Serialize, Deserialize)]
struct DirstateFile {
    parent1: ChangesetId,
    parent2: Option<ChangesetId>,
    branch: String,
    entries: BTreeMap<String, DirstateEntry>,
}

/// Result of a working-copy status scan
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Status {
    /// Tracked files whose content differs from the recorded revision
    pub modified: Vec<String>,
    /// Files scheduled for addition
    pub added: Vec<String>,
    /// Files scheduled for removal
    pub removed: Vec<String>,
    /// Tracked files missing from the working copy
    pub deleted: Vec<String>,
    /// Untracked, unignored files
    pub unknown: Vec<String>,
    /// Untracked files matching an ignore pattern
    pub ignored: Vec<String>,
    /// Tracked, unmodified files
    pub clean: Vec<String>,
}

impl Status {
    /// Whether the working copy has no pending changes
    pub fn is_clean(&self) -> bool {
        self.modified.is_empty()
            && self.added.is_empty()
            && self.removed.is_empty()
            && self.deleted.is_empty()
    }

    fn sort_all(&mut self) {
        self.modified.sort();
        self.added.sort();
        self.removed.sort();
        self.deleted.sort();
        self.unknown.sort();
        self.ignored.sort();
        self.clean.sort();
    }
}

/// The working copy state: tracked files, parents, and branch
pub struct Dirstate {
    /// Repository metadata directory (where the dirstate file lives)
    root: PathBuf,
    /// Working copy root
    working_root: PathBuf,
    parent1: ChangesetId,
    parent2: Option<ChangesetId>,
    branch: String,
    entries: BTreeMap<String, DirstateEntry>,
}

impl std::fmt::Debug for Dirstate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dirstate")
            .field("parent1", &&self.parent1[..12.min(self.parent1.len())])
            .field("branch", &self.branch)
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl Dirstate {
    /// Create a fresh dirstate for a new repository
    pub fn init(root: PathBuf, working_root: PathBuf) -> Self {
        Self {
            root,
            working_root,
            parent1: NULL_ID.to_string(),
            parent2: None,
            branch: "default".to_string(),
            entries: BTreeMap::new(),
        }
    }

    /// Load the dirstate from disk, or start empty when absent
    pub fn open(root: PathBuf, working_root: PathBuf) -> Result<Self> {
        let path = root.join("dirstate");
        if !path.exists() {
            return Ok(Self::init(root, working_root));
        }
        let bytes = fs::read(&path)?;
        let (file, _): (DirstateFile, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
        Ok(Self {
            root,
            working_root,
            parent1: file.parent1,
            parent2: file.parent2,
            branch: file.branch,
            entries: file.entries,
        })
    }

    /// Re-read committed state, discarding in-memory mutations
    pub fn reload(&mut self) -> Result<()> {
        let fresh = Self::open(self.root.clone(), self.working_root.clone())?;
        self.parent1 = fresh.parent1;
        self.parent2 = fresh.parent2;
        self.branch = fresh.branch;
        self.entries = fresh.entries;
        Ok(())
    }

    /// Stage the dirstate into a transaction
    ///
    /// Entries whose recorded mtime falls in the current second are
    /// written with `mtime: None`: a write in the same clock tick could
    /// slip past the stat fast path otherwise.
    pub fn write(&mut self, txn: &mut Transaction) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        for entry in self.entries.values_mut() {
            if entry.mtime == Some(now) {
                entry.mtime = None;
            }
        }
        let file = DirstateFile {
            parent1: self.parent1.clone(),
            parent2: self.parent2.clone(),
            branch: self.branch.clone(),
            entries: self.entries.clone(),
        };
        let bytes = bincode::serde::encode_to_vec(&file, bincode::config::standard())?;
        txn.write(Path::new("dirstate"), bytes);
        Ok(())
    }

    /// Working copy parents (first, optional second during a merge)
    pub fn parents(&self) -> (&str, Option<&str>) {
        (&self.parent1, self.parent2.as_deref())
    }

    /// Set the working copy parents
    pub fn set_parents(&mut self, parent1: ChangesetId, parent2: Option<ChangesetId>) {
        self.parent1 = parent1;
        self.parent2 = parent2;
    }

    /// Active named branch for the next commit
    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Switch the active branch
    pub fn set_branch(&mut self, branch: String) {
        self.branch = branch;
    }

    /// Look up a tracked entry
    pub fn entry(&self, path: &str) -> Option<&DirstateEntry> {
        self.entries.get(path)
    }

    /// Iterate over all tracked entries
    pub fn entries(&self) -> impl Iterator<Item = (&String, &DirstateEntry)> {
        self.entries.iter()
    }

    /// Paths tracked for the next commit (normal, added, merged)
    pub fn tracked_paths(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.state != EntryState::Removed)
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Move a path into a new lifecycle state
    ///
    /// Transition rules: removing an `Added` file forgets it entirely
    /// (it was never committed), and re-adding a `Removed` file restores
    /// it to `Normal`.
    pub fn record_transition(&mut self, path: &str, state: EntryState) {
        match state {
            EntryState::Removed => {
                if let Some(entry) = self.entries.get(path) {
                    if entry.state == EntryState::Added {
                        self.entries.remove(path);
                        return;
                    }
                }
                self.entries.insert(
                    path.to_string(),
                    DirstateEntry {
                        state: EntryState::Removed,
                        mode: 0,
                        size: 0,
                        mtime: None,
                        copy_source: None,
                    },
                );
            }
            state => {
                let entry = self.entries.entry(path.to_string()).or_insert(DirstateEntry {
                    state,
                    mode: 0,
                    size: 0,
                    mtime: None,
                    copy_source: None,
                });
                entry.state = state;
            }
        }
    }

    /// Record a file as clean with its current on-disk stat
    pub fn record_normal(&mut self, path: &str) -> Result<()> {
        let (mode, size, mtime) = self.stat_file(path)?;
        self.entries.insert(
            path.to_string(),
            DirstateEntry {
                state: EntryState::Normal,
                mode,
                size,
                mtime: Some(mtime),
                copy_source: None,
            },
        );
        Ok(())
    }

    /// Record a copy from `source` to `dest` (dest becomes Added)
    pub fn record_copy(&mut self, source: &str, dest: &str) {
        self.record_transition(dest, EntryState::Added);
        if let Some(entry) = self.entries.get_mut(dest) {
            entry.copy_source = Some(source.to_string());
        }
    }

    /// Copy source of a path, if any
    pub fn copy_source(&self, path: &str) -> Option<&str> {
        self.entries.get(path)?.copy_source.as_deref()
    }

    /// Drop one entry entirely (committed removals, untracking)
    pub fn forget(&mut self, path: &str) {
        self.entries.remove(path);
    }

    /// Drop all entries (used by clean update before re-tracking)
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn stat_file(&self, path: &str) -> Result<(u32, u64, i64)> {
        let abs = self.working_root.join(path);
        let meta = fs::symlink_metadata(&abs)?;
        let mtime = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok((file_mode(&meta), meta.len(), mtime))
    }

    /// Scan the working copy and classify every path
    ///
    /// `matcher` restricts the scan to matching paths. `committed` yields
    /// the recorded content of a tracked file, used when the stat fast
    /// path cannot decide. Clean and ignored files are only collected
    /// when the corresponding flag is set.
    pub fn status<F>(
        &self,
        matcher: Option<&GlobSet>,
        list_clean: bool,
        list_ignored: bool,
        committed: F,
    ) -> Result<Status>
    where
        F: Fn(&str) -> Result<Option<Vec<u8>>>,
    {
        let ignore = self.load_ignore_patterns()?;
        let mut status = Status::default();
        let mut seen = std::collections::HashSet::new();

        for entry in WalkDir::new(&self.working_root)
            .into_iter()
            .filter_entry(|e| e.file_name() != ".argent")
        {
            let entry = entry?;
            if !entry.file_type().is_file() && !entry.file_type().is_symlink() {
                continue;
            }
            let rel = match entry.path().strip_prefix(&self.working_root) {
                Ok(rel) => rel_string(rel),
                Err(_) => continue,
            };
            if rel == IGNORE_FILE {
                continue;
            }
            if let Some(matcher) = matcher {
                if !matcher.is_match(&rel) {
                    continue;
                }
            }
            seen.insert(rel.clone());

            match self.entries.get(&rel) {
                None => {
                    if ignore.as_ref().map_or(false, |g| g.is_match(&rel)) {
                        if list_ignored {
                            status.ignored.push(rel);
                        }
                    } else {
                        status.unknown.push(rel);
                    }
                }
                Some(tracked) => match tracked.state {
                    EntryState::Added => status.added.push(rel),
                    EntryState::Removed => status.removed.push(rel),
                    EntryState::Merged => status.modified.push(rel),
                    EntryState::Normal => {
                        if self.is_modified(&rel, tracked, entry.metadata()?, &committed)? {
                            status.modified.push(rel);
                        } else if list_clean {
                            status.clean.push(rel);
                        }
                    }
                },
            }
        }

        // Tracked files that never showed up on disk
        for (path, tracked) in &self.entries {
            if seen.contains(path) {
                continue;
            }
            if let Some(matcher) = matcher {
                if !matcher.is_match(path) {
                    continue;
                }
            }
            match tracked.state {
                EntryState::Removed => status.removed.push(path.clone()),
                _ => status.deleted.push(path.clone()),
            }
        }

        status.sort_all();
        trace!(
            "status: {} modified, {} added, {} removed, {} deleted, {} unknown",
            status.modified.len(),
            status.added.len(),
            status.removed.len(),
            status.deleted.len(),
            status.unknown.len()
        );
        Ok(status)
    }

    fn is_modified<F>(
        &self,
        path: &str,
        tracked: &DirstateEntry,
        meta: fs::Metadata,
        committed: &F,
    ) -> Result<bool>
    where
        F: Fn(&str) -> Result<Option<Vec<u8>>>,
    {
        let mode = file_mode(&meta);
        let size = meta.len();
        let mtime = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        if exec_bit(mode) != exec_bit(tracked.mode) {
            return Ok(true);
        }
        if size != tracked.size {
            return Ok(true);
        }
        if let Some(recorded) = tracked.mtime {
            if recorded == mtime {
                return Ok(false);
            }
        }
        // Unset or stale mtime: same size, so only a content read decides.
        let disk = fs::read(self.working_root.join(path))?;
        match committed(path)? {
            Some(recorded) => Ok(disk != recorded),
            None => {
                warn!("tracked file {} has no recorded content", path);
                Ok(true)
            }
        }
    }

    fn load_ignore_patterns(&self) -> Result<Option<GlobSet>> {
        let path = self.working_root.join(IGNORE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let mut builder = GlobSetBuilder::new();
        for line in fs::read_to_string(&path)?.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match Glob::new(line) {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(err) => warn!("skipping malformed ignore pattern {:?}: {}", line, err),
            }
        }
        let set = builder
            .build()
            .map_err(|e| crate::error::ArgentError::abort(format!("bad ignore file: {e}")))?;
        Ok(Some(set))
    }
}

fn rel_string(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    meta.mode()
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> u32 {
    0o644
}

fn exec_bit(mode: u32) -> bool {
    mode & 0o100 != 0
}

/// Collapse fully-uniform directories in a status listing
///
/// A directory is reported as a single `dir/` entry in a category when
/// every file anywhere under it lands in that same category, and the
/// category is one the caller requested. The uncollapsed categories are
/// passed through unchanged, so the result depends on which categories
/// were requested: asking for `mu` can collapse a directory that asking
/// for `m` alone cannot.
pub fn terse_directories(status: &Status, requested: &str) -> Status {
    // Category letter per file, over every populated list.
    let mut by_file: BTreeMap<String, char> = BTreeMap::new();
    let lists: [(&Vec<String>, char); 7] = [
        (&status.modified, 'm'),
        (&status.added, 'a'),
        (&status.removed, 'r'),
        (&status.deleted, 'd'),
        (&status.unknown, 'u'),
        (&status.ignored, 'i'),
        (&status.clean, 'c'),
    ];
    for (list, letter) in &lists {
        for path in list.iter() {
            by_file.insert(path.clone(), *letter);
        }
    }

    // A directory collapses to `dir/` iff all files below it share one
    // category letter and that letter was requested.
    let mut dir_letters: BTreeMap<String, Option<char>> = BTreeMap::new();
    for (path, letter) in &by_file {
        let mut dir = String::new();
        for component in path.split('/').rev().skip(1).collect::<Vec<_>>().iter().rev() {
            if !dir.is_empty() {
                dir.push('/');
            }
            dir.push_str(component);
            dir_letters
                .entry(dir.clone())
                .and_modify(|existing| {
                    if *existing != Some(*letter) {
                        *existing = None;
                    }
                })
                .or_insert(Some(*letter));
        }
    }

    let collapses = |path: &str, letter: char| -> Option<String> {
        if !requested.contains(letter) {
            return None;
        }
        // Outermost uniform directory wins.
        let mut dir = String::new();
        for component in path.split('/').rev().skip(1).collect::<Vec<_>>().iter().rev() {
            if !dir.is_empty() {
                dir.push('/');
            }
            dir.push_str(component);
            if dir_letters.get(&dir) == Some(&Some(letter)) {
                return Some(format!("{}/", dir));
            }
        }
        None
    };

    let mut result = Status::default();
    let outputs: [(&Vec<String>, char, fn(&mut Status) -> &mut Vec<String>); 7] = [
        (&status.modified, 'm', |s| &mut s.modified),
        (&status.added, 'a', |s| &mut s.added),
        (&status.removed, 'r', |s| &mut s.removed),
        (&status.deleted, 'd', |s| &mut s.deleted),
        (&status.unknown, 'u', |s| &mut s.unknown),
        (&status.ignored, 'i', |s| &mut s.ignored),
        (&status.clean, 'c', |s| &mut s.clean),
    ];
    for (list, letter, target) in outputs {
        let out = target(&mut result);
        for path in list {
            match collapses(path, letter) {
                Some(dir) => {
                    if out.last() != Some(&dir) {
                        out.push(dir);
                    }
                }
                None => out.push(path.clone()),
            }
        }
        out.dedup();
    }
    result
}
