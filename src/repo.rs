//! The repository handle
//!
//! [`Repository`] is an explicit handle over one working copy and its
//! `.argent` metadata directory; there is no global state. It composes
//! the content store, revision graph, dirstate, transaction manager,
//! hooks, and merge machinery into the user-facing operations: commit,
//! status, update, merge, backout, rollback, bookmarks, phases, verify,
//! pull, and push.
//!
//! Every mutating operation takes the repository lock, runs inside one
//! transaction, and on failure aborts the transaction and reloads the
//! in-memory caches so they match the untouched on-disk state.

use crate::dirstate::{Dirstate, EntryState, Status};
use crate::error::{ArgentError, Result};
use crate::graph::RevisionGraph;
use crate::hooks::{self, HookPoint, HookRegistry};
use crate::merge::{
    self, FileMergeOutcome, MergeAction, MergeState, MergeStateEntry, MergeToolRules,
    ResolutionState,
};
use crate::resolve::ResolveContext;
use crate::store::ContentStore;
use crate::sync::{self, Peer, PullReport};
use crate::transaction::{LockGuard, Transaction, TransactionManager};
use crate::types::{
    BackoutOptions, Changeset, ChangesetId, CommitOptions, FileFlag, Manifest, Phase,
    UpdateStats, NULL_ID,
};
use crate::verify::{self, VerifyReport};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Name of the repository metadata directory
pub const META_DIR: &str = ".argent";

/// In-tree tags file, one `<id> <name>` per line
const TAGS_FILE: &str = ".argenttags";

/// Persisted bookmark table
#[derive(Debug, Default, Serialize, Deserialize)]
struct BookmarkFile {
    entries: BTreeMap<String, ChangesetId>,
    active: Option<String>,
}

/// An opened repository
pub struct Repository {
    working_root: PathBuf,
    meta: PathBuf,
    graph: RevisionGraph,
    store: ContentStore,
    dirstate: Dirstate,
    manager: TransactionManager,
    bookmarks: BookmarkFile,
    hooks: HookRegistry,
    merge_rules: MergeToolRules,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("root", &self.working_root)
            .field("changesets", &self.graph.len())
            .finish()
    }
}

impl Repository {
    /// Create a new repository at `path`
    pub fn init(path: &Path) -> Result<Self> {
        let working_root = path.to_path_buf();
        let meta = working_root.join(META_DIR);
        if meta.exists() {
            return Err(ArgentError::RepositoryExists(working_root));
        }
        fs::create_dir_all(&meta)?;
        let store = ContentStore::init(meta.join("store"))?;
        let graph = RevisionGraph::init(meta.clone())?;
        let dirstate = Dirstate::init(meta.clone(), working_root.clone());
        let manager = TransactionManager::new(meta.clone());
        info!("initialized repository at {:?}", working_root);
        Ok(Self {
            working_root,
            meta,
            graph,
            store,
            dirstate,
            manager,
            bookmarks: BookmarkFile::default(),
            hooks: HookRegistry::new(),
            merge_rules: MergeToolRules::new(),
        })
    }

    /// Open the repository containing `path`, walking up to find it
    ///
    /// Recovers from a crashed transaction before loading anything.
    pub fn open(path: &Path) -> Result<Self> {
        let working_root = Self::find_root(path)?;
        let meta = working_root.join(META_DIR);
        let manager = TransactionManager::new(meta.clone());
        if manager.recover()? {
            info!("recovered interrupted transaction");
        }
        let graph = RevisionGraph::open(meta.clone())?;
        let store = ContentStore::open(meta.join("store"))?;
        let dirstate = Dirstate::open(meta.clone(), working_root.clone())?;
        let bookmarks = Self::load_bookmarks(&meta)?;
        Ok(Self {
            working_root,
            meta,
            graph,
            store,
            dirstate,
            manager,
            bookmarks,
            hooks: HookRegistry::new(),
            merge_rules: MergeToolRules::new(),
        })
    }

    fn find_root(path: &Path) -> Result<PathBuf> {
        let mut current = Some(path);
        while let Some(dir) = current {
            if dir.join(META_DIR).is_dir() {
                return Ok(dir.to_path_buf());
            }
            current = dir.parent();
        }
        Err(ArgentError::RepositoryNotFound(path.to_path_buf()))
    }

    fn load_bookmarks(meta: &Path) -> Result<BookmarkFile> {
        let path = meta.join("bookmarks.json");
        if !path.exists() {
            return Ok(BookmarkFile::default());
        }
        Ok(serde_json::from_str(&fs::read_to_string(&path)?)?)
    }

    /// Working copy root
    pub fn root(&self) -> &Path {
        &self.working_root
    }

    /// The revision graph
    pub fn graph(&self) -> &RevisionGraph {
        &self.graph
    }

    /// The content store
    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    /// Mutable hook registry
    pub fn hooks_mut(&mut self) -> &mut HookRegistry {
        &mut self.hooks
    }

    /// Mutable merge tool rules
    pub fn merge_rules_mut(&mut self) -> &mut MergeToolRules {
        &mut self.merge_rules
    }

    fn lock(&self) -> Result<LockGuard> {
        LockGuard::acquire(self.meta.join("lock"))
    }

    fn wlock(&self) -> Result<LockGuard> {
        LockGuard::acquire(self.meta.join("wlock"))
    }

    /// Discard in-memory caches after an aborted transaction
    fn reload(&mut self) -> Result<()> {
        self.graph.reload()?;
        self.store.reload()?;
        self.dirstate.reload()?;
        self.bookmarks = Self::load_bookmarks(&self.meta)?;
        Ok(())
    }

    fn begin(&mut self, operation: &str) -> Result<Transaction> {
        let mut txn = self.manager.begin(operation)?;
        // The dirstate and bookmarks are journaled up front so rollback
        // restores them even when the operation never rewrites them.
        txn.snapshot(Path::new("dirstate"));
        txn.snapshot(Path::new("bookmarks.json"));
        Ok(txn)
    }

    fn stage_bookmarks(&self, txn: &mut Transaction) -> Result<()> {
        txn.write(
            Path::new("bookmarks.json"),
            serde_json::to_string_pretty(&self.bookmarks)?.into_bytes(),
        );
        Ok(())
    }

    // ----- resolution -------------------------------------------------

    fn tags(&self) -> BTreeMap<String, ChangesetId> {
        let mut tags = BTreeMap::new();
        let path = self.working_root.join(TAGS_FILE);
        if let Ok(text) = fs::read_to_string(&path) {
            for line in text.lines() {
                if let Some((id, name)) = line.trim().split_once(' ') {
                    if self.graph.contains(id) {
                        tags.insert(name.to_string(), id.to_string());
                    }
                }
            }
        }
        tags
    }

    /// Resolve a revision specifier against this repository
    pub fn resolve(&self, spec: &str) -> Result<ChangesetId> {
        let tags = self.tags();
        let ctx = ResolveContext {
            graph: &self.graph,
            bookmarks: &self.bookmarks.entries,
            tags: &tags,
            wdir_parent: self.dirstate.parents().0,
            remote: None,
        };
        ctx.resolve(spec)
    }

    /// Evaluate a revset expression
    pub fn revset(&self, expr: &str) -> Result<Vec<ChangesetId>> {
        let tags = self.tags();
        let ctx = ResolveContext {
            graph: &self.graph,
            bookmarks: &self.bookmarks.entries,
            tags: &tags,
            wdir_parent: self.dirstate.parents().0,
            remote: None,
        };
        ctx.revset(expr)
    }

    // ----- working copy -----------------------------------------------

    fn manifest_of(&self, id: &str) -> Result<Manifest> {
        if crate::types::is_null(id) {
            return Ok(Manifest::new());
        }
        let changeset = self.graph.get(id)?;
        self.store.get_manifest(&changeset.manifest_id)
    }

    /// Classify every working-copy path
    pub fn status(&self, list_clean: bool, list_ignored: bool) -> Result<Status> {
        let manifest = self.manifest_of(self.dirstate.parents().0)?;
        let store = &self.store;
        self.dirstate
            .status(None, list_clean, list_ignored, |path| {
                match manifest.get(path) {
                    Some(entry) => Ok(Some(store.get(&entry.revision_id)?)),
                    None => Ok(None),
                }
            })
    }

    /// Start tracking files
    pub fn add(&mut self, paths: &[String]) -> Result<()> {
        let _wlock = self.wlock()?;
        for path in paths {
            if !self.working_root.join(path).exists() {
                return Err(ArgentError::abort(format!("{}: no such file", path)));
            }
            if self.dirstate.entry(path).is_none() {
                self.dirstate.record_transition(path, EntryState::Added);
            }
        }
        self.flush_dirstate()
    }

    /// Schedule files for removal and delete them from the working copy
    pub fn remove(&mut self, paths: &[String]) -> Result<()> {
        let _wlock = self.wlock()?;
        for path in paths {
            self.dirstate.record_transition(path, EntryState::Removed);
            let abs = self.working_root.join(path);
            if abs.exists() {
                fs::remove_file(&abs)?;
            }
        }
        self.flush_dirstate()
    }

    /// Record a copy; the destination must already exist on disk
    pub fn copy(&mut self, source: &str, dest: &str) -> Result<()> {
        let _wlock = self.wlock()?;
        if !self.working_root.join(dest).exists() {
            return Err(ArgentError::abort(format!("{}: no such file", dest)));
        }
        self.dirstate.record_copy(source, dest);
        self.flush_dirstate()
    }

    /// Set the branch name recorded by the next commit
    pub fn set_branch(&mut self, name: &str) -> Result<()> {
        let _wlock = self.wlock()?;
        self.dirstate.set_branch(name.to_string());
        self.flush_dirstate()
    }

    /// Branch the next commit will land on
    pub fn branch(&self) -> &str {
        self.dirstate.branch()
    }

    /// Persist the dirstate outside any graph-changing transaction
    fn flush_dirstate(&mut self) -> Result<()> {
        let mut txn = self.manager.begin("dirstate")?;
        match self.dirstate.write(&mut txn) {
            Ok(()) => txn.commit(),
            Err(err) => {
                txn.abort();
                Err(err)
            }
        }
    }

    // ----- commit -----------------------------------------------------

    /// Record a new changeset from the current working copy
    pub fn commit(&mut self, options: &CommitOptions) -> Result<ChangesetId> {
        let _lock = self.lock()?;
        let _wlock = self.wlock()?;

        let merge_state = MergeState::load(&self.meta)?;
        if let Some(state) = &merge_state {
            if !state.is_clean() {
                return Err(ArgentError::UnresolvedConflicts);
            }
        }

        let status = self.status(false, false)?;
        let is_merge_commit = self.dirstate.parents().1.is_some();
        if status.is_clean() && !is_merge_commit {
            return Err(ArgentError::NothingChanged);
        }

        let mut txn = self.begin("commit")?;
        match self.commit_inner(&mut txn, options, &status, merge_state.is_some()) {
            Ok(id) => {
                txn.commit()?;
                Ok(id)
            }
            Err(err) => {
                txn.abort();
                self.reload()?;
                Err(err)
            }
        }
    }

    fn commit_inner(
        &mut self,
        txn: &mut Transaction,
        options: &CommitOptions,
        status: &Status,
        clear_merge: bool,
    ) -> Result<ChangesetId> {
        let (p1, p2) = {
            let (a, b) = self.dirstate.parents();
            (a.to_string(), b.map(str::to_string))
        };
        let p1_manifest = self.manifest_of(&p1)?;
        let p2_manifest = match &p2 {
            Some(p2) => Some(self.manifest_of(p2)?),
            None => None,
        };

        self.hooks.run(
            HookPoint::PreCommit,
            &hooks::context(&[("parent1", &p1), ("branch", self.dirstate.branch())]),
        )?;

        let mut manifest = p1_manifest.clone();
        let mut touched: Vec<String> = Vec::new();
        for path in status.modified.iter().chain(status.added.iter()) {
            let (content, flags) = self.read_working_file(path)?;
            let parent1 = p1_manifest.get(path).map(|e| e.revision_id.clone());
            let parent2 = p2_manifest
                .as_ref()
                .and_then(|m| m.get(path))
                .map(|e| e.revision_id.clone())
                .filter(|id| parent1.as_ref() != Some(id));
            let copy_from = self.dirstate.copy_source(path).and_then(|source| {
                p1_manifest
                    .get(source)
                    .map(|e| (source.to_string(), e.revision_id.clone()))
            });
            let id = self.store.put(
                txn,
                path,
                &content,
                parent1.as_ref(),
                parent2.as_ref(),
                copy_from,
            )?;
            manifest.insert(path.clone(), id, flags);
            touched.push(path.clone());
        }
        for path in &status.removed {
            manifest.remove(path);
            touched.push(path.clone());
        }

        let manifest_id = self.store.put_manifest(txn, &manifest)?;
        let date = options
            .date
            .unwrap_or_else(|| chrono::Local::now().fixed_offset());
        let branch = options
            .branch
            .clone()
            .unwrap_or_else(|| self.dirstate.branch().to_string());
        let changeset = Changeset::new(
            p1.clone(),
            p2,
            manifest_id,
            options.user.clone(),
            date,
            branch,
            options.message.clone(),
            options.extra.clone(),
        );
        let id = self.graph.commit(txn, changeset)?;

        // Working copy now sits on the new changeset.
        self.dirstate.set_parents(id.clone(), None);
        for path in &status.removed {
            self.dirstate.forget(path);
        }
        for path in &touched {
            if !status.removed.contains(path) {
                self.dirstate.record_normal(path)?;
            }
        }
        // Files touched only by the merge settle back to normal.
        let merged: Vec<String> = self
            .dirstate
            .entries()
            .filter(|(_, e)| e.state == EntryState::Merged)
            .map(|(p, _)| p.clone())
            .collect();
        for path in merged {
            self.dirstate.record_normal(&path)?;
        }
        self.dirstate.write(txn)?;

        if clear_merge {
            MergeState::clear(txn);
        }

        // The active bookmark follows commits made on top of it.
        if let Some(active) = self.bookmarks.active.clone() {
            if self.bookmarks.entries.get(&active) == Some(&p1) || crate::types::is_null(&p1) {
                self.bookmarks.entries.insert(active, id.clone());
                self.stage_bookmarks(txn)?;
            }
        }

        info!("committed {} ({} files)", &id[..12], touched.len());
        Ok(id)
    }

    fn read_working_file(&self, path: &str) -> Result<(Vec<u8>, FileFlag)> {
        let abs = self.working_root.join(path);
        let meta = fs::symlink_metadata(&abs)?;
        if meta.file_type().is_symlink() {
            let target = fs::read_link(&abs)?;
            return Ok((
                target.to_string_lossy().into_owned().into_bytes(),
                FileFlag::Symlink,
            ));
        }
        let content = fs::read(&abs)?;
        let flags = if is_executable(&meta) {
            FileFlag::Executable
        } else {
            FileFlag::Regular
        };
        Ok((content, flags))
    }

    // ----- update -----------------------------------------------------

    /// Move the working copy to another changeset
    ///
    /// Refuses with uncommitted changes unless `clean`, which discards
    /// them. An interrupted merge must be continued or aborted first.
    pub fn update(&mut self, spec: &str, clean: bool) -> Result<UpdateStats> {
        let _wlock = self.wlock()?;
        if MergeState::load(&self.meta)?.is_some() && !clean {
            return Err(ArgentError::InterruptedOperation);
        }
        let target = self.resolve(spec)?;
        if !clean && !self.status(false, false)?.is_clean() {
            return Err(ArgentError::abort(
                "uncommitted changes (use update -C to discard)",
            ));
        }

        // Pending dirstate writes become visible to hooks before they run.
        self.flush_dirstate()?;
        self.hooks.run(
            HookPoint::PreUpdate,
            &hooks::context(&[("node", &target), ("clean", &clean.to_string())]),
        )?;

        let mut txn = self.begin("update")?;
        match self.update_inner(&mut txn, &target, clean) {
            Ok(stats) => {
                txn.commit()?;
                self.hooks
                    .run(HookPoint::Update, &hooks::context(&[("node", &target)]))?;
                Ok(stats)
            }
            Err(err) => {
                txn.abort();
                self.reload()?;
                Err(err)
            }
        }
    }

    fn update_inner(
        &mut self,
        txn: &mut Transaction,
        target: &str,
        clean: bool,
    ) -> Result<UpdateStats> {
        let current = self.manifest_of(self.dirstate.parents().0)?;
        let wanted = self.manifest_of(target)?;
        let mut stats = UpdateStats::default();

        for (path, entry) in wanted.iter() {
            let unchanged = current
                .get(path)
                .map_or(false, |c| c.revision_id == entry.revision_id && c.flags == entry.flags);
            if unchanged && !clean {
                continue;
            }
            let content = self.store.get(&entry.revision_id)?;
            self.write_working_file(path, &content, entry.flags)?;
            stats.updated += 1;
        }
        for (path, _) in current.iter() {
            if !wanted.contains(path) {
                let abs = self.working_root.join(path);
                if abs.exists() || fs::symlink_metadata(&abs).is_ok() {
                    fs::remove_file(&abs)?;
                }
                stats.removed += 1;
            }
        }

        if clean {
            MergeState::clear(txn);
        }
        self.dirstate.clear();
        self.dirstate.set_parents(target.to_string(), None);
        let branch = if crate::types::is_null(target) {
            "default".to_string()
        } else {
            self.graph.get(target)?.branch.clone()
        };
        self.dirstate.set_branch(branch);
        for (path, _) in wanted.iter() {
            self.dirstate.record_normal(path)?;
        }
        self.dirstate.write(txn)?;
        Ok(stats)
    }

    fn write_working_file(&self, path: &str, content: &[u8], flags: FileFlag) -> Result<()> {
        let abs = self.working_root.join(path);
        if let Some(parent) = abs.parent() {
            fs::create_dir_all(parent)?;
        }
        if fs::symlink_metadata(&abs).is_ok() {
            fs::remove_file(&abs)?;
        }
        match flags {
            FileFlag::Symlink => make_symlink(content, &abs)?,
            FileFlag::Regular | FileFlag::Executable => {
                fs::write(&abs, content)?;
                set_executable(&abs, flags == FileFlag::Executable)?;
            }
        }
        Ok(())
    }

    // ----- merge ------------------------------------------------------

    /// Merge another head into the working copy
    ///
    /// Returns the per-category counts; a non-zero `unresolved` means a
    /// merge is now in progress and must be resolved and committed, or
    /// aborted.
    pub fn merge(&mut self, spec: &str) -> Result<UpdateStats> {
        let _lock = self.lock()?;
        let _wlock = self.wlock()?;
        if MergeState::load(&self.meta)?.is_some() {
            return Err(ArgentError::InterruptedOperation);
        }
        if !self.status(false, false)?.is_clean() {
            return Err(ArgentError::abort("uncommitted changes"));
        }

        let other = self.resolve(spec)?;
        let p1 = self.dirstate.parents().0.to_string();
        if other == p1 || self.graph.is_ancestor(&other, &p1) {
            return Err(ArgentError::abort("merging with an ancestor has no effect"));
        }
        if self.graph.is_ancestor(&p1, &other) {
            return Err(ArgentError::abort(
                "working directory is an ancestor of the merge target (use update)",
            ));
        }

        let mut txn = self.begin("merge")?;
        match self.merge_inner(&mut txn, &p1, &other) {
            Ok(stats) => {
                txn.commit()?;
                Ok(stats)
            }
            Err(err) => {
                txn.abort();
                self.reload()?;
                Err(err)
            }
        }
    }

    fn merge_inner(
        &mut self,
        txn: &mut Transaction,
        p1: &str,
        other: &str,
    ) -> Result<UpdateStats> {
        let ancestor_id = self
            .graph
            .common_ancestor(p1, other)
            .unwrap_or_else(|| NULL_ID.to_string());
        let ancestor = self.manifest_of(&ancestor_id)?;
        let local = self.manifest_of(p1)?;
        let remote = self.manifest_of(other)?;

        let mut stats = UpdateStats::default();
        let mut state = MergeState::new(p1.to_string(), other.to_string());

        for (path, action) in merge::classify(&ancestor, &local, &remote) {
            match action {
                MergeAction::Keep => {}
                MergeAction::Take => {
                    let entry = remote.get(&path).ok_or_else(|| {
                        ArgentError::internal(format!("classified Take without entry: {}", path))
                    })?;
                    let content = self.store.get(&entry.revision_id)?;
                    self.write_working_file(&path, &content, entry.flags)?;
                    self.dirstate.record_transition(&path, EntryState::Merged);
                    stats.updated += 1;
                }
                MergeAction::Remove => {
                    let abs = self.working_root.join(&path);
                    if abs.exists() {
                        fs::remove_file(&abs)?;
                    }
                    self.dirstate.record_transition(&path, EntryState::Removed);
                    stats.removed += 1;
                }
                MergeAction::Merge => {
                    let outcome = self.merge_one(&ancestor, &local, &remote, &path)?;
                    self.record_merge_outcome(&mut state, &mut stats, &ancestor, &local, &remote, &path, outcome)?;
                }
                MergeAction::DeleteModifyConflict { deleted_locally } => {
                    // The surviving modified side lands in the working
                    // copy; the user decides its fate.
                    if deleted_locally {
                        let entry = remote.get(&path).ok_or_else(|| {
                            ArgentError::internal(format!("conflict without entry: {}", path))
                        })?;
                        let content = self.store.get(&entry.revision_id)?;
                        self.write_working_file(&path, &content, entry.flags)?;
                        self.dirstate.record_transition(&path, EntryState::Merged);
                    }
                    self.record_unresolved(&mut state, &ancestor, &local, &remote, &path)?;
                    stats.unresolved += 1;
                }
                MergeAction::FlagConflict => {
                    self.record_unresolved(&mut state, &ancestor, &local, &remote, &path)?;
                    stats.unresolved += 1;
                }
            }
        }

        self.dirstate
            .set_parents(p1.to_string(), Some(other.to_string()));
        state.write(txn)?;
        self.dirstate.write(txn)?;
        info!(
            "merge: {} updated, {} merged, {} removed, {} unresolved",
            stats.updated, stats.merged, stats.removed, stats.unresolved
        );
        Ok(stats)
    }

    fn merge_one(
        &self,
        ancestor: &Manifest,
        local: &Manifest,
        remote: &Manifest,
        path: &str,
    ) -> Result<FileMergeOutcome> {
        let base = match ancestor.get(path) {
            Some(entry) => Some(self.store.get(&entry.revision_id)?),
            None => None,
        };
        let local_entry = local
            .get(path)
            .ok_or_else(|| ArgentError::internal(format!("merge without local entry: {}", path)))?;
        let remote_entry = remote
            .get(path)
            .ok_or_else(|| ArgentError::internal(format!("merge without other entry: {}", path)))?;
        let local_content = self.store.get(&local_entry.revision_id)?;
        let remote_content = self.store.get(&remote_entry.revision_id)?;
        merge::merge_file(
            path,
            base.as_deref(),
            &local_content,
            &remote_content,
            local_entry.flags,
            remote_entry.flags,
            &self.merge_rules,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn record_merge_outcome(
        &mut self,
        state: &mut MergeState,
        stats: &mut UpdateStats,
        ancestor: &Manifest,
        local: &Manifest,
        remote: &Manifest,
        path: &str,
        outcome: FileMergeOutcome,
    ) -> Result<()> {
        let flags = local.get(path).map(|e| e.flags).unwrap_or(FileFlag::Regular);
        let (content, resolution) = match outcome {
            FileMergeOutcome::ResolvedClean(content) => (content, ResolutionState::Resolved),
            FileMergeOutcome::ResolvedByTool(content) => {
                (content, ResolutionState::ResolvedByTool)
            }
            FileMergeOutcome::Unresolved(content) => (content, ResolutionState::Unresolved),
        };
        self.write_working_file(path, &content, flags)?;
        self.dirstate.record_transition(path, EntryState::Merged);
        match resolution {
            ResolutionState::Unresolved => stats.unresolved += 1,
            _ => stats.merged += 1,
        }
        state.record(MergeStateEntry {
            path: path.to_string(),
            state: resolution,
            local_id: local.get(path).map(|e| e.revision_id.clone()).unwrap_or_default(),
            other_id: remote.get(path).map(|e| e.revision_id.clone()).unwrap_or_default(),
            ancestor_path: path.to_string(),
            ancestor_id: ancestor.get(path).map(|e| e.revision_id.clone()),
            content_hash: merge::content_digest(&content),
        });
        Ok(())
    }

    fn record_unresolved(
        &mut self,
        state: &mut MergeState,
        ancestor: &Manifest,
        local: &Manifest,
        remote: &Manifest,
        path: &str,
    ) -> Result<()> {
        let content = fs::read(self.working_root.join(path)).unwrap_or_default();
        state.record(MergeStateEntry {
            path: path.to_string(),
            state: ResolutionState::Unresolved,
            local_id: local.get(path).map(|e| e.revision_id.clone()).unwrap_or_default(),
            other_id: remote.get(path).map(|e| e.revision_id.clone()).unwrap_or_default(),
            ancestor_path: path.to_string(),
            ancestor_id: ancestor.get(path).map(|e| e.revision_id.clone()),
            content_hash: merge::content_digest(&content),
        });
        Ok(())
    }

    /// Whether an interrupted merge is pending
    pub fn merge_in_progress(&self) -> Result<bool> {
        Ok(MergeState::load(&self.meta)?.is_some())
    }

    /// List per-file resolution states of the pending merge
    pub fn resolve_list(&self) -> Result<Vec<(String, ResolutionState)>> {
        match MergeState::load(&self.meta)? {
            Some(state) => Ok(state
                .entries
                .values()
                .map(|e| (e.path.clone(), e.state))
                .collect()),
            None => Ok(Vec::new()),
        }
    }

    /// Mark a conflicted file resolved or unresolved again
    pub fn resolve_mark(&mut self, path: &str, resolved: bool) -> Result<()> {
        let _wlock = self.wlock()?;
        let mut state = MergeState::load(&self.meta)?
            .ok_or_else(|| ArgentError::abort("resolve: no merge in progress"))?;
        state.mark(
            path,
            if resolved {
                ResolutionState::Resolved
            } else {
                ResolutionState::Unresolved
            },
        )?;
        let mut txn = self.begin("resolve")?;
        match state.write(&mut txn) {
            Ok(()) => txn.commit(),
            Err(err) => {
                txn.abort();
                Err(err)
            }
        }
    }

    /// Commit the pending merge (fails while conflicts remain)
    pub fn merge_continue(&mut self, options: &CommitOptions) -> Result<ChangesetId> {
        if MergeState::load(&self.meta)?.is_none() {
            return Err(ArgentError::abort("continue: no merge in progress"));
        }
        self.commit(options)
    }

    /// Abandon the pending merge and restore the first parent
    pub fn merge_abort(&mut self) -> Result<UpdateStats> {
        if MergeState::load(&self.meta)?.is_none() {
            return Err(ArgentError::abort("no merge in progress"));
        }
        let p1 = self.dirstate.parents().0.to_string();
        self.update(&p1, true)
    }

    // ----- backout ----------------------------------------------------

    /// Reverse-apply a changeset's changes on top of the working copy
    ///
    /// Commits the inverse changeset unless `no_commit`, in which case
    /// the reversal is left as working-copy modifications. With `merge`,
    /// the reversal is committed as a new head on the target's own
    /// lineage and then merged into the previous working-copy parent,
    /// leaving an uncommitted two-parent state. Returns the new
    /// changeset id, or `None` with `no_commit`.
    pub fn backout(
        &mut self,
        spec: &str,
        options: &BackoutOptions,
    ) -> Result<Option<ChangesetId>> {
        let (target, parent) = {
            let _lock = self.lock()?;
            let _wlock = self.wlock()?;
            if MergeState::load(&self.meta)?.is_some() {
                return Err(ArgentError::InterruptedOperation);
            }
            if !self.status(false, false)?.is_clean() {
                return Err(ArgentError::abort("uncommitted changes"));
            }

            let target = self.resolve(spec)?;
            let p1 = self.dirstate.parents().0.to_string();
            let parent = merge::backout_parent(&self.graph, &p1, &target, options)?;

            if !options.merge {
                let mut txn = self.begin("backout")?;
                match self.backout_inner(&mut txn, &p1, &target, &parent) {
                    Ok(()) => txn.commit()?,
                    Err(err) => {
                        txn.abort();
                        self.reload()?;
                        return Err(err);
                    }
                }
            }
            (target, parent)
        };

        if options.merge {
            return self.backout_merge(&target, &parent, options).map(Some);
        }

        if options.no_commit {
            info!("changeset backed out, changes left uncommitted");
            return Ok(None);
        }

        let commit_options = self.backout_commit_options(&target, options);
        let id = self.commit(&commit_options)?;
        Ok(Some(id))
    }

    /// Commit the reversal as a child of the target, then merge that new
    /// head back into the previous working-copy parent
    fn backout_merge(
        &mut self,
        target: &str,
        parent: &str,
        options: &BackoutOptions,
    ) -> Result<ChangesetId> {
        let origin = self.dirstate.parents().0.to_string();

        self.update(target, false)?;
        {
            let _lock = self.lock()?;
            let _wlock = self.wlock()?;
            let mut txn = self.begin("backout")?;
            match self.backout_inner(&mut txn, target, target, parent) {
                Ok(()) => txn.commit()?,
                Err(err) => {
                    txn.abort();
                    self.reload()?;
                    return Err(err);
                }
            }
        }
        let commit_options = self.backout_commit_options(target, options);
        let backed = self.commit(&commit_options)?;

        if origin == target {
            // Backing out the tip: the reversal already sits on top.
            return Ok(backed);
        }

        self.update(&origin, false)?;
        let stats = self.merge(&backed)?;
        if stats.unresolved > 0 {
            return Err(ArgentError::UnresolvedConflicts);
        }
        info!(
            "merged backout changeset {}, merge left uncommitted",
            &backed[..12]
        );
        Ok(backed)
    }

    fn backout_commit_options(&self, target: &str, options: &BackoutOptions) -> CommitOptions {
        let message = options
            .message
            .clone()
            .unwrap_or_else(|| format!("Backed out changeset {}", &target[..12]));
        let mut commit_options = CommitOptions::new(message, whoami());
        commit_options
            .extra
            .insert("backout_source".to_string(), target.to_string());
        commit_options
    }

    /// Apply the inverse of target (relative to `parent`) onto the
    /// working copy as plain modifications
    fn backout_inner(
        &mut self,
        txn: &mut Transaction,
        p1: &str,
        target: &str,
        parent: &str,
    ) -> Result<()> {
        // Three-way: what target changed relative to its parent is undone
        // against the current tree, so unrelated later changes survive.
        let ancestor = self.manifest_of(target)?;
        let local = self.manifest_of(p1)?;
        let remote = self.manifest_of(parent)?;

        let mut changed = false;
        for (path, action) in merge::classify(&ancestor, &local, &remote) {
            match action {
                MergeAction::Keep => {}
                MergeAction::Take => {
                    let entry = remote.get(&path).ok_or_else(|| {
                        ArgentError::internal(format!("backout Take without entry: {}", path))
                    })?;
                    let content = self.store.get(&entry.revision_id)?;
                    self.write_working_file(&path, &content, entry.flags)?;
                    self.dirstate.record_transition(&path, EntryState::Merged);
                    changed = true;
                }
                MergeAction::Remove => {
                    let abs = self.working_root.join(&path);
                    if abs.exists() {
                        fs::remove_file(&abs)?;
                    }
                    self.dirstate.record_transition(&path, EntryState::Removed);
                    changed = true;
                }
                MergeAction::Merge => {
                    match self.merge_one(&ancestor, &local, &remote, &path)? {
                        FileMergeOutcome::ResolvedClean(content)
                        | FileMergeOutcome::ResolvedByTool(content) => {
                            let flags = local
                                .get(&path)
                                .map(|e| e.flags)
                                .unwrap_or(FileFlag::Regular);
                            self.write_working_file(&path, &content, flags)?;
                            self.dirstate.record_transition(&path, EntryState::Merged);
                            changed = true;
                        }
                        FileMergeOutcome::Unresolved(_) => {
                            return Err(ArgentError::abort(format!(
                                "conflicts while backing out {} in {}",
                                &target[..12],
                                path
                            )));
                        }
                    }
                }
                MergeAction::DeleteModifyConflict { .. } | MergeAction::FlagConflict => {
                    return Err(ArgentError::abort(format!(
                        "conflicts while backing out {} in {}",
                        &target[..12],
                        path
                    )));
                }
            }
        }

        if !changed {
            return Err(ArgentError::NothingChanged);
        }
        self.dirstate.write(txn)?;
        Ok(())
    }

    // ----- rollback ---------------------------------------------------

    /// Undo the last committed transaction
    pub fn rollback(&mut self) -> Result<String> {
        let _lock = self.lock()?;
        let _wlock = self.wlock()?;
        let operation = self.manager.rollback()?;
        self.reload()?;
        info!("rolled back {}", operation);
        Ok(operation)
    }

    // ----- queries ----------------------------------------------------

    /// Visible heads, optionally of one branch
    pub fn heads(&self, branch: Option<&str>) -> Result<Vec<ChangesetId>> {
        let visible: std::collections::HashSet<ChangesetId> =
            self.graph.visible_ids().into_iter().collect();
        Ok(self
            .graph
            .heads(branch)
            .into_iter()
            .filter(|id| visible.contains(id))
            .collect())
    }

    /// Visible changesets, newest first
    pub fn log(&self) -> Vec<&Changeset> {
        self.graph
            .visible_ids()
            .iter()
            .rev()
            .filter_map(|id| self.graph.get(id).ok())
            .collect::<Vec<_>>()
    }

    /// Working copy parents
    pub fn working_parents(&self) -> (String, Option<String>) {
        let (a, b) = self.dirstate.parents();
        (a.to_string(), b.map(str::to_string))
    }

    // ----- bookmarks --------------------------------------------------

    /// All bookmarks with the active one flagged
    pub fn bookmarks(&self) -> Vec<(String, ChangesetId, bool)> {
        self.bookmarks
            .entries
            .iter()
            .map(|(name, id)| {
                (
                    name.clone(),
                    id.clone(),
                    self.bookmarks.active.as_deref() == Some(name),
                )
            })
            .collect()
    }

    /// Create or move a bookmark; activates it on the working parent
    pub fn bookmark_set(&mut self, name: &str, spec: Option<&str>) -> Result<()> {
        let _wlock = self.wlock()?;
        let id = match spec {
            Some(spec) => self.resolve(spec)?,
            None => self.dirstate.parents().0.to_string(),
        };
        let old = self.bookmarks.entries.get(name).cloned().unwrap_or_default();
        self.hooks.run(
            HookPoint::PushKey,
            &hooks::context(&[
                ("namespace", "bookmarks"),
                ("key", name),
                ("old", &old),
                ("new", &id),
            ]),
        )?;
        self.bookmarks.entries.insert(name.to_string(), id.clone());
        if id == self.dirstate.parents().0 {
            self.bookmarks.active = Some(name.to_string());
        }
        self.commit_bookmarks()
    }

    /// Delete a bookmark
    pub fn bookmark_delete(&mut self, name: &str) -> Result<()> {
        let _wlock = self.wlock()?;
        let old = match self.bookmarks.entries.get(name) {
            Some(id) => id.clone(),
            None => {
                return Err(ArgentError::abort(format!("bookmark {:?} does not exist", name)));
            }
        };
        self.hooks.run(
            HookPoint::PushKey,
            &hooks::context(&[
                ("namespace", "bookmarks"),
                ("key", name),
                ("old", &old),
                ("new", ""),
            ]),
        )?;
        self.bookmarks.entries.remove(name);
        if self.bookmarks.active.as_deref() == Some(name) {
            self.bookmarks.active = None;
        }
        self.commit_bookmarks()
    }

    fn commit_bookmarks(&mut self) -> Result<()> {
        let mut txn = self.manager.begin("bookmark")?;
        match self.stage_bookmarks(&mut txn) {
            Ok(()) => txn.commit(),
            Err(err) => {
                txn.abort();
                Err(err)
            }
        }
    }

    // ----- phases -----------------------------------------------------

    /// Phase of a changeset
    pub fn phase(&self, spec: &str) -> Result<Phase> {
        let id = self.resolve(spec)?;
        Ok(self.graph.phase(&id))
    }

    /// Move a changeset to another phase
    ///
    /// Moving backwards (towards secret) from public requires `force`:
    /// published history is shared history.
    pub fn set_phase(&mut self, spec: &str, phase: Phase, force: bool) -> Result<()> {
        let _lock = self.lock()?;
        let id = self.resolve(spec)?;
        if self.graph.phase(&id) == Phase::Public && phase != Phase::Public && !force {
            return Err(ArgentError::abort(format!(
                "cannot move public changeset {} to {} without --force",
                &id[..12],
                phase.name()
            )));
        }
        let mut txn = self.begin("phase")?;
        match self.graph.set_phase(&mut txn, &id, phase) {
            Ok(()) => txn.commit(),
            Err(err) => {
                txn.abort();
                self.reload()?;
                Err(err)
            }
        }
    }

    // ----- verify -----------------------------------------------------

    /// Check repository integrity, optionally repairing the fncache
    pub fn verify(&mut self, repair: bool) -> Result<VerifyReport> {
        let _lock = self.lock()?;
        if repair {
            let mut txn = self.begin("verify-repair")?;
            match verify::verify(&self.graph, &self.store, Some(&mut txn)) {
                Ok(report) => {
                    txn.commit()?;
                    Ok(report)
                }
                Err(err) => {
                    txn.abort();
                    self.reload()?;
                    Err(err)
                }
            }
        } else {
            verify::verify(&self.graph, &self.store, None)
        }
    }

    // ----- sync -------------------------------------------------------

    /// Pull missing changesets from a peer
    pub fn pull(&mut self, peer: &dyn Peer, revs: Option<&[String]>) -> Result<PullReport> {
        let _lock = self.lock()?;
        let mut txn = self.begin("pull")?;
        let report = match sync::pull(&mut self.graph, &self.store, &mut txn, peer, revs) {
            Ok(report) => report,
            Err(err) => {
                txn.abort();
                self.reload()?;
                return Err(err);
            }
        };
        txn.commit()?;
        self.hooks.run(
            HookPoint::ChangeGroup,
            &hooks::context(&[("source", "pull"), ("added", &report.added.to_string())]),
        )?;
        Ok(report)
    }

    /// Push local changesets to a peer, publishing what was pushed
    pub fn push(&mut self, peer: &mut dyn Peer, force: bool) -> Result<usize> {
        let _lock = self.lock()?;
        let pushed = sync::push(&self.graph, &self.store, peer, force)?;

        // Pushed drafts become public on our side too.
        let mut txn = self.begin("push")?;
        let mut result = Ok(());
        for id in &pushed {
            if self.graph.phase(id) == Phase::Draft {
                if let Err(err) = self.graph.set_phase(&mut txn, id, Phase::Public) {
                    result = Err(err);
                    break;
                }
            }
        }
        match result {
            Ok(()) => txn.commit()?,
            Err(err) => {
                txn.abort();
                self.reload()?;
                return Err(err);
            }
        }
        self.hooks.run(
            HookPoint::ChangeGroup,
            &hooks::context(&[("source", "push"), ("added", &pushed.len().to_string())]),
        )?;
        Ok(pushed.len())
    }
}

/// Best-effort current user identity for default commit attribution
pub fn whoami() -> String {
    std::env::var("ARGENT_USER")
        .or_else(|_| std::env::var("USER"))
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    meta.mode() & 0o100 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
fn set_executable(path: &Path, executable: bool) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o755 } else { 0o644 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_path: &Path, _executable: bool) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &[u8], link: &Path) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;
    let target = std::ffi::OsStr::from_bytes(target);
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_symlink(target: &[u8], link: &Path) -> Result<()> {
    // Degrade to a regular file carrying the target path.
    fs::write(link, target)?;
    Ok(())
}
