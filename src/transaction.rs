//! Atomic transactions, journaling, and repository locking
//!
//! Every mutating operation (commit, pull, backout, rollback of the
//! working copy, ...) runs inside a [`Transaction`]. Writes are buffered
//! in memory and nothing reaches the repository directory until
//! [`Transaction::commit`], which:
//!
//! 1. writes pre-images of every file it is about to replace into a
//!    journal directory,
//! 2. publishes each staged file with a write-to-temp-then-rename, with
//!    the changelog renamed last so a concurrent reader either sees the
//!    old graph or the complete new one,
//! 3. retires the journal as the `undo` directory, which is what a later
//!    [`TransactionManager::rollback`] replays.
//!
//! An aborted (or dropped) transaction has written nothing, so abort is
//! simply discarding the buffer. A crash between steps 1 and 3 leaves the
//! journal in place; [`TransactionManager::recover`] restores the
//! pre-images on next open.
//!
//! Cross-process exclusion uses a lock file carrying the holder identity
//! (`host:pid`). Acquisition waits with bounded retries and a "waiting for
//! lock held by X" diagnostic instead of failing immediately.

use crate::error::{ArgentError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long lock acquisition waits before giving up
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between lock acquisition attempts
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Name of the file published last during commit
///
/// Readers treat the changelog as the root of the data structure, so
/// ordering its rename last gives all-or-nothing visibility.
const PUBLISH_LAST: &str = "changelog.json";

/// One entry in the journal descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalEntry {
    /// Repo-relative path of the affected file
    path: String,
    /// Backup file name inside the journal dir; None if the file was
    /// created by this transaction (rollback deletes it)
    backup: Option<String>,
}

/// Journal descriptor persisted alongside the pre-images
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalDescriptor {
    /// Transaction identifier
    id: String,
    /// Short description of the operation (commit, pull, ...)
    operation: String,
    /// When the transaction committed
    committed_at: String,
    /// Affected files
    entries: Vec<JournalEntry>,
}

/// A buffered, journaled write transaction
///
/// Created by [`TransactionManager::begin`]. All paths are relative to
/// the repository metadata directory.
pub struct Transaction {
    id: String,
    operation: String,
    root: PathBuf,
    staged: BTreeMap<PathBuf, Vec<u8>>,
    /// Files to delete at commit (journaled, so rollback restores them)
    removals: BTreeSet<PathBuf>,
    /// Files whose pre-image must be journaled even when not staged
    /// (e.g. the dirstate captured right before the transaction opened)
    snapshots: BTreeSet<PathBuf>,
    active_flag: Option<Arc<AtomicBool>>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("operation", &self.operation)
            .field("staged", &self.staged.len())
            .finish()
    }
}

impl Transaction {
    fn new(root: PathBuf, operation: &str, active_flag: Option<Arc<AtomicBool>>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation: operation.to_string(),
            root,
            staged: BTreeMap::new(),
            removals: BTreeSet::new(),
            snapshots: BTreeSet::new(),
            active_flag,
        }
    }

    /// Standalone transaction for unit tests of store-level code
    pub fn new_for_tests(root: PathBuf) -> Self {
        Self::new(root, "test", None)
    }

    /// Stage a full-file write
    pub fn write(&mut self, rel: &Path, content: Vec<u8>) {
        self.removals.remove(rel);
        self.staged.insert(rel.to_path_buf(), content);
    }

    /// Stage a file deletion, journaled like a write
    pub fn remove(&mut self, rel: &Path) {
        self.staged.remove(rel);
        self.removals.insert(rel.to_path_buf());
    }

    /// Whether a path has a staged write in this transaction
    pub fn is_staged(&self, rel: &Path) -> bool {
        self.staged.contains_key(rel)
    }

    /// Read back a staged write
    pub fn read_staged(&self, rel: &Path) -> Option<&[u8]> {
        self.staged.get(rel).map(|v| v.as_slice())
    }

    /// Record a file whose pre-image must be journaled even if this
    /// transaction never writes it
    pub fn snapshot(&mut self, rel: &Path) {
        self.snapshots.insert(rel.to_path_buf());
    }

    /// Publish all staged writes atomically and retire the journal as undo
    pub fn commit(mut self) -> Result<()> {
        let journal_dir = self.root.join("journal");
        if journal_dir.exists() {
            // A previous transaction crashed mid-commit and was never
            // recovered; refuse to stack on top of it.
            return Err(ArgentError::corruption(
                "stale journal present; run recover before writing",
            ));
        }
        fs::create_dir_all(&journal_dir)?;

        // Phase 1: journal pre-images of everything we will touch, plus
        // the requested snapshots.
        let mut entries = Vec::new();
        let mut backup_seq = 0usize;
        let mut journaled: BTreeSet<PathBuf> = BTreeSet::new();
        let to_journal: Vec<PathBuf> = self
            .staged
            .keys()
            .cloned()
            .chain(self.removals.iter().cloned())
            .chain(self.snapshots.iter().cloned())
            .collect();
        for rel in to_journal {
            if !journaled.insert(rel.clone()) {
                continue;
            }
            let target = self.root.join(&rel);
            let backup = if target.exists() {
                let name = format!("backup.{}", backup_seq);
                backup_seq += 1;
                fs::copy(&target, journal_dir.join(&name))?;
                Some(name)
            } else {
                None
            };
            entries.push(JournalEntry {
                path: rel.to_string_lossy().replace('\\', "/"),
                backup,
            });
        }
        let descriptor = JournalDescriptor {
            id: self.id.clone(),
            operation: self.operation.clone(),
            committed_at: chrono::Utc::now().to_rfc3339(),
            entries,
        };
        fs::write(
            journal_dir.join("journal.json"),
            serde_json::to_string_pretty(&descriptor)?,
        )?;

        // Phase 2: apply removals, then publish staged files, changelog
        // last.
        for rel in std::mem::take(&mut self.removals) {
            let target = self.root.join(&rel);
            if target.exists() {
                fs::remove_file(&target)?;
            }
        }
        let mut paths: Vec<PathBuf> = self.staged.keys().cloned().collect();
        paths.sort_by_key(|p| p.file_name().map(|n| n == PUBLISH_LAST).unwrap_or(false));
        for rel in paths {
            let content = self.staged.remove(&rel).unwrap_or_default();
            let target = self.root.join(&rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            atomic_write(&target, &content)?;
        }

        // Phase 3: retire the journal as the undo directory.
        let undo_dir = self.root.join("undo");
        if undo_dir.exists() {
            fs::remove_dir_all(&undo_dir)?;
        }
        fs::rename(&journal_dir, &undo_dir)?;

        if let Some(flag) = &self.active_flag {
            flag.store(false, Ordering::SeqCst);
        }
        self.active_flag = None;
        debug!("committed transaction {} ({})", self.id, self.operation);
        Ok(())
    }

    /// Discard the transaction without writing anything
    pub fn abort(mut self) {
        debug!(
            "aborted transaction {} ({}, {} staged writes discarded)",
            self.id,
            self.operation,
            self.staged.len()
        );
        self.staged.clear();
        if let Some(flag) = &self.active_flag {
            flag.store(false, Ordering::SeqCst);
        }
        self.active_flag = None;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // An uncommitted transaction going out of scope behaves like abort:
        // nothing was written, only the active flag needs clearing.
        if let Some(flag) = &self.active_flag {
            flag.store(false, Ordering::SeqCst);
        }
    }
}

/// Write content to a temp file in the target's directory, then rename
fn atomic_write(target: &Path, content: &[u8]) -> Result<()> {
    let dir = target
        .parent()
        .ok_or_else(|| ArgentError::internal("write target has no parent directory"))?;
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut temp, content)?;
    temp.persist(target)
        .map_err(|e| ArgentError::Io(e.error))?;
    Ok(())
}

/// Coordinates transactions and undo for one repository
///
/// Exactly one transaction may be open at a time; a second
/// [`begin`](TransactionManager::begin) while one is active fails with
/// `ConcurrentTransaction`.
pub struct TransactionManager {
    root: PathBuf,
    active: Arc<AtomicBool>,
    /// Serializes begin/rollback against each other in-process
    gate: Mutex<()>,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("root", &self.root)
            .field("active", &self.active.load(Ordering::SeqCst))
            .finish()
    }
}

impl TransactionManager {
    /// Create a manager rooted at the repository metadata directory
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            active: Arc::new(AtomicBool::new(false)),
            gate: Mutex::new(()),
        }
    }

    /// Open a new transaction
    pub fn begin(&self, operation: &str) -> Result<Transaction> {
        let _gate = self.gate.lock();
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ArgentError::ConcurrentTransaction);
        }
        debug!("beginning transaction ({})", operation);
        Ok(Transaction::new(
            self.root.clone(),
            operation,
            Some(Arc::clone(&self.active)),
        ))
    }

    /// Whether an undo journal for a committed transaction exists
    pub fn can_rollback(&self) -> bool {
        self.root.join("undo").join("journal.json").exists()
    }

    /// Description of the transaction rollback would undo, if any
    pub fn rollback_description(&self) -> Option<String> {
        let descriptor = self.read_descriptor(&self.root.join("undo")).ok()?;
        Some(descriptor.operation)
    }

    /// Undo the last committed transaction
    ///
    /// Restores every journaled pre-image and deletes files the
    /// transaction created, then consumes the undo directory: a rollback
    /// cannot be rolled back.
    pub fn rollback(&self) -> Result<String> {
        let _gate = self.gate.lock();
        if self.active.load(Ordering::SeqCst) {
            return Err(ArgentError::ConcurrentTransaction);
        }
        let undo_dir = self.root.join("undo");
        if !undo_dir.join("journal.json").exists() {
            return Err(ArgentError::NoRollbackAvailable);
        }
        let descriptor = self.read_descriptor(&undo_dir)?;
        self.restore_from(&undo_dir, &descriptor)?;
        fs::remove_dir_all(&undo_dir)?;
        info!(
            "rolled back transaction {} ({})",
            descriptor.id, descriptor.operation
        );
        Ok(descriptor.operation)
    }

    /// Repair after a crash that interrupted a commit
    ///
    /// If a journal directory is still present, the interrupted
    /// transaction's pre-images are restored and the journal removed.
    /// Safe to call when no journal exists.
    pub fn recover(&self) -> Result<bool> {
        let journal_dir = self.root.join("journal");
        if !journal_dir.join("journal.json").exists() {
            if journal_dir.exists() {
                // Journal dir without descriptor: the crash happened while
                // journaling, before any target file was touched.
                fs::remove_dir_all(&journal_dir)?;
            }
            return Ok(false);
        }
        let descriptor = self.read_descriptor(&journal_dir)?;
        warn!(
            "recovering interrupted transaction {} ({})",
            descriptor.id, descriptor.operation
        );
        self.restore_from(&journal_dir, &descriptor)?;
        fs::remove_dir_all(&journal_dir)?;
        Ok(true)
    }

    fn read_descriptor(&self, dir: &Path) -> Result<JournalDescriptor> {
        let text = fs::read_to_string(dir.join("journal.json"))?;
        Ok(serde_json::from_str(&text)?)
    }

    fn restore_from(&self, dir: &Path, descriptor: &JournalDescriptor) -> Result<()> {
        for entry in &descriptor.entries {
            let target = self.root.join(&entry.path);
            match &entry.backup {
                Some(backup) => {
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::copy(dir.join(backup), &target)?;
                }
                None => {
                    if target.exists() {
                        fs::remove_file(&target)?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// RAII guard for an on-disk lock file
///
/// The lock file contains the holder identity so a waiting process can
/// name who it is waiting for. Released on drop, on every exit path.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    /// Acquire the lock at `path`, waiting up to the configured timeout
    pub fn acquire(path: PathBuf) -> Result<Self> {
        Self::acquire_with_timeout(path, LOCK_TIMEOUT)
    }

    /// Acquire with an explicit timeout (shorter in tests)
    pub fn acquire_with_timeout(path: PathBuf, timeout: Duration) -> Result<Self> {
        let identity = lock_identity();
        let deadline = Instant::now() + timeout;
        let mut warned = false;
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    std::io::Write::write_all(&mut file, identity.as_bytes())?;
                    return Ok(Self { path });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = fs::read_to_string(&path)
                        .unwrap_or_else(|_| "unknown".to_string());
                    if !warned {
                        warn!("waiting for lock held by {}", holder.trim());
                        warned = true;
                    }
                    if Instant::now() >= deadline {
                        return Err(ArgentError::LockTimeout {
                            holder: holder.trim().to_string(),
                        });
                    }
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(err) => return Err(ArgentError::Io(err)),
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!("failed to release lock {:?}: {}", self.path, err);
        }
    }
}

/// Identity written into lock files: `host:pid`
fn lock_identity() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}:{}", host, std::process::id())
}
