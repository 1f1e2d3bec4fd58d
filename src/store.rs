//! Content-addressed storage for file revisions
//!
//! This module implements the append-only revision store. Every file
//! revision is keyed by a SHA-256 digest of its parent linkage plus
//! content, stored either as a full snapshot or as a delta against a
//! parent revision, with lz4 compression on the payload.
//!
//! ## On-disk layout
//!
//! ```text
//! store/
//! ├── data/<encoded path>/<revision id>   # revision records (bincode)
//! ├── manifests/<manifest id>             # manifest snapshots (bincode)
//! └── fncache                             # reverse index of encoded paths
//! ```
//!
//! ## Path encoding
//!
//! Paths that collide with reserved device names (`aux`, `con`, `nul`,
//! `prn`, `com1`..`com9`, `lpt1`..`lpt9`), end in a dot or space, or exceed
//! a length threshold cannot be used verbatim as directory names on every
//! filesystem. Such paths are re-encoded, long ones to a hashed key under
//! `dh/`. The `fncache` file enumerates every encoded path so the store
//! stays enumerable even when directory listing is expensive; losing it is
//! non-fatal because [`ContentStore::open`] falls back to scanning `data/`.
//!
//! ## Mutation discipline
//!
//! All writes are staged through the active [`Transaction`]; nothing
//! touches the store directory until the transaction commits. Reads always
//! see the last committed state. After an aborted transaction the caller
//! must invoke [`ContentStore::reload`] to drop in-memory bookkeeping that
//! was optimistically updated for staged writes.

use crate::error::{ArgentError, Result};
use crate::transaction::Transaction;
use crate::types::{Manifest, ManifestId, RevisionId, NULL_ID};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// Maximum delta chain length before a full snapshot is forced
///
/// Bounds the number of patches [`ContentStore::get`] must replay to
/// reconstruct any revision.
const MAX_CHAIN_LENGTH: u32 = 64;

/// Encoded path length beyond which the hashed fallback is used
const MAX_ENCODED_PATH: usize = 120;

/// Payload of one stored revision
#[derive(Debug, Clone, Serialize, Deserialize)]
enum RevisionPayload {
    /// Full content, lz4-compressed
    Snapshot {
        /// Compressed content with prepended size
        data: Vec<u8>,
    },
    /// Single-hunk splice against a base revision
    Delta {
        /// Revision this delta applies on top of
        base: RevisionId,
        /// Byte offset where the replaced region starts
        start: usize,
        /// Byte offset (exclusive) where the replaced region ends in the base
        end: usize,
        /// Replacement bytes, lz4-compressed
        data: Vec<u8>,
    },
}

/// One revision of one file, as stored on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RevisionRecord {
    /// Content-derived identifier (also the file name)
    id: RevisionId,
    /// Repo-relative path this revision belongs to
    path: String,
    /// First parent revision, if any
    parent1: Option<RevisionId>,
    /// Second parent revision (set for merge results)
    parent2: Option<RevisionId>,
    /// Copy/rename source: (source path, source revision)
    copy_from: Option<(String, RevisionId)>,
    /// Length of delta chain ending at this record (0 for snapshots)
    chain_len: u32,
    /// Uncompressed content length
    uncompressed_len: u64,
    /// Snapshot or delta payload
    payload: RevisionPayload,
}

/// Append-only, content-addressed store of file revisions and manifests
pub struct ContentStore {
    /// Store root directory
    root: PathBuf,
    /// Encoded paths known to the store (mirror of fncache)
    paths: RwLock<BTreeSet<String>>,
    /// Revision id -> encoded path owning it
    rev_index: DashMap<RevisionId, String>,
    /// Revision id -> delta chain length, to enforce the chain cap
    chain_lens: DashMap<RevisionId, u32>,
    /// Decoded manifest cache
    manifest_cache: DashMap<ManifestId, Manifest>,
}

impl std::fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStore")
            .field("root", &self.root)
            .field("paths", &self.paths.read().len())
            .field("revisions", &self.rev_index.len())
            .finish()
    }
}

impl ContentStore {
    /// Create the store directory structure
    pub fn init(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(root.join("data"))?;
        fs::create_dir_all(root.join("manifests"))?;
        fs::write(root.join("fncache"), b"")?;
        debug!("initialized content store at {:?}", root);
        Ok(Self {
            root,
            paths: RwLock::new(BTreeSet::new()),
            rev_index: DashMap::new(),
            chain_lens: DashMap::new(),
            manifest_cache: DashMap::new(),
        })
    }

    /// Open an existing store
    ///
    /// Loads the fncache if present; a missing or unreadable fncache
    /// degrades to a directory scan with a warning rather than failing.
    pub fn open(root: PathBuf) -> Result<Self> {
        if !root.join("data").exists() {
            return Err(ArgentError::RepositoryNotFound(root));
        }
        let store = Self {
            root,
            paths: RwLock::new(BTreeSet::new()),
            rev_index: DashMap::new(),
            chain_lens: DashMap::new(),
            manifest_cache: DashMap::new(),
        };
        store.load_paths()?;
        store.load_rev_index()?;
        Ok(store)
    }

    /// Drop and rebuild in-memory bookkeeping from committed disk state
    ///
    /// Called after an aborted transaction, whose staged writes may have
    /// been reflected optimistically in the caches.
    pub fn reload(&self) -> Result<()> {
        self.rev_index.clear();
        self.chain_lens.clear();
        self.manifest_cache.clear();
        self.paths.write().clear();
        self.load_paths()?;
        self.load_rev_index()?;
        Ok(())
    }

    fn load_paths(&self) -> Result<()> {
        let fncache = self.root.join("fncache");
        let mut paths = self.paths.write();
        match fs::read_to_string(&fncache) {
            Ok(text) => {
                for line in text.lines() {
                    if !line.is_empty() {
                        paths.insert(line.to_string());
                    }
                }
            }
            Err(err) => {
                warn!("fncache unreadable ({}), falling back to scan", err);
                for entry in scan_encoded_paths(&self.root.join("data"))? {
                    paths.insert(entry);
                }
            }
        }
        Ok(())
    }

    fn load_rev_index(&self) -> Result<()> {
        let data = self.root.join("data");
        for encoded in self.paths.read().iter() {
            let dir = data.join(encoded);
            if !dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let id = entry.file_name().to_string_lossy().to_string();
                self.rev_index.insert(id, encoded.clone());
            }
        }
        trace!("indexed {} revisions", self.rev_index.len());
        Ok(())
    }

    /// Store root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Compute the identifier for (parents, content)
    ///
    /// Pure function of its inputs: storing identical content with
    /// identical parents always yields the same identifier.
    pub fn revision_id(
        parent1: Option<&str>,
        parent2: Option<&str>,
        content: &[u8],
    ) -> RevisionId {
        let mut hasher = Sha256::new();
        hasher.update(parent1.unwrap_or(NULL_ID));
        hasher.update(parent2.unwrap_or(NULL_ID));
        hasher.update(content);
        hex::encode(hasher.finalize())
    }

    /// Store one file revision, staged into `txn`
    ///
    /// Idempotent: a revision that already exists (on disk or staged in
    /// this transaction) is not written again. A delta against `parent1`
    /// is stored when it is smaller than the full content and the chain
    /// cap allows it; otherwise a snapshot.
    pub fn put(
        &self,
        txn: &mut Transaction,
        path: &str,
        content: &[u8],
        parent1: Option<&RevisionId>,
        parent2: Option<&RevisionId>,
        copy_from: Option<(String, RevisionId)>,
    ) -> Result<RevisionId> {
        let id = Self::revision_id(
            parent1.map(String::as_str),
            parent2.map(String::as_str),
            content,
        );
        let encoded = encode_path(path);
        let rel = PathBuf::from("store")
            .join("data")
            .join(&encoded)
            .join(&id);

        if txn.is_staged(&rel) || self.root.join("data").join(&encoded).join(&id).exists() {
            trace!("revision {} already present, skipping write", &id[..12]);
            return Ok(id);
        }

        let (payload, chain_len) = self.choose_payload(parent1, content)?;
        let record = RevisionRecord {
            id: id.clone(),
            path: path.to_string(),
            parent1: parent1.cloned(),
            parent2: parent2.cloned(),
            copy_from,
            chain_len,
            uncompressed_len: content.len() as u64,
            payload,
        };
        let bytes = bincode::serde::encode_to_vec(&record, bincode::config::standard())?;
        txn.write(&rel, bytes);

        let is_new_path = self.paths.write().insert(encoded.clone());
        if is_new_path {
            self.stage_fncache(txn);
        }
        self.rev_index.insert(id.clone(), encoded);
        self.chain_lens.insert(id.clone(), chain_len);

        trace!("stored revision {} for {}", &id[..12], path);
        Ok(id)
    }

    /// Pick snapshot or delta storage for new content
    fn choose_payload(
        &self,
        parent1: Option<&RevisionId>,
        content: &[u8],
    ) -> Result<(RevisionPayload, u32)> {
        if let Some(base_id) = parent1 {
            if self.exists(base_id) {
                let base_chain = self
                    .chain_lens
                    .get(base_id)
                    .map(|c| *c)
                    .unwrap_or(MAX_CHAIN_LENGTH);
                if base_chain < MAX_CHAIN_LENGTH {
                    let base = self.get(base_id)?;
                    let (start, end, replacement) = splice_delta(&base, content);
                    // A delta only pays off when the replaced region is
                    // meaningfully smaller than the whole file.
                    if replacement.len() + 64 < content.len() {
                        let data = lz4_flex::compress_prepend_size(replacement);
                        return Ok((
                            RevisionPayload::Delta {
                                base: base_id.clone(),
                                start,
                                end,
                                data,
                            },
                            base_chain + 1,
                        ));
                    }
                }
            }
        }
        let data = lz4_flex::compress_prepend_size(content);
        Ok((RevisionPayload::Snapshot { data }, 0))
    }

    /// Reconstruct full content for a revision
    ///
    /// Walks the delta chain down to a snapshot and replays splices
    /// forward, then verifies the result against the content-derived
    /// identifier. A missing chain link or digest mismatch is reported as
    /// corruption.
    pub fn get(&self, id: &RevisionId) -> Result<Vec<u8>> {
        // Collect the chain from the requested revision down to a snapshot.
        let mut chain = Vec::new();
        let mut current = id.clone();
        let content = loop {
            let record = self.read_record(&current)?;
            match &record.payload {
                RevisionPayload::Snapshot { data } => {
                    let base = lz4_flex::decompress_size_prepended(data)
                        .map_err(|e| ArgentError::corruption(format!("revision {}: {}", &current[..12], e)))?;
                    chain.push(record);
                    break base;
                }
                RevisionPayload::Delta { base, .. } => {
                    let next = base.clone();
                    chain.push(record);
                    current = next;
                }
            }
        };

        // Replay deltas from the snapshot back up to the requested id.
        let mut content = content;
        for record in chain.iter().rev() {
            if let RevisionPayload::Delta { start, end, data, .. } = &record.payload {
                let replacement = lz4_flex::decompress_size_prepended(data)
                    .map_err(|e| ArgentError::corruption(format!("revision {}: {}", &record.id[..12], e)))?;
                if *start > *end || *end > content.len() {
                    return Err(ArgentError::corruption(format!(
                        "revision {}: delta range {}..{} exceeds base length {}",
                        &record.id[..12],
                        start,
                        end,
                        content.len()
                    )));
                }
                let mut next = Vec::with_capacity(content.len() - (end - start) + replacement.len());
                next.extend_from_slice(&content[..*start]);
                next.extend_from_slice(&replacement);
                next.extend_from_slice(&content[*end..]);
                content = next;
            }
        }

        let head = &chain[0];
        let computed = Self::revision_id(
            head.parent1.as_deref(),
            head.parent2.as_deref(),
            &content,
        );
        if &computed != id {
            return Err(ArgentError::HashMismatch {
                expected: id.clone(),
                actual: computed,
            });
        }
        Ok(content)
    }

    /// Whether a revision exists in the committed store
    pub fn exists(&self, id: &RevisionId) -> bool {
        if self.rev_index.contains_key(id) {
            return true;
        }
        false
    }

    /// Copy/rename metadata recorded on a revision, if any
    pub fn copy_info(&self, id: &RevisionId) -> Result<Option<(String, RevisionId)>> {
        Ok(self.read_record(id)?.copy_from)
    }

    /// Parent revisions recorded on a revision
    pub fn revision_parents(
        &self,
        id: &RevisionId,
    ) -> Result<(Option<RevisionId>, Option<RevisionId>)> {
        let record = self.read_record(id)?;
        Ok((record.parent1, record.parent2))
    }

    fn read_record(&self, id: &RevisionId) -> Result<RevisionRecord> {
        let encoded = self
            .rev_index
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| ArgentError::RevisionNotFound(id.clone()))?;
        let path = self.root.join("data").join(&encoded).join(id);
        let bytes = fs::read(&path).map_err(|e| {
            ArgentError::corruption(format!("revision {} unreadable: {}", &id[..12], e))
        })?;
        let (record, _): (RevisionRecord, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
        Ok(record)
    }

    /// Store a manifest, staged into `txn`; idempotent by identifier
    pub fn put_manifest(&self, txn: &mut Transaction, manifest: &Manifest) -> Result<ManifestId> {
        let id = manifest.compute_id();
        let rel = PathBuf::from("store").join("manifests").join(&id);
        if txn.is_staged(&rel) || self.root.join("manifests").join(&id).exists() {
            return Ok(id);
        }
        let bytes = bincode::serde::encode_to_vec(manifest, bincode::config::standard())?;
        txn.write(&rel, bytes);
        self.manifest_cache.insert(id.clone(), manifest.clone());
        trace!("stored manifest {} ({} files)", &id[..12], manifest.len());
        Ok(id)
    }

    /// Load a manifest by identifier
    pub fn get_manifest(&self, id: &ManifestId) -> Result<Manifest> {
        if let Some(cached) = self.manifest_cache.get(id) {
            return Ok(cached.clone());
        }
        let path = self.root.join("manifests").join(id);
        if !path.exists() {
            return Err(ArgentError::corruption(format!(
                "manifest {} missing from store",
                &id[..12.min(id.len())]
            )));
        }
        let bytes = fs::read(&path)?;
        let (manifest, _): (Manifest, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
        self.manifest_cache.insert(id.clone(), manifest.clone());
        Ok(manifest)
    }

    /// All encoded paths currently known (fncache view)
    pub fn known_paths(&self) -> Vec<String> {
        self.paths.read().iter().cloned().collect()
    }

    /// All revision identifiers stored under one encoded path
    pub fn revisions_for_encoded_path(&self, encoded: &str) -> Result<Vec<RevisionId>> {
        let dir = self.root.join("data").join(encoded);
        let mut revisions = Vec::new();
        if dir.is_dir() {
            for entry in fs::read_dir(&dir)? {
                revisions.push(entry?.file_name().to_string_lossy().to_string());
            }
        }
        Ok(revisions)
    }

    /// Encoded paths present on disk but absent from the fncache, and
    /// fncache entries with no backing directory
    ///
    /// Used by `verify`: inconsistencies are reportable, not fatal.
    pub fn fncache_inconsistencies(&self) -> Result<(Vec<String>, Vec<String>)> {
        let on_disk: BTreeSet<String> =
            scan_encoded_paths(&self.root.join("data"))?.into_iter().collect();
        let cached = self.paths.read().clone();
        let missing_from_cache = on_disk.difference(&cached).cloned().collect();
        let stale_in_cache = cached.difference(&on_disk).cloned().collect();
        Ok((missing_from_cache, stale_in_cache))
    }

    /// Rebuild the fncache from a full scan of `data/`
    pub fn rebuild_fncache(&self, txn: &mut Transaction) -> Result<usize> {
        let scanned = scan_encoded_paths(&self.root.join("data"))?;
        let count = scanned.len();
        {
            let mut paths = self.paths.write();
            paths.clear();
            paths.extend(scanned);
        }
        self.stage_fncache(txn);
        debug!("rebuilt fncache with {} entries", count);
        Ok(count)
    }

    fn stage_fncache(&self, txn: &mut Transaction) {
        let mut text = String::new();
        for path in self.paths.read().iter() {
            text.push_str(path);
            text.push('\n');
        }
        txn.write(&PathBuf::from("store").join("fncache"), text.into_bytes());
    }
}

/// Scan `data/` for encoded path directories (fncache rebuild fallback)
fn scan_encoded_paths(data: &Path) -> Result<Vec<String>> {
    let mut found = Vec::new();
    if !data.exists() {
        return Ok(found);
    }
    let mut stack = vec![PathBuf::new()];
    while let Some(rel) = stack.pop() {
        let dir = data.join(&rel);
        let mut has_files = false;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.path().is_dir() {
                stack.push(rel.join(entry.file_name()));
            } else {
                has_files = true;
            }
        }
        if has_files && !rel.as_os_str().is_empty() {
            found.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(found)
}

/// Reserved device basenames that cannot be used as file names everywhere
fn is_reserved_component(component: &str) -> bool {
    let base = component.split('.').next().unwrap_or(component);
    let lower = base.to_ascii_lowercase();
    matches!(lower.as_str(), "con" | "prn" | "aux" | "nul")
        || (lower.len() == 4
            && (lower.starts_with("com") || lower.starts_with("lpt"))
            && lower.as_bytes()[3].is_ascii_digit()
            && lower.as_bytes()[3] != b'0')
}

/// Encode a repo-relative path into a storage-safe key
///
/// Components that collide with reserved device names get their third
/// character hex-escaped (`aux` becomes `au~78`); trailing dots and spaces
/// are hex-escaped the same way. If the fully encoded path exceeds the
/// length threshold it collapses to a hashed key under `dh/`.
pub fn encode_path(path: &str) -> String {
    let mut parts = Vec::new();
    for component in path.split('/') {
        let mut encoded = if is_reserved_component(component) {
            let bytes = component.as_bytes();
            let mut out = String::new();
            out.push_str(&component[..2]);
            out.push_str(&format!("~{:02x}", bytes[2]));
            out.push_str(&component[3..]);
            out
        } else {
            component.to_string()
        };
        if encoded.ends_with('.') || encoded.ends_with(' ') {
            let last = encoded.pop().unwrap_or('.');
            encoded.push_str(&format!("~{:02x}", last as u32));
        }
        parts.push(encoded);
    }
    let encoded = parts.join("/");
    if encoded.len() > MAX_ENCODED_PATH {
        let digest = {
            let mut hasher = Sha256::new();
            hasher.update(path.as_bytes());
            hex::encode(hasher.finalize())
        };
        let basename = path.rsplit('/').next().unwrap_or(path);
        let mut start = basename.len().saturating_sub(32);
        while !basename.is_char_boundary(start) {
            start += 1;
        }
        format!("dh/{}-{}", &digest[..16], &basename[start..])
    } else {
        encoded
    }
}

/// Compute a single-hunk splice turning `old` into `new`
///
/// Trims the common prefix and suffix; the middle region of `old`
/// (`start..end`) is replaced by the returned slice of `new`.
fn splice_delta<'a>(old: &[u8], new: &'a [u8]) -> (usize, usize, &'a [u8]) {
    let mut start = 0;
    let max_start = old.len().min(new.len());
    while start < max_start && old[start] == new[start] {
        start += 1;
    }
    let mut old_end = old.len();
    let mut new_end = new.len();
    while old_end > start && new_end > start && old[old_end - 1] == new[new_end - 1] {
        old_end -= 1;
        new_end -= 1;
    }
    (start, old_end, &new[start..new_end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;
    use tempfile::TempDir;

    fn test_store() -> (ContentStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = ContentStore::init(temp.path().join("store")).unwrap();
        (store, temp)
    }

    fn commit_txn(temp: &TempDir, txn: Transaction) {
        txn.commit().unwrap();
        let _ = temp;
    }

    fn new_txn(temp: &TempDir) -> Transaction {
        Transaction::new_for_tests(temp.path().to_path_buf())
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (store, temp) = test_store();
        let mut txn = new_txn(&temp);
        let id = store
            .put(&mut txn, "a.txt", b"hello world\n", None, None, None)
            .unwrap();
        commit_txn(&temp, txn);
        store.reload().unwrap();

        assert!(store.exists(&id));
        assert_eq!(store.get(&id).unwrap(), b"hello world\n");
    }

    #[test]
    fn test_put_is_idempotent() {
        let (store, temp) = test_store();
        let mut txn = new_txn(&temp);
        let id1 = store
            .put(&mut txn, "a.txt", b"content", None, None, None)
            .unwrap();
        let id2 = store
            .put(&mut txn, "a.txt", b"content", None, None, None)
            .unwrap();
        assert_eq!(id1, id2);
        commit_txn(&temp, txn);
    }

    #[test]
    fn test_delta_chain_reconstruction() {
        let (store, temp) = test_store();
        let mut content = b"line 1\nline 2\nline 3\n".to_vec();
        let mut parent: Option<RevisionId> = None;
        let mut ids = Vec::new();
        for i in 0..10 {
            let mut txn = new_txn(&temp);
            content.extend_from_slice(format!("appended {}\n", i).as_bytes());
            let id = store
                .put(&mut txn, "a.txt", &content, parent.as_ref(), None, None)
                .unwrap();
            commit_txn(&temp, txn);
            store.reload().unwrap();
            ids.push((id.clone(), content.clone()));
            parent = Some(id);
        }
        for (id, expected) in &ids {
            assert_eq!(&store.get(id).unwrap(), expected);
        }
    }

    #[test]
    fn test_corruption_detected() {
        let (store, temp) = test_store();
        let mut txn = new_txn(&temp);
        let id = store
            .put(&mut txn, "a.txt", b"original", None, None, None)
            .unwrap();
        commit_txn(&temp, txn);
        store.reload().unwrap();

        // Overwrite the record with a record claiming the same id but
        // different content.
        let encoded = encode_path("a.txt");
        let victim = temp.path().join("store/data").join(&encoded).join(&id);
        let record = RevisionRecord {
            id: id.clone(),
            path: "a.txt".to_string(),
            parent1: None,
            parent2: None,
            copy_from: None,
            chain_len: 0,
            uncompressed_len: 8,
            payload: RevisionPayload::Snapshot {
                data: lz4_flex::compress_prepend_size(b"tampered"),
            },
        };
        let bytes = bincode::serde::encode_to_vec(&record, bincode::config::standard()).unwrap();
        fs::write(&victim, bytes).unwrap();

        match store.get(&id) {
            Err(ArgentError::HashMismatch { .. }) => {}
            other => panic!("expected hash mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_reserved_path_encoding() {
        assert_eq!(encode_path("aux"), "au~78");
        assert_eq!(encode_path("src/con.txt"), "src/co~6e.txt");
        assert_eq!(encode_path("dir/nul/file"), "dir/nu~6c/file");
        assert_eq!(encode_path("normal/path.rs"), "normal/path.rs");
        assert_eq!(encode_path("trailing."), "trailing~2e");
        assert_eq!(encode_path("com1"), "co~6d1");
        // com0 is not reserved
        assert_eq!(encode_path("com0"), "com0");
    }

    #[test]
    fn test_long_path_hashed() {
        let long = format!("{}/file.txt", "d".repeat(200));
        let encoded = encode_path(&long);
        assert!(encoded.starts_with("dh/"));
        assert!(encoded.len() <= MAX_ENCODED_PATH);
        assert!(encoded.ends_with("file.txt"));
    }

    #[test]
    fn test_fncache_rebuild_after_loss() {
        let (store, temp) = test_store();
        let mut txn = new_txn(&temp);
        store
            .put(&mut txn, "a.txt", b"a", None, None, None)
            .unwrap();
        store
            .put(&mut txn, "dir/b.txt", b"b", None, None, None)
            .unwrap();
        commit_txn(&temp, txn);
        store.reload().unwrap();

        // Lose the fncache; the store must remain openable and rebuildable.
        fs::remove_file(temp.path().join("store/fncache")).unwrap();
        let reopened = ContentStore::open(temp.path().join("store")).unwrap();
        let mut txn = new_txn(&temp);
        let count = reopened.rebuild_fncache(&mut txn).unwrap();
        assert_eq!(count, 2);
        commit_txn(&temp, txn);
        let text = fs::read_to_string(temp.path().join("store/fncache")).unwrap();
        assert!(text.contains("a.txt"));
        assert!(text.contains("dir/b.txt"));
    }

    #[test]
    fn test_manifest_roundtrip() {
        let (store, temp) = test_store();
        let mut manifest = Manifest::new();
        manifest.insert("a.txt", "r1".to_string(), crate::types::FileFlag::Regular);
        let mut txn = new_txn(&temp);
        let id = store.put_manifest(&mut txn, &manifest).unwrap();
        commit_txn(&temp, txn);
        store.manifest_cache.clear();
        assert_eq!(store.get_manifest(&id).unwrap(), manifest);
    }

    #[test]
    fn test_splice_delta() {
        let (start, end, rep) = splice_delta(b"abcdef", b"abXYef");
        assert_eq!((start, end), (2, 4));
        assert_eq!(rep, b"XY");

        let (start, end, rep) = splice_delta(b"same", b"same");
        assert_eq!((start, end), (4, 4));
        assert!(rep.is_empty());
    }
}
