//! End-to-end repository scenarios
//!
//! Each test drives the public `Repository` API the way the command
//! line would: init, track, commit, branch, merge, resolve, back out,
//! roll back, and synchronize between two repositories on disk.

use argent::hooks::HookPoint;
use argent::merge::ResolutionState;
use argent::sync::LocalPeer;
use argent::types::{BackoutOptions, CommitOptions, Phase};
use argent::{ArgentError, Repository};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

struct Fixture {
    temp: TempDir,
    repo: Repository,
}

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let repo = Repository::init(temp.path()).unwrap();
        Self { temp, repo }
    }

    fn path(&self) -> &Path {
        self.temp.path()
    }

    fn write(&self, rel: &str, content: &str) {
        let path = self.temp.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.temp.path().join(rel)).unwrap()
    }

    fn add(&mut self, rel: &str) {
        self.repo.add(&[rel.to_string()]).unwrap();
    }

    fn commit(&mut self, message: &str) -> String {
        self.repo
            .commit(&CommitOptions::new(message, "test"))
            .unwrap()
    }
}

#[test]
fn test_commit_status_lifecycle() {
    let mut fx = Fixture::new();
    fx.write("a.txt", "alpha\n");
    fx.write("b.txt", "beta\n");

    let status = fx.repo.status(false, false).unwrap();
    assert_eq!(status.unknown, vec!["a.txt", "b.txt"]);

    fx.add("a.txt");
    fx.add("b.txt");
    let first = fx.commit("initial");

    let status = fx.repo.status(false, false).unwrap();
    assert!(status.is_clean());
    assert_eq!(fx.repo.working_parents().0, first);

    fx.write("a.txt", "alpha two\n");
    let status = fx.repo.status(false, false).unwrap();
    assert_eq!(status.modified, vec!["a.txt"]);

    let second = fx.commit("edit a");
    assert_ne!(first, second);
    assert_eq!(fx.repo.log().len(), 2);
    assert!(fx.repo.graph().is_ancestor(&first, &second));
}

#[test]
fn test_removal_is_committed() {
    let mut fx = Fixture::new();
    fx.write("doomed.txt", "x\n");
    fx.add("doomed.txt");
    let first = fx.commit("add");

    fx.repo.remove(&["doomed.txt".to_string()]).unwrap();
    let status = fx.repo.status(false, false).unwrap();
    assert_eq!(status.removed, vec!["doomed.txt"]);

    let second = fx.commit("remove");
    assert!(!fx.path().join("doomed.txt").exists());
    let manifest_id = &fx.repo.graph().get(&second).unwrap().manifest_id;
    let manifest = fx.repo.store().get_manifest(manifest_id).unwrap();
    assert!(!manifest.contains("doomed.txt"));
    let old = &fx.repo.graph().get(&first).unwrap().manifest_id;
    assert!(fx.repo.store().get_manifest(old).unwrap().contains("doomed.txt"));
}

#[test]
fn test_update_moves_working_copy() {
    let mut fx = Fixture::new();
    fx.write("f.txt", "one\n");
    fx.add("f.txt");
    let first = fx.commit("one");
    fx.write("f.txt", "two\n");
    let second = fx.commit("two");

    let stats = fx.repo.update(&first, false).unwrap();
    assert_eq!(stats.updated, 1);
    assert_eq!(fx.read("f.txt"), "one\n");
    assert_eq!(fx.repo.working_parents().0, first);

    fx.repo.update(&second, false).unwrap();
    assert_eq!(fx.read("f.txt"), "two\n");

    // Dirty working copy refuses a plain update but yields to -C.
    fx.write("f.txt", "dirty\n");
    assert!(fx.repo.update(&first, false).is_err());
    fx.repo.update(&first, true).unwrap();
    assert_eq!(fx.read("f.txt"), "one\n");
}

#[test]
fn test_update_by_prefix() {
    let mut fx = Fixture::new();
    fx.write("f.txt", "one\n");
    fx.add("f.txt");
    let first = fx.commit("one");
    fx.write("f.txt", "two\n");
    fx.commit("two");

    fx.repo.update(&first[..12], false).unwrap();
    assert_eq!(fx.repo.working_parents().0, first);
}

#[test]
fn test_clean_merge() {
    let mut fx = Fixture::new();
    fx.write("base.txt", "base\n");
    fx.add("base.txt");
    let root = fx.commit("root");

    fx.write("left.txt", "left\n");
    fx.add("left.txt");
    let left = fx.commit("left");

    fx.repo.update(&root, false).unwrap();
    fx.write("right.txt", "right\n");
    fx.add("right.txt");
    let right = fx.commit("right");

    let stats = fx.repo.merge(&left).unwrap();
    assert_eq!(stats.unresolved, 0);
    assert_eq!(fx.read("left.txt"), "left\n");
    assert_eq!(fx.read("right.txt"), "right\n");

    let merged = fx
        .repo
        .merge_continue(&CommitOptions::new("merge", "test"))
        .unwrap();
    let changeset = fx.repo.graph().get(&merged).unwrap().clone();
    assert!(changeset.is_merge());
    assert_eq!(changeset.parent1, right);
    assert_eq!(changeset.parent2.as_deref(), Some(left.as_str()));
    assert!(!fx.repo.merge_in_progress().unwrap());
    assert_eq!(fx.repo.heads(None).unwrap(), vec![merged]);
}

#[test]
fn test_conflicting_merge_resolve_flow() {
    let mut fx = Fixture::new();
    fx.write("f.txt", "start\nmiddle\nend\n");
    fx.add("f.txt");
    let root = fx.commit("root");

    fx.write("f.txt", "start\nleft change\nend\n");
    let left = fx.commit("left");

    fx.repo.update(&root, false).unwrap();
    fx.write("f.txt", "start\nright change\nend\n");
    fx.commit("right");

    let stats = fx.repo.merge(&left).unwrap();
    assert_eq!(stats.unresolved, 1);
    assert!(fx.repo.merge_in_progress().unwrap());

    let content = fx.read("f.txt");
    assert!(content.contains("<<<<<<< local"));
    assert!(content.contains("||||||| base"));
    assert!(content.contains(">>>>>>> other"));

    // Committing with unresolved conflicts is refused.
    let err = fx
        .repo
        .commit(&CommitOptions::new("too early", "test"))
        .unwrap_err();
    assert!(matches!(err, ArgentError::UnresolvedConflicts));
    assert_eq!(err.exit_code(), 1);

    let listed = fx.repo.resolve_list().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].0, "f.txt");
    assert_eq!(listed[0].1, ResolutionState::Unresolved);

    fx.write("f.txt", "start\nreconciled\nend\n");
    fx.repo.resolve_mark("f.txt", true).unwrap();
    let merged = fx
        .repo
        .merge_continue(&CommitOptions::new("merged", "test"))
        .unwrap();
    assert!(fx.repo.graph().get(&merged).unwrap().is_merge());
    assert!(!fx.repo.merge_in_progress().unwrap());
}

#[test]
fn test_merge_abort_restores_first_parent() {
    let mut fx = Fixture::new();
    fx.write("f.txt", "start\n");
    fx.add("f.txt");
    let root = fx.commit("root");
    fx.write("f.txt", "left\n");
    let left = fx.commit("left");
    fx.repo.update(&root, false).unwrap();
    fx.write("f.txt", "right\n");
    let right = fx.commit("right");

    let stats = fx.repo.merge(&left).unwrap();
    assert!(stats.unresolved > 0);

    fx.repo.merge_abort().unwrap();
    assert!(!fx.repo.merge_in_progress().unwrap());
    assert_eq!(fx.read("f.txt"), "right\n");
    assert_eq!(fx.repo.working_parents(), (right, None));
}

#[test]
fn test_merge_preconditions() {
    let mut fx = Fixture::new();
    fx.write("f.txt", "one\n");
    fx.add("f.txt");
    let first = fx.commit("one");
    fx.write("f.txt", "two\n");
    fx.commit("two");

    // Merging with an ancestor is meaningless.
    assert!(fx.repo.merge(&first).is_err());

    // A dirty working copy refuses to merge.
    fx.write("f.txt", "dirty\n");
    assert!(fx.repo.merge(&first).is_err());
}

#[test]
fn test_backout_linear() {
    let mut fx = Fixture::new();
    fx.write("f.txt", "one\n");
    fx.add("f.txt");
    fx.commit("one");
    fx.write("f.txt", "two\n");
    let bad = fx.commit("two");
    fx.write("g.txt", "unrelated\n");
    fx.add("g.txt");
    fx.commit("three");

    let options = BackoutOptions::default();
    let backout = fx.repo.backout(&bad, &options).unwrap().unwrap();

    // The bad change is reverted; the unrelated later change survives.
    assert_eq!(fx.read("f.txt"), "one\n");
    assert_eq!(fx.read("g.txt"), "unrelated\n");
    let changeset = fx.repo.graph().get(&backout).unwrap();
    assert_eq!(changeset.extra.get("backout_source"), Some(&bad));

    // Backing the same changeset out again changes nothing.
    let err = fx.repo.backout(&bad, &options).unwrap_err();
    assert!(matches!(err, ArgentError::NothingChanged));
}

#[test]
fn test_backout_recreates_removed_file() {
    let mut fx = Fixture::new();
    fx.write("keep.txt", "k\n");
    fx.write("victim.txt", "v\n");
    fx.add("keep.txt");
    fx.add("victim.txt");
    fx.commit("both");

    fx.repo.remove(&["victim.txt".to_string()]).unwrap();
    let removal = fx.commit("drop victim");
    assert!(!fx.path().join("victim.txt").exists());

    fx.repo.backout(&removal, &BackoutOptions::default()).unwrap();
    assert_eq!(fx.read("victim.txt"), "v\n");
    assert!(fx.repo.status(false, false).unwrap().is_clean());
}

#[test]
fn test_backout_no_commit() {
    let mut fx = Fixture::new();
    fx.write("f.txt", "one\n");
    fx.add("f.txt");
    fx.commit("one");
    fx.write("f.txt", "two\n");
    let bad = fx.commit("two");

    let options = BackoutOptions {
        no_commit: true,
        ..Default::default()
    };
    assert_eq!(fx.repo.backout(&bad, &options).unwrap(), None);
    assert_eq!(fx.read("f.txt"), "one\n");
    // The reversal is left as pending working-copy changes.
    assert!(!fx.repo.status(false, false).unwrap().is_clean());
}

#[test]
fn test_backout_merge_flow() {
    let mut fx = Fixture::new();
    fx.write("f.txt", "one\n");
    fx.add("f.txt");
    fx.commit("one");
    fx.write("f.txt", "two\n");
    let bad = fx.commit("two");
    fx.write("g.txt", "unrelated\n");
    fx.add("g.txt");
    let head = fx.commit("three");

    let options = BackoutOptions {
        merge: true,
        ..Default::default()
    };
    let backed = fx.repo.backout(&bad, &options).unwrap().unwrap();

    // The reversal landed as a child of the backed-out changeset, and
    // the working copy is an uncommitted merge of it with the old head.
    let changeset = fx.repo.graph().get(&backed).unwrap();
    assert_eq!(changeset.parent1, bad);
    assert_eq!(changeset.extra.get("backout_source"), Some(&bad));
    let (p1, p2) = fx.repo.working_parents();
    assert_eq!(p1, head);
    assert_eq!(p2.as_deref(), Some(backed.as_str()));

    // Committing the merge restores the pre-change content; the
    // unrelated later work survives.
    let merged = fx
        .repo
        .merge_continue(&CommitOptions::new("merge backout", "test"))
        .unwrap();
    assert_eq!(fx.read("f.txt"), "one\n");
    assert_eq!(fx.read("g.txt"), "unrelated\n");
    assert!(fx.repo.graph().get(&merged).unwrap().is_merge());
    assert_eq!(fx.repo.heads(None).unwrap(), vec![merged]);
}

#[test]
fn test_backout_merge_of_tip_stays_linear() {
    let mut fx = Fixture::new();
    fx.write("f.txt", "one\n");
    fx.add("f.txt");
    fx.commit("one");
    fx.write("f.txt", "two\n");
    let bad = fx.commit("two");

    let options = BackoutOptions {
        merge: true,
        ..Default::default()
    };
    let backed = fx.repo.backout(&bad, &options).unwrap().unwrap();

    // There is no concurrent head to merge with; the reversal sits on
    // top and the working copy is single-parented on it.
    assert_eq!(fx.repo.working_parents(), (backed.clone(), None));
    assert_eq!(fx.read("f.txt"), "one\n");
    assert!(fx.repo.status(false, false).unwrap().is_clean());
}

#[test]
fn test_backout_preconditions() {
    let mut fx = Fixture::new();
    fx.write("base.txt", "base\n");
    fx.add("base.txt");
    let root = fx.commit("root");
    fx.write("left.txt", "l\n");
    fx.add("left.txt");
    let left = fx.commit("left");
    fx.repo.update(&root, false).unwrap();
    fx.write("right.txt", "r\n");
    fx.add("right.txt");
    fx.commit("right");
    fx.repo.merge(&left).unwrap();
    let merged = fx
        .repo
        .merge_continue(&CommitOptions::new("merge", "test"))
        .unwrap();

    // A merge changeset needs an explicit parent.
    let err = fx.repo.backout(&merged, &BackoutOptions::default()).unwrap_err();
    assert!(matches!(err, ArgentError::AmbiguousParent));

    // The supplied parent must be a real parent of the target.
    let options = BackoutOptions {
        parent: Some("ffffffffffff".to_string()),
        ..Default::default()
    };
    let err = fx.repo.backout(&merged, &options).unwrap_err();
    assert!(matches!(err, ArgentError::InvalidParent { .. }));

    // --merge and --no-commit exclude each other.
    let options = BackoutOptions {
        merge: true,
        no_commit: true,
        ..Default::default()
    };
    let err = fx.repo.backout(&merged, &options).unwrap_err();
    assert!(matches!(err, ArgentError::IncompatibleOptions { .. }));

    // A changeset outside the working copy's ancestry cannot be backed
    // out: move to a side branch and target the other one.
    fx.repo.update(&root, false).unwrap();
    fx.write("side.txt", "s\n");
    fx.add("side.txt");
    fx.commit("side");
    let err = fx.repo.backout(&left, &BackoutOptions::default()).unwrap_err();
    assert!(matches!(err, ArgentError::NotAnAncestor));
}

#[test]
fn test_rollback_undoes_last_commit() {
    let mut fx = Fixture::new();
    fx.write("f.txt", "one\n");
    fx.add("f.txt");
    let first = fx.commit("one");
    fx.write("f.txt", "two\n");
    let second = fx.commit("two");
    assert_eq!(fx.repo.heads(None).unwrap(), vec![second]);

    let operation = fx.repo.rollback().unwrap();
    assert_eq!(operation, "commit");
    assert_eq!(fx.repo.heads(None).unwrap(), vec![first.clone()]);
    assert_eq!(fx.repo.working_parents().0, first);
    // The working copy file is untouched; it now shows as modified.
    assert_eq!(fx.read("f.txt"), "two\n");
    assert_eq!(fx.repo.status(false, false).unwrap().modified, vec!["f.txt"]);

    // Only one level of undo exists.
    let err = fx.repo.rollback().unwrap_err();
    assert!(matches!(err, ArgentError::NoRollbackAvailable));
    assert_eq!(err.exit_code(), 1);
}

#[test]
fn test_pull_clone_and_convergence() {
    let mut src = Fixture::new();
    src.write("a.txt", "alpha\n");
    src.add("a.txt");
    let first = src.commit("one");
    src.write("a.txt", "beta\n");
    let second = src.commit("two");

    let dst_temp = TempDir::new().unwrap();
    let mut dst = Repository::init(dst_temp.path()).unwrap();
    let peer = LocalPeer::open(src.path().to_path_buf()).unwrap();

    let report = dst.pull(&peer, None).unwrap();
    assert_eq!(report.added, 2);
    assert!(dst.graph().contains(&first));
    assert!(dst.graph().contains(&second));

    // Pulling again finds nothing: the exchange converged.
    let err = dst.pull(&peer, None).unwrap_err();
    assert!(matches!(err, ArgentError::NoChangesFound));
    assert_eq!(err.exit_code(), 1);

    // Unknown revision sources degrade to a warning, not a failure.
    let bogus = ["f".repeat(64)];
    let report = dst.pull(&peer, Some(&bogus)).unwrap();
    assert_eq!(report.added, 0);
    assert_eq!(report.warnings.len(), 1);
}

#[test]
fn test_bounded_pull_is_resumable() {
    let mut src = Fixture::new();
    src.write("a.txt", "1\n");
    src.add("a.txt");
    let first = src.commit("one");
    src.write("a.txt", "2\n");
    let second = src.commit("two");

    let dst_temp = TempDir::new().unwrap();
    let mut dst = Repository::init(dst_temp.path()).unwrap();
    let peer = LocalPeer::open(src.path().to_path_buf()).unwrap();

    // First bounded pull brings the requested revision and its ancestry.
    let bound = [first.clone()];
    let report = dst.pull(&peer, Some(&bound)).unwrap();
    assert_eq!(report.added, 1);

    // Re-running with a wider bound transfers only what is missing.
    let bound = [second.clone()];
    let report = dst.pull(&peer, Some(&bound)).unwrap();
    assert_eq!(report.added, 1);
    assert!(dst.graph().contains(&first));
    assert!(dst.graph().contains(&second));
}

#[test]
fn test_push_and_publishing() {
    let mut src = Fixture::new();
    src.write("a.txt", "alpha\n");
    src.add("a.txt");
    let first = src.commit("one");

    let dst_temp = TempDir::new().unwrap();
    Repository::init(dst_temp.path()).unwrap();
    let mut peer = LocalPeer::open(dst_temp.path().to_path_buf()).unwrap();

    assert_eq!(src.repo.push(&mut peer, false).unwrap(), 1);
    let dst = Repository::open(dst_temp.path()).unwrap();
    assert!(dst.graph().contains(&first));

    // What was pushed is published locally.
    assert_eq!(src.repo.phase(&first).unwrap(), Phase::Public);

    // Nothing further to push.
    let mut peer = LocalPeer::open(dst_temp.path().to_path_buf()).unwrap();
    let err = src.repo.push(&mut peer, false).unwrap_err();
    assert!(matches!(err, ArgentError::NoChangesFound));
}

#[test]
fn test_pull_preserves_public_phase() {
    let mut src = Fixture::new();
    src.write("a.txt", "alpha\n");
    src.add("a.txt");
    let first = src.commit("one");
    src.repo.set_phase(&first, Phase::Public, false).unwrap();

    let dst_temp = TempDir::new().unwrap();
    let mut dst = Repository::init(dst_temp.path()).unwrap();
    let peer = LocalPeer::open(src.path().to_path_buf()).unwrap();
    dst.pull(&peer, None).unwrap();
    assert_eq!(dst.phase(&first).unwrap(), Phase::Public);
}

#[test]
fn test_secret_changesets_stay_home() {
    let mut src = Fixture::new();
    src.write("a.txt", "alpha\n");
    src.add("a.txt");
    let public = src.commit("shareable");
    src.write("a.txt", "wip\n");
    let secret = src.commit("work in progress");
    src.repo.set_phase(&secret, Phase::Secret, false).unwrap();

    let dst_temp = TempDir::new().unwrap();
    let mut dst = Repository::init(dst_temp.path()).unwrap();
    let peer = LocalPeer::open(src.path().to_path_buf()).unwrap();
    let report = dst.pull(&peer, None).unwrap();
    assert_eq!(report.added, 1);
    assert!(dst.graph().contains(&public));
    assert!(!dst.graph().contains(&secret));
}

#[test]
fn test_push_new_head_rejected_unless_forced() {
    let mut src = Fixture::new();
    src.write("a.txt", "base\n");
    src.add("a.txt");
    let root = src.commit("root");

    // Clone, then let both sides diverge from the root.
    let dst_temp = TempDir::new().unwrap();
    let mut dst = Repository::init(dst_temp.path()).unwrap();
    let peer = LocalPeer::open(src.path().to_path_buf()).unwrap();
    dst.pull(&peer, None).unwrap();
    dst.update(&root, false).unwrap();
    fs::write(dst_temp.path().join("a.txt"), "theirs\n").unwrap();
    dst.commit(&CommitOptions::new("their change", "them"))
        .unwrap();

    src.write("a.txt", "ours\n");
    src.commit("our change");

    let mut peer = LocalPeer::open(dst_temp.path().to_path_buf()).unwrap();
    let err = src.repo.push(&mut peer, false).unwrap_err();
    assert!(matches!(err, ArgentError::MultipleHeadsRejected(_)));

    let mut peer = LocalPeer::open(dst_temp.path().to_path_buf()).unwrap();
    src.repo.push(&mut peer, true).unwrap();
    let dst = Repository::open(dst_temp.path()).unwrap();
    assert_eq!(dst.heads(None).unwrap().len(), 2);
}

#[test]
fn test_verify_detects_tampering() {
    let mut fx = Fixture::new();
    fx.write("a.txt", "some content worth checking\n");
    fx.add("a.txt");
    fx.commit("one");

    let mut report = fx.repo.verify(false).unwrap();
    assert!(report.is_clean());
    assert_eq!(report.changesets, 1);

    // Corrupt every stored revision under one data directory.
    let data_dir = fx.path().join(".argent/store/data");
    let mut tampered = 0;
    for entry in walk(&data_dir) {
        fs::write(&entry, b"garbage").unwrap();
        tampered += 1;
    }
    assert!(tampered > 0);

    let mut repo = Repository::open(fx.path()).unwrap();
    report = repo.verify(false).unwrap();
    assert!(!report.is_clean());
    // The walk continued and still counted everything.
    assert_eq!(report.changesets, 1);
}

fn walk(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut files = Vec::new();
    let mut dirs = vec![dir.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                dirs.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files
}

#[test]
fn test_precommit_hook_vetoes() {
    let mut fx = Fixture::new();
    fx.write("a.txt", "x\n");
    fx.add("a.txt");
    fx.repo
        .hooks_mut()
        .register(HookPoint::PreCommit, "deny", |_| Err("not today".to_string()));

    let err = fx
        .repo
        .commit(&CommitOptions::new("blocked", "test"))
        .unwrap_err();
    assert!(matches!(err, ArgentError::HookAborted { .. }));
    assert_eq!(err.exit_code(), 255);
    assert!(fx.repo.log().is_empty());
}

#[test]
fn test_bookmark_follows_commits() {
    let mut fx = Fixture::new();
    fx.write("a.txt", "1\n");
    fx.add("a.txt");
    let first = fx.commit("one");

    fx.repo.bookmark_set("feature", None).unwrap();
    let marks = fx.repo.bookmarks();
    assert_eq!(marks, vec![("feature".to_string(), first, true)]);

    fx.write("a.txt", "2\n");
    let second = fx.commit("two");
    let marks = fx.repo.bookmarks();
    assert_eq!(marks, vec![("feature".to_string(), second, true)]);

    fx.repo.bookmark_delete("feature").unwrap();
    assert!(fx.repo.bookmarks().is_empty());
}

#[test]
fn test_named_branches() {
    let mut fx = Fixture::new();
    fx.write("a.txt", "1\n");
    fx.add("a.txt");
    let first = fx.commit("one");
    assert_eq!(fx.repo.graph().get(&first).unwrap().branch, "default");

    fx.repo.set_branch("feature").unwrap();
    fx.write("a.txt", "2\n");
    let second = fx.commit("two");
    assert_eq!(fx.repo.graph().get(&second).unwrap().branch, "feature");

    assert_eq!(fx.repo.heads(Some("feature")).unwrap(), vec![second.clone()]);
    assert_eq!(fx.repo.resolve("feature").unwrap(), second);
    // The default branch head is shadowed by its feature child only
    // within its own branch filter.
    assert_eq!(fx.repo.heads(Some("default")).unwrap(), vec![first]);
}

#[test]
fn test_copy_tracking_survives_commit() {
    let mut fx = Fixture::new();
    fx.write("orig.txt", "payload\n");
    fx.add("orig.txt");
    fx.commit("one");

    fx.write("copy.txt", "payload\n");
    fx.repo.copy("orig.txt", "copy.txt").unwrap();
    let id = fx.commit("copied");

    let manifest_id = &fx.repo.graph().get(&id).unwrap().manifest_id;
    let manifest = fx.repo.store().get_manifest(manifest_id).unwrap();
    let entry = manifest.get("copy.txt").unwrap();
    let copy_info = fx.repo.store().copy_info(&entry.revision_id).unwrap();
    assert_eq!(copy_info.map(|(path, _)| path), Some("orig.txt".to_string()));
}

#[test]
fn test_binary_content_round_trip() {
    use rand::RngCore;

    let mut fx = Fixture::new();
    let mut first_data = vec![0u8; 4096];
    rand::rng().fill_bytes(&mut first_data);
    fs::write(fx.path().join("blob.bin"), &first_data).unwrap();
    fx.add("blob.bin");
    let first = fx.commit("binary one");

    let mut second_data = first_data.clone();
    rand::rng().fill_bytes(&mut second_data[1024..2048]);
    fs::write(fx.path().join("blob.bin"), &second_data).unwrap();
    fx.commit("binary two");

    fx.repo.update(&first, false).unwrap();
    assert_eq!(fs::read(fx.path().join("blob.bin")).unwrap(), first_data);
}

#[cfg(unix)]
#[test]
fn test_executable_flag_round_trip() {
    use std::os::unix::fs::PermissionsExt;

    let mut fx = Fixture::new();
    fx.write("run.sh", "#!/bin/sh\n");
    let script = fx.path().join("run.sh");
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    fx.add("run.sh");
    let first = fx.commit("script");

    fx.write("other.txt", "x\n");
    fx.add("other.txt");
    fx.commit("more");
    fx.repo.update(&first, true).unwrap();

    let mode = fs::metadata(&script).unwrap().permissions().mode();
    assert_ne!(mode & 0o100, 0, "exec bit survives update");
}
