//! Revision identifier resolution
//!
//! Turns user-supplied revision specifiers into changeset ids: full
//! 64-hex identifiers, unique hex prefixes (at least four characters),
//! symbolic names (bookmarks, tags, branches, `tip`, `null`, `.`), and a
//! minimal revset grammar for the operations that consume sets.
//!
//! The local index always takes precedence. A configured remote index is
//! consulted only when the local lookup finds nothing, and any remote
//! failure collapses into `UnknownRevision`: a broken remote must never
//! make local resolution worse than having no remote at all.

use crate::error::{ArgentError, Result};
use crate::graph::RevisionGraph;
use crate::types::{ChangesetId, NULL_ID};
use std::collections::BTreeMap;
use tracing::debug;

/// Minimum accepted hex-prefix length
pub const MIN_PREFIX_LEN: usize = 4;

/// A secondary identifier index, typically backed by a peer
pub trait RemoteIndex {
    /// Look up a hex prefix; `Err` carries a transport diagnostic
    fn lookup_prefix(&self, prefix: &str) -> std::result::Result<Option<ChangesetId>, String>;
}

/// Everything resolution needs to see, borrowed from the repository
pub struct ResolveContext<'a> {
    /// The changeset DAG
    pub graph: &'a RevisionGraph,
    /// Bookmark name to changeset
    pub bookmarks: &'a BTreeMap<String, ChangesetId>,
    /// Tag name to changeset
    pub tags: &'a BTreeMap<String, ChangesetId>,
    /// First parent of the working directory
    pub wdir_parent: &'a str,
    /// Optional remote index consulted after local misses
    pub remote: Option<&'a dyn RemoteIndex>,
}

impl<'a> ResolveContext<'a> {
    /// Resolve one specifier to a changeset id
    pub fn resolve(&self, spec: &str) -> Result<ChangesetId> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(ArgentError::UnknownRevision(spec.to_string()));
        }

        // The working directory is a synthetic revision: it resolves to
        // its first parent and is never persisted anywhere.
        if spec == "." || spec == "wdir()" {
            return Ok(self.wdir_parent.to_string());
        }
        if spec == "null" {
            return Ok(NULL_ID.to_string());
        }
        if spec == "tip" {
            return Ok(self
                .graph
                .tip()
                .map(|cs| cs.id.clone())
                .unwrap_or_else(|| NULL_ID.to_string()));
        }

        // Symbolic names, bookmarks first.
        if let Some(id) = self.bookmarks.get(spec) {
            return Ok(id.clone());
        }
        if let Some(id) = self.tags.get(spec) {
            return Ok(id.clone());
        }
        if let Some(id) = self.branch_tip(spec) {
            return Ok(id);
        }

        // Hexadecimal forms.
        if spec.len() == 64 && is_hex(spec) {
            if self.graph.contains(spec) {
                return Ok(spec.to_string());
            }
            return self.consult_remote(spec);
        }
        if spec.len() >= MIN_PREFIX_LEN && is_hex(spec) {
            return self.resolve_prefix(spec);
        }

        Err(ArgentError::UnknownRevision(spec.to_string()))
    }

    /// Tip-most head of a named branch, if the branch exists
    fn branch_tip(&self, name: &str) -> Option<ChangesetId> {
        let heads = self.graph.heads(Some(name));
        // heads() returns changelog order; the last entry is tip-most.
        heads.last().cloned()
    }

    fn resolve_prefix(&self, prefix: &str) -> Result<ChangesetId> {
        let mut matches = self
            .graph
            .all_ids()
            .iter()
            .filter(|id| id.starts_with(prefix));
        match (matches.next(), matches.next()) {
            (Some(id), None) => Ok(id.clone()),
            (Some(_), Some(_)) => Err(ArgentError::AmbiguousIdentifier(prefix.to_string())),
            (None, _) => self.consult_remote(prefix),
        }
    }

    fn consult_remote(&self, spec: &str) -> Result<ChangesetId> {
        if let Some(remote) = self.remote {
            match remote.lookup_prefix(spec) {
                Ok(Some(id)) => return Ok(id),
                Ok(None) => {}
                Err(err) => {
                    // A remote failure never produces a distinct error;
                    // the caller only learns the revision was not found.
                    debug!("remote lookup for {:?} failed: {}", spec, err);
                }
            }
        }
        Err(ArgentError::UnknownRevision(spec.to_string()))
    }

    /// Evaluate a revset expression to an ordered set of changesets
    ///
    /// Supported forms: `ancestors(x)`, `descendants(x)`, `parents(x)`,
    /// `heads()`, `x::y`, and any plain specifier (a one-element set).
    /// Results are in changelog order.
    pub fn revset(&self, expr: &str) -> Result<Vec<ChangesetId>> {
        let expr = expr.trim();

        if let Some(inner) = function_arg(expr, "ancestors") {
            let id = self.resolve(inner)?;
            return Ok(self.in_changelog_order(self.ancestor_set(&id)));
        }
        if let Some(inner) = function_arg(expr, "descendants") {
            let id = self.resolve(inner)?;
            return Ok(self.in_changelog_order(self.descendant_set(&id)));
        }
        if let Some(inner) = function_arg(expr, "parents") {
            let id = self.resolve(inner)?;
            let changeset = self.graph.get(&id)?;
            return Ok(changeset
                .parents()
                .into_iter()
                .filter(|p| !crate::types::is_null(p))
                .map(str::to_string)
                .collect());
        }
        if expr == "heads()" {
            return Ok(self.graph.heads(None));
        }
        if let Some((left, right)) = expr.split_once("::") {
            if left.is_empty() || right.is_empty() || right.contains("::") {
                return Err(ArgentError::InvalidRevset(expr.to_string()));
            }
            let from = self.resolve(left)?;
            let to = self.resolve(right)?;
            let ancestors = self.ancestor_set(&to);
            let descendants = self.descendant_set(&from);
            return Ok(self.in_changelog_order(
                ancestors.intersection(&descendants).cloned().collect(),
            ));
        }
        if expr.contains('(') || expr.contains(')') {
            return Err(ArgentError::InvalidRevset(expr.to_string()));
        }

        Ok(vec![self.resolve(expr)?])
    }

    fn ancestor_set(&self, id: &str) -> std::collections::HashSet<ChangesetId> {
        self.graph.ancestors(id).map(|cs| cs.id.clone()).collect()
    }

    fn descendant_set(&self, id: &str) -> std::collections::HashSet<ChangesetId> {
        let mut set = std::collections::HashSet::new();
        let mut queue = vec![id.to_string()];
        while let Some(current) = queue.pop() {
            if !set.insert(current.clone()) {
                continue;
            }
            queue.extend(self.graph.children_of(&current).iter().cloned());
        }
        set
    }

    fn in_changelog_order(
        &self,
        set: std::collections::HashSet<ChangesetId>,
    ) -> Vec<ChangesetId> {
        self.graph
            .all_ids()
            .iter()
            .filter(|id| set.contains(*id))
            .cloned()
            .collect()
    }
}

fn is_hex(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

fn function_arg<'a>(expr: &'a str, name: &str) -> Option<&'a str> {
    expr.strip_prefix(name)?
        .strip_prefix('(')?
        .strip_suffix(')')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionManager;
    use crate::types::Changeset;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct Fixture {
        graph: RevisionGraph,
        bookmarks: BTreeMap<String, ChangesetId>,
        tags: BTreeMap<String, ChangesetId>,
        wdir_parent: ChangesetId,
        _temp: TempDir,
    }

    impl Fixture {
        fn context(&self) -> ResolveContext<'_> {
            ResolveContext {
                graph: &self.graph,
                bookmarks: &self.bookmarks,
                tags: &self.tags,
                wdir_parent: &self.wdir_parent,
                remote: None,
            }
        }
    }

    fn commit(graph: &mut RevisionGraph, manager: &TransactionManager, p1: &str, msg: &str) -> ChangesetId {
        let date = chrono::FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2020, 1, 1, 0, 0, 0)
            .unwrap();
        let cs = Changeset::new(
            p1.to_string(),
            None,
            format!("manifest-{}", msg),
            "test".to_string(),
            date,
            "default".to_string(),
            msg.to_string(),
            BTreeMap::new(),
        );
        let mut txn = manager.begin("test").unwrap();
        let id = graph.commit(&mut txn, cs).unwrap();
        txn.commit().unwrap();
        id
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let manager = TransactionManager::new(temp.path().to_path_buf());
        let mut graph = RevisionGraph::init(temp.path().to_path_buf()).unwrap();
        let a = commit(&mut graph, &manager, NULL_ID, "a");
        let b = commit(&mut graph, &manager, &a, "b");
        let mut bookmarks = BTreeMap::new();
        bookmarks.insert("main".to_string(), b.clone());
        let mut tags = BTreeMap::new();
        tags.insert("v1.0".to_string(), a.clone());
        Fixture {
            graph,
            bookmarks,
            tags,
            wdir_parent: b,
            _temp: temp,
        }
    }

    #[test]
    fn test_full_and_symbolic_resolution() {
        let fx = fixture();
        let ctx = fx.context();
        let tip = fx.graph.tip().unwrap().id.clone();

        assert_eq!(ctx.resolve(&tip).unwrap(), tip);
        assert_eq!(ctx.resolve("tip").unwrap(), tip);
        assert_eq!(ctx.resolve("main").unwrap(), tip);
        assert_eq!(ctx.resolve(".").unwrap(), tip);
        assert_eq!(ctx.resolve("null").unwrap(), NULL_ID);
        assert_eq!(ctx.resolve("v1.0").unwrap(), fx.tags["v1.0"]);
        // Branch name resolves to its tip-most head.
        assert_eq!(ctx.resolve("default").unwrap(), tip);

        match ctx.resolve("doesnotexist") {
            Err(ArgentError::UnknownRevision(_)) => {}
            other => panic!("expected UnknownRevision, got {:?}", other),
        }
    }

    #[test]
    fn test_prefix_resolution() {
        let fx = fixture();
        let ctx = fx.context();
        let tip = fx.graph.tip().unwrap().id.clone();

        assert_eq!(ctx.resolve(&tip[..8]).unwrap(), tip);
        // Too-short hex prefixes are not accepted.
        match ctx.resolve(&tip[..3]) {
            Err(ArgentError::UnknownRevision(_)) => {}
            other => panic!("expected UnknownRevision, got {:?}", other),
        }
    }

    #[test]
    fn test_ambiguous_prefix() {
        let temp = TempDir::new().unwrap();
        let manager = TransactionManager::new(temp.path().to_path_buf());
        let mut graph = RevisionGraph::init(temp.path().to_path_buf()).unwrap();
        // Commit until two ids share a 1-char prefix, then probe with the
        // shortest legal prefix length against a crafted pair instead:
        // build ids directly since ambiguity needs controlled data.
        let a = commit(&mut graph, &manager, NULL_ID, "a");
        let mut spin = 0;
        let (x, y) = loop {
            let id = commit(&mut graph, &manager, &a, &format!("s{}", spin));
            spin += 1;
            if let Some(other) = graph
                .all_ids()
                .iter()
                .find(|o| **o != id && o[..1] == id[..1])
            {
                break (other.clone(), id);
            }
        };
        assert_eq!(x[..1], y[..1]);

        // A common prefix of length >= 4 may not exist between x and y,
        // so only assert the unique-match path plus the length gate.
        let bookmarks = BTreeMap::new();
        let tags = BTreeMap::new();
        let ctx = ResolveContext {
            graph: &graph,
            bookmarks: &bookmarks,
            tags: &tags,
            wdir_parent: &a,
            remote: None,
        };
        let unique = &y[..MIN_PREFIX_LEN.max(4)];
        match ctx.resolve(unique) {
            Ok(id) => assert!(id.starts_with(unique)),
            Err(ArgentError::AmbiguousIdentifier(p)) => assert_eq!(p, unique),
            other => panic!("unexpected result {:?}", other),
        }
    }

    struct FlakyRemote;
    impl RemoteIndex for FlakyRemote {
        fn lookup_prefix(&self, _: &str) -> std::result::Result<Option<ChangesetId>, String> {
            Err("connection reset".to_string())
        }
    }

    struct KnowingRemote(ChangesetId);
    impl RemoteIndex for KnowingRemote {
        fn lookup_prefix(&self, prefix: &str) -> std::result::Result<Option<ChangesetId>, String> {
            Ok(self.0.starts_with(prefix).then(|| self.0.clone()))
        }
    }

    #[test]
    fn test_remote_consulted_only_on_local_miss() {
        let fx = fixture();
        let tip = fx.graph.tip().unwrap().id.clone();
        let foreign = "f".repeat(64);

        let remote = KnowingRemote(foreign.clone());
        let ctx = ResolveContext {
            remote: Some(&remote),
            ..fx.context()
        };
        // Local hit: remote never needed.
        assert_eq!(ctx.resolve(&tip[..8]).unwrap(), tip);
        // Local miss: remote answers.
        assert_eq!(ctx.resolve(&foreign[..8]).unwrap(), foreign);

        // Remote errors collapse to UnknownRevision.
        let flaky = FlakyRemote;
        let ctx = ResolveContext {
            remote: Some(&flaky),
            ..fx.context()
        };
        match ctx.resolve(&foreign[..8]) {
            Err(ArgentError::UnknownRevision(_)) => {}
            other => panic!("expected UnknownRevision, got {:?}", other),
        }
    }

    #[test]
    fn test_revsets() {
        let fx = fixture();
        let ctx = fx.context();
        let a = ctx.resolve("v1.0").unwrap();
        let b = ctx.resolve("tip").unwrap();

        assert_eq!(ctx.revset("ancestors(tip)").unwrap(), vec![a.clone(), b.clone()]);
        assert_eq!(
            ctx.revset(&format!("descendants({})", &a[..8])).unwrap(),
            vec![a.clone(), b.clone()]
        );
        assert_eq!(ctx.revset("parents(tip)").unwrap(), vec![a.clone()]);
        assert_eq!(ctx.revset("heads()").unwrap(), vec![b.clone()]);
        assert_eq!(
            ctx.revset(&format!("{}::{}", &a[..8], "tip")).unwrap(),
            vec![a.clone(), b.clone()]
        );
        assert_eq!(ctx.revset("tip").unwrap(), vec![b]);

        match ctx.revset("nonsense(tip)") {
            Err(ArgentError::InvalidRevset(_)) => {}
            other => panic!("expected InvalidRevset, got {:?}", other),
        }
    }
}
