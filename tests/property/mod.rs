//! Property-based testing for Argent
//!
//! Uses proptest to verify invariants across randomly generated inputs:
//! three-way merge laws, storage path encoding, content addressing, and
//! delta-chain reconstruction.

use argent::merge::{merge_text, Premerge};
use argent::store::{encode_path, ContentStore};
use argent::transaction::Transaction;
use argent::types::{CommitOptions, RevisionId};
use argent::Repository;
use proptest::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Generate newline-terminated text: a small number of short lines
fn text_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec("[a-zA-Z0-9 ]{0,20}", 0..12).prop_map(|lines| {
        let mut out = Vec::new();
        for line in lines {
            out.extend_from_slice(line.as_bytes());
            out.push(b'\n');
        }
        out
    })
}

/// Generate repo-relative paths, including awkward components
fn path_strategy() -> impl Strategy<Value = String> {
    let component = prop_oneof![
        "[a-z]{1,10}",
        "[a-z]{1,6}\\.(txt|rs|md)",
        // Components that exercise the escaping rules
        Just("aux".to_string()),
        Just("con.txt".to_string()),
        Just("com1".to_string()),
        Just("ends.".to_string()),
        "[a-z]{40,80}",
    ];
    prop::collection::vec(component, 1..=4).prop_map(|parts| parts.join("/"))
}

/// Generate simple storable paths without encoding edge cases
fn plain_path_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z]{1,8}", 1..=3)
        .prop_map(|parts| format!("{}.txt", parts.join("/")))
}

proptest! {
    /// Merging two identical sides never conflicts, whatever the base was
    #[test]
    fn prop_merge_identical_sides_is_clean(
        base in text_strategy(),
        side in text_strategy(),
    ) {
        match merge_text(&base, &side, &side) {
            Premerge::Clean(content) => prop_assert_eq!(content, side),
            Premerge::Conflicted { .. } => {
                prop_assert!(false, "identical sides must merge cleanly");
            }
        }
    }

    /// When one side left the base untouched, the merge is the other side
    #[test]
    fn prop_merge_unchanged_side_yields_other(
        base in text_strategy(),
        other in text_strategy(),
    ) {
        match merge_text(&base, &base, &other) {
            Premerge::Clean(content) => prop_assert_eq!(content, other),
            Premerge::Conflicted { .. } => {
                prop_assert!(false, "an unchanged side must never conflict");
            }
        }
    }

    /// A conflicted merge always reports at least one conflict region and
    /// embeds markers for each of them
    #[test]
    fn prop_conflict_count_matches_markers(
        base in text_strategy(),
        local in text_strategy(),
        other in text_strategy(),
    ) {
        if let Premerge::Conflicted { content, conflicts } = merge_text(&base, &local, &other) {
            prop_assert!(conflicts > 0);
            let text = String::from_utf8_lossy(&content);
            prop_assert_eq!(text.matches("<<<<<<< local").count(), conflicts);
            prop_assert_eq!(text.matches(">>>>>>> other").count(), conflicts);
        }
    }

    /// Path encoding is deterministic and always filesystem-safe
    #[test]
    fn prop_encode_path_is_safe(path in path_strategy()) {
        let encoded = encode_path(&path);
        prop_assert_eq!(&encoded, &encode_path(&path));
        prop_assert!(!encoded.is_empty());
        // Either the hashed fallback, or a component-wise safe encoding.
        if let Some(rest) = encoded.strip_prefix("dh/") {
            prop_assert!(!rest.is_empty());
        } else {
            prop_assert!(encoded.len() <= 120);
            for component in encoded.split('/') {
                prop_assert!(!component.ends_with('.'));
                prop_assert!(!component.ends_with(' '));
                let base = component.split('.').next().unwrap_or(component);
                let lower = base.to_ascii_lowercase();
                prop_assert!(!matches!(lower.as_str(), "con" | "prn" | "aux" | "nul"));
            }
        }
    }

    /// Revision identifiers are pure functions of parents and content
    #[test]
    fn prop_revision_id_is_content_addressed(
        content in prop::collection::vec(any::<u8>(), 0..512),
        parent in "[0-9a-f]{64}",
    ) {
        let bare = ContentStore::revision_id(None, None, &content);
        prop_assert_eq!(&bare, &ContentStore::revision_id(None, None, &content));
        prop_assert_eq!(bare.len(), 64);

        // The same content under a parent is a different revision.
        let with_parent = ContentStore::revision_id(Some(&parent), None, &content);
        prop_assert_ne!(&bare, &with_parent);

        // Parent order matters for merges.
        let swapped = ContentStore::revision_id(None, Some(&parent), &content);
        prop_assert_ne!(&with_parent, &swapped);
    }

    /// Every revision in a delta chain reconstructs to exactly the bytes
    /// that were stored
    #[test]
    fn prop_delta_chain_round_trips(
        path in plain_path_strategy(),
        versions in prop::collection::vec(
            prop::collection::vec(any::<u8>(), 0..2000),
            1..8,
        ),
    ) {
        let temp = TempDir::new().unwrap();
        let store = ContentStore::init(temp.path().join("store")).unwrap();

        let mut parent: Option<RevisionId> = None;
        let mut stored = Vec::new();
        for content in &versions {
            let mut txn = Transaction::new_for_tests(temp.path().to_path_buf());
            let id = store
                .put(&mut txn, &path, content, parent.as_ref(), None, None)
                .unwrap();
            txn.commit().unwrap();
            stored.push((id.clone(), content.clone()));
            parent = Some(id);
        }

        store.reload().unwrap();
        for (id, content) in &stored {
            prop_assert_eq!(&store.get(id).unwrap(), content);
        }
    }
}

proptest! {
    // Each case builds a whole repository, so keep the count small.
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Any committed changeset resolves by its full id and by a 12-char
    /// prefix, regardless of history shape
    #[test]
    fn prop_prefix_resolution(
        contents in prop::collection::vec("[a-z]{1,30}", 1..5),
    ) {
        let temp = TempDir::new().unwrap();
        let mut repo = Repository::init(temp.path()).unwrap();
        fs::write(temp.path().join("f.txt"), "seed").unwrap();
        repo.add(&["f.txt".to_string()]).unwrap();

        let mut ids = Vec::new();
        for (n, content) in contents.iter().enumerate() {
            fs::write(temp.path().join("f.txt"), content).unwrap();
            match repo.commit(&CommitOptions::new(format!("rev {}", n), "prop")) {
                Ok(id) => ids.push(id),
                // Consecutive identical contents are a no-op commit.
                Err(err) => prop_assert_eq!(err.exit_code(), 1),
            }
        }

        for id in &ids {
            prop_assert_eq!(&repo.resolve(id).unwrap(), id);
            prop_assert_eq!(&repo.resolve(&id[..12]).unwrap(), id);
        }
        prop_assert_eq!(&repo.resolve("tip").unwrap(), ids.last().unwrap());
    }
}
