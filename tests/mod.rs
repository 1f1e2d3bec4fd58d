//! Main test module for Argent
//!
//! This module includes all test suites:
//! - Integration tests for end-to-end repository scenarios
//! - Property-based tests for invariants

pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use argent::types::CommitOptions;
    use argent::{ArgentError, Repository};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_empty_repository() {
        let temp = TempDir::new().unwrap();
        let repo = Repository::init(temp.path()).unwrap();

        let status = repo.status(false, false).unwrap();
        assert!(status.is_clean());
        assert!(repo.heads(None).unwrap().is_empty());
        assert!(repo.log().is_empty());
    }

    #[test]
    fn test_double_init_rejected() {
        let temp = TempDir::new().unwrap();
        Repository::init(temp.path()).unwrap();
        match Repository::init(temp.path()) {
            Err(ArgentError::RepositoryExists(_)) => {}
            other => panic!("expected RepositoryExists, got {:?}", other),
        }
    }

    #[test]
    fn test_open_outside_repository() {
        let temp = TempDir::new().unwrap();
        match Repository::open(temp.path()) {
            Err(ArgentError::RepositoryNotFound(_)) => {}
            other => panic!("expected RepositoryNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_open_from_subdirectory_walks_up() {
        let temp = TempDir::new().unwrap();
        Repository::init(temp.path()).unwrap();
        let nested = temp.path().join("a/b/c");
        fs::create_dir_all(&nested).unwrap();
        let repo = Repository::open(&nested).unwrap();
        assert_eq!(repo.root(), temp.path());
    }

    #[test]
    fn test_unknown_revision_aborts() {
        let temp = TempDir::new().unwrap();
        let repo = Repository::init(temp.path()).unwrap();
        match repo.resolve("nosuchrevision") {
            Err(ArgentError::UnknownRevision(_)) => {}
            other => panic!("expected UnknownRevision, got {:?}", other),
        }
    }

    #[test]
    fn test_add_missing_file_aborts() {
        let temp = TempDir::new().unwrap();
        let mut repo = Repository::init(temp.path()).unwrap();
        assert!(repo.add(&["ghost.txt".to_string()]).is_err());
    }

    #[test]
    fn test_empty_commit_is_soft_failure() {
        let temp = TempDir::new().unwrap();
        let mut repo = Repository::init(temp.path()).unwrap();
        let err = repo
            .commit(&CommitOptions::new("nothing", "test"))
            .unwrap_err();
        assert!(matches!(err, ArgentError::NothingChanged));
        assert_eq!(err.exit_code(), 1);
    }
}
