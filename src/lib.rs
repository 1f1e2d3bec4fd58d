//! # Argent
//!
//! A transactional, content-addressed version control engine for local
//! repositories: changeset history as a DAG with one or two parents per
//! node, named branches and bookmarks, three-way merging with conflict
//! detection, backout, and single-level rollback.
//!
//! ## Architecture
//!
//! - [`store`]: content-addressed file revision storage with delta
//!   chains, lz4 compression, and filesystem-safe path encoding
//! - [`graph`]: the append-only changeset DAG, phases, and obsolescence
//!   markers
//! - [`dirstate`]: working copy tracking and status detection
//! - [`transaction`]: buffered writes, journaling, rollback, and locking
//! - [`merge`]: three-way classification, diff3 content merge, merge
//!   tools, and persistent merge state
//! - [`resolve`]: revision specifiers, prefixes, and a minimal revset
//!   grammar
//! - [`sync`]: peer discovery, pull, and push
//! - [`hooks`]: veto and notification callbacks around operations
//! - [`verify`]: integrity walking with per-entry error accumulation
//! - [`repo`]: the [`Repository`](repo::Repository) handle tying it all
//!   together
//!
//! ## Example
//!
//! ```no_run
//! use argent::repo::Repository;
//! use argent::types::CommitOptions;
//! use std::path::Path;
//!
//! # fn main() -> argent::error::Result<()> {
//! let mut repo = Repository::init(Path::new("/tmp/project"))?;
//! std::fs::write("/tmp/project/readme.txt", "hello")?;
//! repo.add(&["readme.txt".to_string()])?;
//! let id = repo.commit(&CommitOptions::new("initial import", "alice"))?;
//! println!("committed {}", &id[..12]);
//! # Ok(())
//! # }
//! ```

pub mod dirstate;
pub mod error;
pub mod graph;
pub mod hooks;
pub mod merge;
pub mod repo;
pub mod resolve;
pub mod store;
pub mod sync;
pub mod transaction;
pub mod types;
pub mod verify;

pub use error::{ArgentError, Result};
pub use repo::Repository;
pub use types::{Changeset, ChangesetId, CommitOptions, Manifest, Phase};
