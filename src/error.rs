//! Error types for the Argent engine
//!
//! This module defines all error types that can occur during repository
//! operations. The taxonomy mirrors how errors surface to users: hard
//! aborts (precondition violations, exit code 255), soft failures
//! (recoverable conditions, exit code 1), corruption reports, and
//! concurrency errors.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the Argent library
pub type Result<T> = std::result::Result<T, ArgentError>;

/// Main error type for all repository operations
#[derive(Debug, Error)]
pub enum ArgentError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors during bincode serialization/deserialization
    #[error("Bincode error: {0}")]
    Bincode(String),

    /// Errors while walking the working copy
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    /// A revision specifier did not resolve to any known changeset
    #[error("abort: unknown revision '{0}'")]
    UnknownRevision(String),

    /// A partial identifier matched more than one changeset
    #[error("abort: ambiguous identifier '{0}' - supply a longer prefix")]
    AmbiguousIdentifier(String),

    /// Commit would produce a changeset identical to its parent
    #[error("nothing changed")]
    NothingChanged,

    /// Backout target is not an ancestor of the working directory
    #[error("abort: cannot backout change that is not an ancestor")]
    NotAnAncestor,

    /// Backout target is a merge and no parent was specified
    #[error("abort: cannot backout a merge changeset")]
    AmbiguousParent,

    /// A user-supplied parent is not actually a parent of the target
    #[error("abort: {parent} is not a parent of {node}")]
    InvalidParent {
        /// The supplied parent prefix
        parent: String,
        /// The target changeset
        node: String,
    },

    /// Mutually exclusive options were combined
    #[error("abort: cannot use {left} with {right}")]
    IncompatibleOptions {
        /// First option
        left: String,
        /// Conflicting option
        right: String,
    },

    /// A second transaction was opened while one is active
    #[error("abort: a transaction is already in progress")]
    ConcurrentTransaction,

    /// Rollback was requested but no undo journal exists
    #[error("no rollback information available")]
    NoRollbackAvailable,

    /// Lock acquisition timed out
    #[error("abort: timed out waiting for lock held by {holder}")]
    LockTimeout {
        /// Identity of the current lock holder (host:pid)
        holder: String,
    },

    /// Push would create a new head on the destination
    #[error("abort: push creates new remote head {0}")]
    MultipleHeadsRejected(String),

    /// Unresolved merge conflicts remain
    #[error("unresolved merge conflicts (see 'argent resolve')")]
    UnresolvedConflicts,

    /// Pull/push found nothing to transfer
    #[error("no changes found")]
    NoChangesFound,

    /// Revision not found in the content store
    #[error("revision not found: {0}")]
    RevisionNotFound(String),

    /// Changeset not found in the revision graph
    #[error("changeset not found: {0}")]
    ChangesetNotFound(String),

    /// Corruption detected while reading the store
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// Hash mismatch during verification
    #[error("hash mismatch - expected: {expected}, actual: {actual}")]
    HashMismatch {
        /// Expected hash value
        expected: String,
        /// Actual computed hash value
        actual: String,
    },

    /// Repository is not initialized at the given path
    #[error("abort: no repository found at {0:?}")]
    RepositoryNotFound(PathBuf),

    /// Repository already exists at the given path
    #[error("abort: repository already exists at {0:?}")]
    RepositoryExists(PathBuf),

    /// A pre-hook refused the operation
    #[error("abort: {hook} hook failed: {reason}")]
    HookAborted {
        /// Name of the hook point
        hook: String,
        /// Reason reported by the hook
        reason: String,
    },

    /// An external merge tool could not be run
    #[error("merge tool failed: {0}")]
    MergeToolFailed(String),

    /// Obsolescence marker chain ended without a successor
    #[error("changeset {0} is pruned (no successor)")]
    NoSuccessor(String),

    /// An interrupted operation must be continued or aborted first
    #[error("abort: outstanding uncommitted merge (use 'continue' or 'abort')")]
    InterruptedOperation,

    /// Invalid revset expression
    #[error("abort: syntax error in revset '{0}'")]
    InvalidRevset(String),

    /// Generic precondition failure with a stable user-facing message
    #[error("abort: {0}")]
    Abort(String),

    /// Generic error for unexpected conditions
    #[error("internal error: {0}")]
    Internal(String),
}

// Conversions for bincode 2.0 error types
impl From<bincode::error::DecodeError> for ArgentError {
    fn from(err: bincode::error::DecodeError) -> Self {
        ArgentError::Bincode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for ArgentError {
    fn from(err: bincode::error::EncodeError) -> Self {
        ArgentError::Bincode(err.to_string())
    }
}

impl ArgentError {
    /// Create an abort error with a stable user-facing message
    pub fn abort(msg: impl Into<String>) -> Self {
        ArgentError::Abort(msg.into())
    }

    /// Create a corruption error with a custom message
    pub fn corruption(msg: impl Into<String>) -> Self {
        ArgentError::Corruption(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        ArgentError::Internal(msg.into())
    }

    /// Check if this error is a hard abort (exit code 255)
    ///
    /// Hard aborts are user precondition violations: wrong arguments,
    /// ambiguous revisions, invalid parents, lock timeouts.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            ArgentError::UnknownRevision(_)
                | ArgentError::AmbiguousIdentifier(_)
                | ArgentError::NotAnAncestor
                | ArgentError::AmbiguousParent
                | ArgentError::InvalidParent { .. }
                | ArgentError::IncompatibleOptions { .. }
                | ArgentError::ConcurrentTransaction
                | ArgentError::LockTimeout { .. }
                | ArgentError::MultipleHeadsRejected(_)
                | ArgentError::RepositoryNotFound(_)
                | ArgentError::RepositoryExists(_)
                | ArgentError::HookAborted { .. }
                | ArgentError::InterruptedOperation
                | ArgentError::InvalidRevset(_)
                | ArgentError::Abort(_)
        )
    }

    /// Check if this error is a soft failure (exit code 1)
    ///
    /// Soft failures leave the repository in a usable state and are
    /// recoverable by a follow-up command.
    pub fn is_soft_failure(&self) -> bool {
        matches!(
            self,
            ArgentError::NothingChanged
                | ArgentError::NoRollbackAvailable
                | ArgentError::UnresolvedConflicts
                | ArgentError::NoChangesFound
        )
    }

    /// Check if this error indicates store corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            ArgentError::Corruption(_) | ArgentError::HashMismatch { .. }
        )
    }

    /// Map this error to the process exit code contract
    ///
    /// `0` is success (never produced here), `1` is a soft failure,
    /// `255` is a hard abort. Anything else (I/O, corruption) also
    /// surfaces as `255`.
    pub fn exit_code(&self) -> i32 {
        if self.is_soft_failure() {
            1
        } else {
            255
        }
    }
}
