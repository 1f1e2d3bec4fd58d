//! Hook points around repository operations
//!
//! Hooks are named callbacks attached to well-known points. Pre-hooks
//! run before the operation and can veto it; their failure aborts with
//! the hook's reason. Post hooks are advisory: a failing post hook is
//! logged and otherwise ignored, because by the time it runs the
//! operation has already happened.
//!
//! Every hook receives a string-keyed context describing the operation
//! (the affected node, the transfer source, old and new values for key
//! updates). Callers flush pending working-copy state to disk before
//! firing update hooks so an external observer sees what the hook is
//! being told about.

use crate::error::{ArgentError, Result};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Well-known hook points
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HookPoint {
    /// Before the working copy moves to another changeset; can veto
    PreUpdate,
    /// After the working copy moved
    Update,
    /// Before a commit is recorded; can veto
    PreCommit,
    /// A pushed key (bookmark, phase) is being updated; can veto
    PushKey,
    /// After changesets were added by pull, push, or unbundle
    ChangeGroup,
}

impl HookPoint {
    /// Stable name used in diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            HookPoint::PreUpdate => "preupdate",
            HookPoint::Update => "update",
            HookPoint::PreCommit => "precommit",
            HookPoint::PushKey => "pushkey",
            HookPoint::ChangeGroup => "changegroup",
        }
    }

    /// Whether a failure at this point vetoes the operation
    pub fn is_veto_point(&self) -> bool {
        matches!(
            self,
            HookPoint::PreUpdate | HookPoint::PreCommit | HookPoint::PushKey
        )
    }
}

/// Context passed to every hook invocation
pub type HookContext = BTreeMap<String, String>;

/// A registered hook callback
type HookFn = Box<dyn Fn(&HookContext) -> std::result::Result<(), String> + Send + Sync>;

/// Registry of hooks per point, run in registration order
#[derive(Default)]
pub struct HookRegistry {
    hooks: BTreeMap<HookPoint, Vec<(String, HookFn)>>,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: BTreeMap<&str, usize> = self
            .hooks
            .iter()
            .map(|(point, hooks)| (point.name(), hooks.len()))
            .collect();
        f.debug_struct("HookRegistry").field("hooks", &counts).finish()
    }
}

impl HookRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a named hook to a point
    pub fn register<F>(&mut self, point: HookPoint, name: impl Into<String>, hook: F)
    where
        F: Fn(&HookContext) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.hooks
            .entry(point)
            .or_default()
            .push((name.into(), Box::new(hook)));
    }

    /// Run all hooks for a point
    ///
    /// At veto points the first failure aborts with `HookAborted`; at
    /// advisory points failures are logged and the result is `Ok`.
    pub fn run(&self, point: HookPoint, context: &HookContext) -> Result<()> {
        let Some(hooks) = self.hooks.get(&point) else {
            return Ok(());
        };
        for (name, hook) in hooks {
            debug!("running {} hook {:?}", point.name(), name);
            if let Err(reason) = hook(context) {
                if point.is_veto_point() {
                    return Err(ArgentError::HookAborted {
                        hook: format!("{}.{}", point.name(), name),
                        reason,
                    });
                }
                warn!("{} hook {:?} failed: {}", point.name(), name, reason);
            }
        }
        Ok(())
    }
}

/// Build a hook context from key/value pairs
pub fn context(pairs: &[(&str, &str)]) -> HookContext {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
