//! Interceptors run around store, retrieve and delete.
//!
//! A hook is registered for one [`HookPhase`]. `before-*` hooks may veto the
//! operation; the first veto stops the remaining hooks and the operation fails
//! with [`StorageError::HookRejected`]. `after-*` hooks only observe, and only
//! run when the operation succeeded.
//!
//! Hooks run in registration order. A registry is configured up front and
//! then shared read-only (`Arc<HookRegistry>`) by the containers and caches
//! that use it.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::decomposed::DecomposedObject;
use crate::error::{StorageError, StorageResult};

/// The storage operation a hook is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Store,
    Retrieve,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Store => "store",
            Self::Retrieve => "retrieve",
            Self::Delete => "delete",
        })
    }
}

/// A lifecycle phase: before or after an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    Before(Operation),
    After(Operation),
}

impl HookPhase {
    pub fn operation(self) -> Operation {
        match self {
            Self::Before(op) | Self::After(op) => op,
        }
    }
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Before(op) => write!(f, "before-{op}"),
            Self::After(op) => write!(f, "after-{op}"),
        }
    }
}

/// What a hook sees.
///
/// `object` is the value being stored (`before-store`, `after-store`) or the
/// value that was retrieved (`after-retrieve`); it is `None` otherwise.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub phase: HookPhase,
    pub key: &'a str,
    pub object: Option<&'a DecomposedObject>,
}

/// A hook's verdict. Only `before-*` verdicts are honoured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookDecision {
    Proceed,
    Veto(String),
}

impl HookDecision {
    /// Veto with a reason.
    pub fn veto(reason: impl Into<String>) -> Self {
        Self::Veto(reason.into())
    }
}

/// A registered hook callable.
pub type Hook = Arc<dyn Fn(&HookContext<'_>) -> HookDecision + Send + Sync>;

/// Ordered hook lists, one per phase.
#[derive(Default, Clone)]
pub struct HookRegistry {
    before: [Vec<Hook>; 3],
    after: [Vec<Hook>; 3],
}

fn slot(op: Operation) -> usize {
    match op {
        Operation::Store => 0,
        Operation::Retrieve => 1,
        Operation::Delete => 2,
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a `before-*` hook that may veto `op`.
    pub fn before<F>(&mut self, op: Operation, hook: F) -> &mut Self
    where
        F: Fn(&HookContext<'_>) -> HookDecision + Send + Sync + 'static,
    {
        self.before[slot(op)].push(Arc::new(hook));
        self
    }

    /// Register an `after-*` observer for `op`.
    pub fn after<F>(&mut self, op: Operation, hook: F) -> &mut Self
    where
        F: Fn(&HookContext<'_>) + Send + Sync + 'static,
    {
        self.after[slot(op)].push(Arc::new(move |ctx: &HookContext<'_>| {
            hook(ctx);
            HookDecision::Proceed
        }));
        self
    }

    /// Number of hooks registered for a phase.
    pub fn count(&self, phase: HookPhase) -> usize {
        match phase {
            HookPhase::Before(op) => self.before[slot(op)].len(),
            HookPhase::After(op) => self.after[slot(op)].len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.before.iter().chain(self.after.iter()).all(Vec::is_empty)
    }

    /// Run the `before-*` hooks for `op`, stopping at the first veto.
    pub fn run_before(
        &self,
        op: Operation,
        key: &str,
        object: Option<&DecomposedObject>,
    ) -> StorageResult<()> {
        let phase = HookPhase::Before(op);
        let ctx = HookContext { phase, key, object };
        for hook in &self.before[slot(op)] {
            if let HookDecision::Veto(reason) = hook(&ctx) {
                debug!(%phase, key, %reason, "hook vetoed operation");
                return Err(StorageError::HookRejected {
                    phase,
                    key: key.to_string(),
                    reason,
                });
            }
        }
        Ok(())
    }

    /// Run the `after-*` observers for `op`.
    pub fn run_after(&self, op: Operation, key: &str, object: Option<&DecomposedObject>) {
        let ctx = HookContext {
            phase: HookPhase::After(op),
            key,
            object,
        };
        for hook in &self.after[slot(op)] {
            let _ = hook(&ctx);
        }
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts = |lists: &[Vec<Hook>; 3]| lists.iter().map(Vec::len).collect::<Vec<_>>();
        f.debug_struct("HookRegistry")
            .field("before", &counts(&self.before))
            .field("after", &counts(&self.after))
            .finish()
    }
}

// ── tests ────────────────────────────────────────────────────────────
