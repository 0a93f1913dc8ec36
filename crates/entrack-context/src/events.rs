//! Post-transaction callback queue.
//!
//! Shared-cache writes must not become visible to other units-of-work
//! unless the local transaction actually commits, so the natural-key
//! coordination registers its finalization work here and the owning
//! context drains the queue once the outcome is known. Hooks run in
//! registration order. A failing hook is logged and the drain continues;
//! cache unavailability must not mask a successful commit.

use entrack_core::error::Result;

/// Deferred work to run after a successful commit.
pub type AfterCommitHook = Box<dyn FnOnce() -> Result<()> + Send>;

/// Queue of after-commit hooks for one unit-of-work.
#[derive(Default)]
pub struct TransactionQueue {
    hooks: Vec<(&'static str, AfterCommitHook)>,
}

impl TransactionQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Register `hook` to run only if the enclosing transaction commits.
    ///
    /// `label` names the work in the log line should the hook fail.
    pub fn run_after_successful_commit(&mut self, label: &'static str, hook: AfterCommitHook) {
        self.hooks.push((label, hook));
    }

    /// Drain the queue for a transaction outcome.
    ///
    /// On commit every hook runs in registration order; failures are
    /// logged and the drain continues. On rollback the hooks are dropped
    /// unrun.
    pub fn complete(&mut self, committed: bool) {
        let hooks = std::mem::take(&mut self.hooks);
        if !committed {
            if !hooks.is_empty() {
                tracing::trace!(dropped = hooks.len(), "transaction rolled back, dropping hooks");
            }
            return;
        }
        for (label, hook) in hooks {
            if let Err(err) = hook() {
                tracing::warn!(label, error = %err, "after-commit hook failed, continuing");
            }
        }
    }

    /// Drop all pending hooks without running them.
    pub fn clear(&mut self) {
        self.hooks.clear();
    }
}

impl std::fmt::Debug for TransactionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionQueue")
            .field("pending", &self.hooks.len())
            .finish()
    }
}
