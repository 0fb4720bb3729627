//! Lifecycle hooks let the embedding gateway observe runs and pruning
//! without the core depending on any transport or metrics stack.

use chrono::{DateTime, Utc};

use crate::context::prune::PruneEvent;

/// Observer callbacks fired around turn execution and context
/// maintenance.  All methods default to no-ops; implementations must be
/// cheap and must not block.
pub trait LifecycleHooks: Send + Sync {
    fn before_run(&self, _session_key: &str, _at: DateTime<Utc>) {}

    fn after_run(&self, _session_key: &str, _duration_ms: u64, _response_chars: usize) {}

    /// One pruning or compaction rule fired.  The rule label is one of
    /// the `rule::*` constants in [`crate::context::prune`].
    fn prune_rule_applied(&self, _session_key: &str, _event: &PruneEvent) {}
}

/// Hooks that do nothing.  Used when the embedder doesn't care.
pub struct NullHooks;

impl LifecycleHooks for NullHooks {}
