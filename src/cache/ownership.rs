//! Who runs farm-wide housekeeping.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::domain::types::ServerRole;

/// Decides, once per prune cycle, whether this process should prune.
pub trait PruneOwnership: Send + Sync {
    fn is_pruning_owner(&self) -> bool;
}

impl PruneOwnership for ServerRole {
    fn is_pruning_owner(&self) -> bool {
        self.owns_pruning()
    }
}

/// Ownership toggled at runtime, e.g. by an external leader election.
impl PruneOwnership for AtomicBool {
    fn is_pruning_owner(&self) -> bool {
        self.load(Ordering::Acquire)
    }
}

/// Ownership decided by a closure.
pub struct OwnershipFn<F>(pub F);

impl<F> PruneOwnership for OwnershipFn<F>
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_pruning_owner(&self) -> bool {
        (self.0)()
    }
}
