use super::{StrategyId, TrafficProfile};

/// Read side of the blocked store, consumed by conflict cleanup and history.
pub trait BlockedLookup: Send + Sync {
    fn is_blocked(&self, host: &str, strategy: StrategyId, profile: TrafficProfile) -> bool;
}

/// Locked-side hook the blocked store calls after every `block`.
pub trait LockConflicts: Send + Sync {
    /// Removes the lock on `(profile, host)` if it equals `strategy`, user
    /// lock included. Returns whether anything was removed.
    fn drop_conflicting_lock(&self, host: &str, strategy: StrategyId, profile: TrafficProfile)
        -> bool;
}
