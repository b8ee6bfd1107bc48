//! Locked/blocked strategy policy: which bypass strategy is fixed or
//! forbidden for each `(profile, host)` pair.

mod blocked;
mod codec;
pub mod defaults;
pub mod events;
mod history;
mod learned;
mod locked;
mod migration;
pub mod paths;
mod profile;
mod traits;

pub use blocked::BlockedStrategyStore;
pub use defaults::DefaultBlockedDomains;
pub use events::{LogEvents, NoopEvents, PolicyEvent, PolicyEvents, RecordingEvents};
pub use history::{HistoryCounts, HistoryStat, HistoryStore};
pub use learned::{LearnedData, LearnedProfile};
pub use locked::{LockTable, LockedInfo, LockedStrategyStore};
pub use profile::{normalize_host, TrafficProfile, LEGACY_PROFILE_ALIASES};
pub use traits::{BlockedLookup, LockConflicts};

use crate::backend::KvBackend;
use std::sync::Arc;

/// Opaque bypass strategy identifier. Valid ids start at 1.
pub type StrategyId = u32;

/// Both stores, wired together.
///
/// The lock table is built first and handed to the blocked store, which is
/// then handed to the locked store. Nothing is wired after construction.
pub struct StrategyPolicy {
    blocked: Arc<BlockedStrategyStore>,
    locked: LockedStrategyStore,
}

impl StrategyPolicy {
    pub fn new(backend: Arc<dyn KvBackend>, events: Arc<dyn PolicyEvents>) -> Self {
        let table = Arc::new(LockTable::new(backend.clone(), events.clone()));
        let blocked = Arc::new(BlockedStrategyStore::new(
            backend,
            Some(table.clone() as Arc<dyn LockConflicts>),
            events,
        ));
        let locked = LockedStrategyStore::new(table, blocked.clone() as Arc<dyn BlockedLookup>);
        Self { blocked, locked }
    }

    /// Blocked first, so the locked store's conflict cleanup sees it.
    pub fn load(&self) {
        self.blocked.load();
        self.locked.load();
    }

    pub fn blocked(&self) -> &BlockedStrategyStore {
        &self.blocked
    }

    pub fn locked(&self) -> &LockedStrategyStore {
        &self.locked
    }

    pub fn learned_data(&self) -> LearnedData {
        learned::collect(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn policy() -> StrategyPolicy {
        let policy = StrategyPolicy::new(Arc::new(MemoryBackend::new()), Arc::new(NoopEvents));
        policy.load();
        policy
    }

    #[test]
    fn test_block_removes_matching_lock_only() {
        let policy = policy();
        policy.locked().lock("a.com", 3, TrafficProfile::Tls, false);
        policy.locked().lock("b.com", 4, TrafficProfile::Tls, false);

        policy.blocked().block("a.com", 3, TrafficProfile::Tls, false);
        policy.blocked().block("b.com", 5, TrafficProfile::Tls, false);

        assert_eq!(policy.locked().get("a.com", TrafficProfile::Tls), None);
        assert_eq!(policy.locked().get("b.com", TrafficProfile::Tls), Some(4));
    }

    #[test]
    fn test_learned_data_mirrors_quic_as_udp() {
        let policy = policy();
        policy.locked().lock("1.2.3.4", 2, TrafficProfile::Quic, true);
        policy.blocked().block("1.2.3.4", 6, TrafficProfile::Quic, true);
        policy.locked().increment_history("1.2.3.4", 2, true);

        let data = policy.learned_data();
        assert_eq!(data.profiles["udp"], data.profiles["quic"]);
        assert_eq!(data.profiles["quic"].locked.get("1.2.3.4"), Some(&2));
        assert_eq!(data.profiles["quic"].user_locked, vec!["1.2.3.4".to_string()]);
        assert_eq!(data.profiles["quic"].user_blocked["1.2.3.4"], vec![6]);
        assert_eq!(data.history["1.2.3.4"][&2].rate, 100);
        assert_eq!(data.total_locked(), 1);
        assert_eq!(data.profiles.len(), TrafficProfile::ALL.len() + 1);
    }
}
