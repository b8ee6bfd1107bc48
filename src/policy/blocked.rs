use super::codec;
use super::defaults::{DefaultBlockedDomains, DEFAULT_BLOCKED_STRATEGY};
use super::events::PolicyEvents;
use super::migration;
use super::paths::Namespace;
use super::profile::{normalize_host, TrafficProfile};
use super::traits::{BlockedLookup, LockConflicts};
use super::StrategyId;
use crate::backend::KvBackend;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

type IdMap = FxHashMap<String, BTreeSet<StrategyId>>;

#[derive(Debug, Default)]
struct BlockedState {
    entries: FxHashMap<TrafficProfile, IdMap>,
    // Ids a user (or automation) blocked explicitly. Never holds default ids.
    user: FxHashMap<TrafficProfile, IdMap>,
}

impl BlockedState {
    fn clear(&mut self) {
        self.entries.values_mut().for_each(IdMap::clear);
        self.user.values_mut().for_each(IdMap::clear);
    }
}

/// Per-profile map of host to forbidden strategy ids.
///
/// Strategy 1 on the built-in censored domains is blocked implicitly for TCP
/// profiles. Those ids are recomputed on every check, never persisted, and
/// cannot be unblocked.
pub struct BlockedStrategyStore {
    backend: Arc<dyn KvBackend>,
    defaults: &'static DefaultBlockedDomains,
    locks: Option<Arc<dyn LockConflicts>>,
    events: Arc<dyn PolicyEvents>,
    state: Mutex<BlockedState>,
}

impl BlockedStrategyStore {
    pub fn new(
        backend: Arc<dyn KvBackend>,
        locks: Option<Arc<dyn LockConflicts>>,
        events: Arc<dyn PolicyEvents>,
    ) -> Self {
        Self {
            backend,
            defaults: DefaultBlockedDomains::builtin(),
            locks,
            events,
            state: Mutex::new(BlockedState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, BlockedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Default ids only apply where `is_blocked` honours them.
    fn default_implied(&self, host: &str, strategy: StrategyId, profile: TrafficProfile) -> bool {
        profile.is_tcp() && self.defaults.is_default_blocked(host, strategy)
    }

    pub fn is_default_blocked(&self, host: &str, strategy: StrategyId) -> bool {
        self.defaults.is_default_blocked(&normalize_host(host), strategy)
    }

    pub fn load(&self) {
        let mut state = self.state();
        state.clear();

        migration::migrate_blocked(self.backend.as_ref(), self.defaults);

        let tls = state.entries.entry(TrafficProfile::Tls).or_default();
        for domain in self.defaults.iter() {
            tls.entry(domain.to_string())
                .or_default()
                .insert(DEFAULT_BLOCKED_STRATEGY);
        }

        let mut user_total = 0;
        for profile in TrafficProfile::ALL {
            for (host, ids) in self.read_path(Namespace::Blocked, profile) {
                user_total += 1;
                state
                    .entries
                    .entry(profile)
                    .or_default()
                    .entry(host)
                    .or_default()
                    .extend(ids);
            }

            for (host, ids) in self.read_path(Namespace::BlockedUser, profile) {
                let ids: BTreeSet<_> = ids
                    .into_iter()
                    .filter(|id| !self.default_implied(&host, *id, profile))
                    .collect();
                if ids.is_empty() {
                    continue;
                }
                state
                    .entries
                    .entry(profile)
                    .or_default()
                    .entry(host.clone())
                    .or_default()
                    .extend(ids.iter().copied());
                state
                    .user
                    .entry(profile)
                    .or_default()
                    .entry(host)
                    .or_default()
                    .extend(ids);
            }
        }

        info!(
            "Loaded blocked strategies: {} defaults, {} stored entries",
            self.defaults.len(),
            user_total
        );
    }

    fn read_path(&self, ns: Namespace, profile: TrafficProfile) -> Vec<(String, BTreeSet<StrategyId>)> {
        let path = ns.path(profile);
        let stored = match self.backend.enumerate(&path) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Failed to read {}: {}", path, e);
                return Vec::new();
            }
        };

        stored
            .into_iter()
            .filter_map(|(host, raw)| {
                let host = normalize_host(&host);
                match codec::decode_ids(&raw) {
                    Some(ids) if !host.is_empty() => Some((host, ids)),
                    _ => {
                        warn!("Skipping malformed entry {:?} in {}", host, path);
                        None
                    }
                }
            })
            .collect()
    }

    /// Writes every profile in full and removes on-disk keys that no longer
    /// have a counterpart in memory.
    pub fn save(&self) {
        let state = self.state();
        for profile in TrafficProfile::ALL {
            let entries = state.entries.get(&profile);
            let user = state.user.get(&profile);
            self.dump(Namespace::Blocked, profile, entries);
            self.dump(Namespace::BlockedUser, profile, user);
        }
    }

    fn dump(&self, ns: Namespace, profile: TrafficProfile, map: Option<&IdMap>) {
        let path = ns.path(profile);
        let mut keep = BTreeSet::new();
        if let Some(map) = map {
            for (host, ids) in map {
                if self.write_host(&path, profile, host, ids) {
                    keep.insert(host.as_str());
                }
            }
        }

        match self.backend.enumerate(&path) {
            Ok(stored) => {
                for key in stored.keys().filter(|k| !keep.contains(k.as_str())) {
                    if let Err(e) = self.backend.delete(&path, key) {
                        warn!("Failed to delete stale {} from {}: {}", key, path, e);
                    }
                }
            }
            Err(e) => warn!("Failed to enumerate {}: {}", path, e),
        }
    }

    /// Persists the non-default part of `ids`, deleting the key when nothing
    /// is left. Returns whether a key remains on disk.
    fn write_host(
        &self,
        path: &str,
        profile: TrafficProfile,
        host: &str,
        ids: &BTreeSet<StrategyId>,
    ) -> bool {
        let stored: Vec<_> = ids
            .iter()
            .filter(|id| !self.default_implied(host, **id, profile))
            .collect();

        if stored.is_empty() {
            if let Err(e) = self.backend.delete(path, host) {
                warn!("Failed to delete {} from {}: {}", host, path, e);
            }
            return false;
        }

        if let Err(e) = self.backend.write(path, host, &codec::encode_ids(stored)) {
            warn!("Failed to persist {} into {}: {}", host, path, e);
        }
        true
    }

    fn persist_host(&self, state: &BlockedState, profile: TrafficProfile, host: &str) {
        let empty = BTreeSet::new();
        let entries = state
            .entries
            .get(&profile)
            .and_then(|m| m.get(host))
            .unwrap_or(&empty);
        let user = state
            .user
            .get(&profile)
            .and_then(|m| m.get(host))
            .unwrap_or(&empty);

        self.write_host(&Namespace::Blocked.path(profile), profile, host, entries);
        self.write_host(&Namespace::BlockedUser.path(profile), profile, host, user);
    }

    /// Forbids `strategy` for `(profile, host)`. Any lock on the same strategy
    /// is removed afterwards, user locks included.
    pub fn block(
        &self,
        host: &str,
        strategy: StrategyId,
        profile: TrafficProfile,
        user_block: bool,
    ) -> bool {
        let host = normalize_host(host);
        if host.is_empty() || strategy == 0 {
            return false;
        }

        {
            let mut state = self.state();
            state
                .entries
                .entry(profile)
                .or_default()
                .entry(host.clone())
                .or_default()
                .insert(strategy);
            if user_block && !self.default_implied(&host, strategy, profile) {
                state
                    .user
                    .entry(profile)
                    .or_default()
                    .entry(host.clone())
                    .or_default()
                    .insert(strategy);
            }
            self.persist_host(&state, profile, &host);
        }
        debug!(%profile, host = %host, strategy, user_block, "strategy blocked");

        // The state lock is released before calling into the locked store.
        if let Some(locks) = &self.locks {
            if locks.drop_conflicting_lock(&host, strategy, profile) {
                self.events.on_output_message(&format!(
                    "Strategy #{} blocked for {} [{}], lock removed",
                    strategy, host, profile
                ));
            }
        }
        true
    }

    /// Fails for default-implied ids and for ids that were not blocked.
    pub fn unblock(&self, host: &str, strategy: StrategyId, profile: TrafficProfile) -> bool {
        let host = normalize_host(host);
        if self.default_implied(&host, strategy, profile) {
            debug!(%profile, host = %host, strategy, "refusing to unblock a default entry");
            return false;
        }

        let mut state = self.state();
        let Some(ids) = state.entries.get_mut(&profile).and_then(|m| m.get_mut(&host)) else {
            return false;
        };
        if !ids.remove(&strategy) {
            return false;
        }
        if ids.is_empty() {
            if let Some(map) = state.entries.get_mut(&profile) {
                map.remove(&host);
            }
        }

        if let Some(user) = state.user.get_mut(&profile) {
            if let Some(ids) = user.get_mut(&host) {
                ids.remove(&strategy);
                if ids.is_empty() {
                    user.remove(&host);
                }
            }
        }

        self.persist_host(&state, profile, &host);
        debug!(%profile, host = %host, strategy, "strategy unblocked");
        true
    }

    pub fn is_blocked(&self, host: &str, strategy: StrategyId, profile: TrafficProfile) -> bool {
        let host = normalize_host(host);
        if self.default_implied(&host, strategy, profile) {
            return true;
        }
        self.state()
            .entries
            .get(&profile)
            .and_then(|m| m.get(&host))
            .is_some_and(|ids| ids.contains(&strategy))
    }

    pub fn is_user_blocked(&self, host: &str, strategy: StrategyId, profile: TrafficProfile) -> bool {
        let host = normalize_host(host);
        self.state()
            .user
            .get(&profile)
            .and_then(|m| m.get(&host))
            .is_some_and(|ids| ids.contains(&strategy))
    }

    /// Every id blocked for the host, implicit defaults included.
    pub fn get_blocked(&self, host: &str, profile: TrafficProfile) -> Vec<StrategyId> {
        let host = normalize_host(host);
        let mut ids = self
            .state()
            .entries
            .get(&profile)
            .and_then(|m| m.get(&host))
            .cloned()
            .unwrap_or_default();
        if self.default_implied(&host, DEFAULT_BLOCKED_STRATEGY, profile) {
            ids.insert(DEFAULT_BLOCKED_STRATEGY);
        }
        ids.into_iter().collect()
    }

    pub fn get_all(&self, profile: TrafficProfile) -> BTreeMap<String, Vec<StrategyId>> {
        Self::snapshot(self.state().entries.get(&profile))
    }

    pub fn get_user_blocked(&self, profile: TrafficProfile) -> BTreeMap<String, Vec<StrategyId>> {
        Self::snapshot(self.state().user.get(&profile))
    }

    fn snapshot(map: Option<&IdMap>) -> BTreeMap<String, Vec<StrategyId>> {
        map.map(|m| {
            m.iter()
                .map(|(host, ids)| (host.clone(), ids.iter().copied().collect()))
                .collect()
        })
        .unwrap_or_default()
    }

    /// Hosts with at least one non-default blocked id, across all profiles.
    pub fn user_entry_count(&self) -> usize {
        let state = self.state();
        state
            .entries
            .iter()
            .map(|(profile, map)| {
                map.iter()
                    .filter(|(host, ids)| {
                        ids.iter()
                            .any(|id| !self.default_implied(host, *id, *profile))
                    })
                    .count()
            })
            .sum()
    }

    /// Deletes every stored entry and reloads, so only the defaults remain.
    /// Returns how many stored entries were removed.
    pub fn clear(&self) -> usize {
        let mut removed = 0;
        for profile in TrafficProfile::ALL {
            for ns in [Namespace::Blocked, Namespace::BlockedUser] {
                match self.backend.delete_all(&ns.path(profile)) {
                    Ok(n) if ns == Namespace::Blocked => removed += n,
                    Ok(_) => {}
                    Err(e) => warn!("Failed to clear {}: {}", ns.path(profile), e),
                }
            }
        }

        self.load();
        self.events
            .on_output_message(&format!("Cleared {} blocked strategy entries", removed));
        removed
    }
}

impl BlockedLookup for BlockedStrategyStore {
    fn is_blocked(&self, host: &str, strategy: StrategyId, profile: TrafficProfile) -> bool {
        BlockedStrategyStore::is_blocked(self, host, strategy, profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::policy::events::NoopEvents;

    fn store() -> (Arc<MemoryBackend>, BlockedStrategyStore) {
        let backend = Arc::new(MemoryBackend::new());
        let blocked = BlockedStrategyStore::new(backend.clone(), None, Arc::new(NoopEvents));
        blocked.load();
        (backend, blocked)
    }

    #[test]
    fn test_defaults_seeded_but_not_persisted() {
        let (backend, blocked) = store();
        assert!(blocked.is_blocked("youtube.com", 1, TrafficProfile::Tls));
        assert!(blocked.is_blocked("www.youtube.com", 1, TrafficProfile::Http));
        assert!(!blocked.is_blocked("youtube.com", 1, TrafficProfile::Quic));
        assert!(!blocked.is_blocked("youtube.com", 2, TrafficProfile::Tls));

        blocked.save();
        assert_eq!(backend.key_count("blocked/tls"), 0);
        assert_eq!(blocked.user_entry_count(), 0);
    }

    #[test]
    fn test_block_keeps_ids_sorted() {
        let (backend, blocked) = store();
        blocked.block("Example.com.", 9, TrafficProfile::Tls, false);
        blocked.block("example.com", 2, TrafficProfile::Tls, false);
        blocked.block("example.com", 9, TrafficProfile::Tls, false);

        assert_eq!(blocked.get_blocked("example.com", TrafficProfile::Tls), vec![2, 9]);
        assert_eq!(
            backend.read("blocked/tls", "example.com").unwrap().as_deref(),
            Some("[2,9]")
        );
    }

    #[test]
    fn test_default_host_persists_only_extra_ids() {
        let (backend, blocked) = store();
        blocked.block("discord.com", 4, TrafficProfile::Tls, true);

        assert_eq!(blocked.get_blocked("discord.com", TrafficProfile::Tls), vec![1, 4]);
        assert_eq!(
            backend.read("blocked/tls", "discord.com").unwrap().as_deref(),
            Some("[4]")
        );

        assert!(blocked.unblock("discord.com", 4, TrafficProfile::Tls));
        assert_eq!(backend.read("blocked/tls", "discord.com").unwrap(), None);
        assert!(blocked.is_blocked("discord.com", 1, TrafficProfile::Tls));
    }

    #[test]
    fn test_unblock_default_is_refused() {
        let (_, blocked) = store();
        assert!(!blocked.unblock("facebook.com", 1, TrafficProfile::Tls));
        assert!(blocked.is_blocked("facebook.com", 1, TrafficProfile::Tls));
        assert!(!blocked.unblock("cdn.facebook.com", 1, TrafficProfile::Mtproto));
    }

    #[test]
    fn test_unblock_missing_returns_false() {
        let (_, blocked) = store();
        assert!(!blocked.unblock("example.com", 3, TrafficProfile::Tls));
        blocked.block("example.com", 3, TrafficProfile::Dns, false);
        assert!(!blocked.unblock("example.com", 3, TrafficProfile::Tls));
        assert!(blocked.unblock("example.com", 3, TrafficProfile::Dns));
    }

    #[test]
    fn test_user_block_never_records_default_ids() {
        let (_, blocked) = store();
        blocked.block("youtube.com", 1, TrafficProfile::Tls, true);
        assert!(!blocked.is_user_blocked("youtube.com", 1, TrafficProfile::Tls));

        // Outside TCP profiles strategy 1 is an ordinary id
        blocked.block("youtube.com", 1, TrafficProfile::Quic, true);
        assert!(blocked.is_user_blocked("youtube.com", 1, TrafficProfile::Quic));
        assert!(blocked.unblock("youtube.com", 1, TrafficProfile::Quic));
    }

    #[test]
    fn test_malformed_entry_is_skipped() {
        let (backend, blocked) = store();
        backend.write("blocked/stun", "bad.com", "[\"x\"]").unwrap();
        backend.write("blocked/stun", "10.0.0.1", "[5]").unwrap();
        blocked.load();

        assert!(blocked.is_blocked("10.0.0.1", 5, TrafficProfile::Stun));
        assert!(blocked.get_all(TrafficProfile::Stun).get("bad.com").is_none());
    }

    #[test]
    fn test_save_prunes_stale_keys() {
        let (backend, blocked) = store();
        blocked.block("a.com", 3, TrafficProfile::Wireguard, false);
        backend.write("blocked/wireguard", "ghost.com", "[8]").unwrap();

        blocked.save();
        assert_eq!(backend.key_count("blocked/wireguard"), 1);
        assert!(backend.read("blocked/wireguard", "a.com").unwrap().is_some());
    }

    #[test]
    fn test_write_failure_keeps_memory_state() {
        let (backend, blocked) = store();
        backend.set_fail_writes(true);
        assert!(blocked.block("a.com", 3, TrafficProfile::Tls, true));
        assert!(blocked.is_blocked("a.com", 3, TrafficProfile::Tls));
        assert_eq!(backend.key_count("blocked/tls"), 0);
    }
}
