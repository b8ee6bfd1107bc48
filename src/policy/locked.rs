use super::codec;
use super::defaults::{DefaultBlockedDomains, DEFAULT_BLOCKED_STRATEGY};
use super::events::PolicyEvents;
use super::history::{HistoryStat, HistoryStore};
use super::migration;
use super::paths::Namespace;
use super::profile::{normalize_host, TrafficProfile};
use super::traits::{BlockedLookup, LockConflicts};
use super::StrategyId;
use crate::backend::KvBackend;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct LockState {
    entries: FxHashMap<TrafficProfile, FxHashMap<String, StrategyId>>,
    // Hosts whose current lock was placed by a human. Subset of `entries`.
    user: FxHashMap<TrafficProfile, FxHashSet<String>>,
}

impl LockState {
    fn clear(&mut self) {
        self.entries.values_mut().for_each(FxHashMap::clear);
        self.user.values_mut().for_each(FxHashSet::clear);
    }

    fn get(&self, profile: TrafficProfile, host: &str) -> Option<StrategyId> {
        self.entries.get(&profile).and_then(|m| m.get(host)).copied()
    }

    fn is_user(&self, profile: TrafficProfile, host: &str) -> bool {
        self.user.get(&profile).is_some_and(|s| s.contains(host))
    }
}

/// One row of [`LockedStrategyStore::get_all_with_info`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockedInfo {
    pub profile: TrafficProfile,
    pub host: String,
    pub strategy: StrategyId,
    pub user_lock: bool,
}

/// The locked map and its user markers, with write-through persistence.
///
/// Split out of [`LockedStrategyStore`] so the blocked store can hold it as
/// its [`LockConflicts`] collaborator without a reference cycle.
pub struct LockTable {
    backend: Arc<dyn KvBackend>,
    events: Arc<dyn PolicyEvents>,
    state: Mutex<LockState>,
}

impl LockTable {
    pub fn new(backend: Arc<dyn KvBackend>, events: Arc<dyn PolicyEvents>) -> Self {
        Self {
            backend,
            events,
            state: Mutex::new(LockState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self, ns: Namespace, profile: TrafficProfile, host: &str, value: &str) {
        let path = ns.path(profile);
        if let Err(e) = self.backend.write(&path, host, value) {
            warn!("Failed to persist {} into {}: {}", host, path, e);
        }
    }

    fn delete(&self, ns: Namespace, profile: TrafficProfile, host: &str) {
        let path = ns.path(profile);
        if let Err(e) = self.backend.delete(&path, host) {
            warn!("Failed to delete {} from {}: {}", host, path, e);
        }
    }

    /// Removes the entry and its user marker from memory and disk.
    fn remove(&self, state: &mut LockState, profile: TrafficProfile, host: &str) -> bool {
        let removed = state
            .entries
            .get_mut(&profile)
            .and_then(|m| m.remove(host))
            .is_some();
        let was_user = state
            .user
            .get_mut(&profile)
            .is_some_and(|s| s.remove(host));

        if removed {
            self.delete(Namespace::Locked, profile, host);
        }
        if removed || was_user {
            self.delete(Namespace::LockedUser, profile, host);
        }
        removed
    }
}

impl LockConflicts for LockTable {
    fn drop_conflicting_lock(
        &self,
        host: &str,
        strategy: StrategyId,
        profile: TrafficProfile,
    ) -> bool {
        let host = normalize_host(host);
        let mut state = self.state();
        if state.get(profile, &host) != Some(strategy) {
            return false;
        }

        let was_user = state.is_user(profile, &host);
        self.remove(&mut state, profile, &host);
        drop(state);

        info!(
            %profile, host = %host, strategy, was_user,
            "Removed lock that conflicts with a new block"
        );
        self.events.on_unlock(&host);
        true
    }
}

/// Per-profile host → strategy assignments, user-lock provenance and the
/// strategy history used to pick a replacement.
pub struct LockedStrategyStore {
    backend: Arc<dyn KvBackend>,
    table: Arc<LockTable>,
    blocked: Arc<dyn BlockedLookup>,
    defaults: &'static DefaultBlockedDomains,
    history: HistoryStore,
}

impl LockedStrategyStore {
    pub fn new(table: Arc<LockTable>, blocked: Arc<dyn BlockedLookup>) -> Self {
        let backend = table.backend.clone();
        Self {
            history: HistoryStore::new(backend.clone(), blocked.clone()),
            backend,
            table,
            blocked,
            defaults: DefaultBlockedDomains::builtin(),
        }
    }

    pub fn table(&self) -> &Arc<LockTable> {
        &self.table
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Reloads everything from the backend. Returns the TLS map.
    pub fn load(&self) -> BTreeMap<String, StrategyId> {
        {
            let mut state = self.table.state();
            state.clear();

            migration::migrate_locked(self.backend.as_ref());

            let mut total = 0;
            for profile in TrafficProfile::ALL {
                total += self.read_profile(&mut state, profile);
            }
            info!("Loaded {} locked strategies", total);

            self.clean_blocked_conflicts(&mut state);
        }

        self.history.load();
        self.get_all(TrafficProfile::Tls)
    }

    fn read_profile(&self, state: &mut LockState, profile: TrafficProfile) -> usize {
        let path = Namespace::Locked.path(profile);
        let stored = match self.backend.enumerate(&path) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Failed to read {}: {}", path, e);
                return 0;
            }
        };

        let entries = state.entries.entry(profile).or_default();
        for (host, raw) in stored {
            let host = normalize_host(&host);
            match codec::decode_strategy(&raw) {
                Some(id) if !host.is_empty() => {
                    entries.insert(host, id);
                }
                _ => warn!("Skipping malformed lock {:?} in {}", host, path),
            }
        }
        let count = entries.len();

        let marker_path = Namespace::LockedUser.path(profile);
        let markers = match self.backend.enumerate(&marker_path) {
            Ok(markers) => markers,
            Err(e) => {
                warn!("Failed to read {}: {}", marker_path, e);
                return count;
            }
        };
        for host in markers.into_keys() {
            let normalized = normalize_host(&host);
            if state.get(profile, &normalized).is_some() {
                state.user.entry(profile).or_default().insert(normalized);
            } else {
                debug!(%profile, host = %host, "dropping user marker without a lock");
                if let Err(e) = self.backend.delete(&marker_path, &host) {
                    warn!("Failed to delete {} from {}: {}", host, marker_path, e);
                }
            }
        }
        count
    }

    /// Removes locks that contradict the blocked store.
    ///
    /// Pass A (TCP profiles) drops strategy 1 on default-blocked domains
    /// unless the lock is a user lock. Pass B drops every lock the blocked
    /// store reports as blocked, user locks included.
    fn clean_blocked_conflicts(&self, state: &mut LockState) -> usize {
        let mut removed = 0;

        for profile in TrafficProfile::ALL {
            let Some(entries) = state.entries.get(&profile) else {
                continue;
            };

            if profile.is_tcp() {
                let pass_a: Vec<String> = entries
                    .iter()
                    .filter(|(host, id)| {
                        **id == DEFAULT_BLOCKED_STRATEGY
                            && self.defaults.contains(host)
                            && !state.is_user(profile, host)
                    })
                    .map(|(host, _)| host.clone())
                    .collect();
                for host in pass_a {
                    if self.table.remove(state, profile, &host) {
                        info!(%profile, host = %host, "Removed lock on default-blocked strategy");
                        removed += 1;
                    }
                }
            }

            let Some(entries) = state.entries.get(&profile) else {
                continue;
            };
            // Lock order is always locked -> blocked.
            let pass_b: Vec<String> = entries
                .iter()
                .filter(|(host, id)| self.blocked.is_blocked(host, **id, profile))
                .map(|(host, _)| host.clone())
                .collect();
            for host in pass_b {
                if self.table.remove(state, profile, &host) {
                    info!(%profile, host = %host, "Removed lock on blocked strategy");
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            self.table
                .events
                .on_output_message(&format!("Removed {} locks that conflict with blocks", removed));
        }
        removed
    }

    /// Assigns `strategy` to `(profile, host)`, replacing any previous lock.
    /// Does not consult the blocked store.
    pub fn lock(
        &self,
        host: &str,
        strategy: StrategyId,
        profile: TrafficProfile,
        user_lock: bool,
    ) -> bool {
        let host = normalize_host(host);
        if host.is_empty() || strategy == 0 {
            return false;
        }

        {
            let mut state = self.table.state();
            state
                .entries
                .entry(profile)
                .or_default()
                .insert(host.clone(), strategy);
            self.table.write(
                Namespace::Locked,
                profile,
                &host,
                &codec::encode_strategy(strategy),
            );

            if user_lock {
                state.user.entry(profile).or_default().insert(host.clone());
                self.table
                    .write(Namespace::LockedUser, profile, &host, codec::MARKER);
            }
        }

        debug!(%profile, host = %host, strategy, user_lock, "strategy locked");
        self.table.events.on_lock(&host, strategy);
        true
    }

    /// Removes the lock so the host re-enters automatic discovery.
    pub fn unlock(&self, host: &str, profile: TrafficProfile) -> bool {
        let host = normalize_host(host);
        let removed = {
            let mut state = self.table.state();
            self.table.remove(&mut state, profile, &host)
        };

        if removed {
            debug!(%profile, host = %host, "strategy unlocked");
            self.table.events.on_unlock(&host);
        }
        removed
    }

    pub fn is_user_locked(&self, host: &str, profile: TrafficProfile) -> bool {
        self.table.state().is_user(profile, &normalize_host(host))
    }

    pub fn get(&self, host: &str, profile: TrafficProfile) -> Option<StrategyId> {
        self.table.state().get(profile, &normalize_host(host))
    }

    pub fn get_all(&self, profile: TrafficProfile) -> BTreeMap<String, StrategyId> {
        self.table
            .state()
            .entries
            .get(&profile)
            .map(|m| m.iter().map(|(h, id)| (h.clone(), *id)).collect())
            .unwrap_or_default()
    }

    pub fn user_locked_hosts(&self, profile: TrafficProfile) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .table
            .state()
            .user
            .get(&profile)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        hosts.sort();
        hosts
    }

    /// Every lock across all profiles, ordered by profile then host.
    pub fn get_all_with_info(&self) -> Vec<LockedInfo> {
        let guard = self.table.state();
        let state: &LockState = &guard;
        let mut rows: Vec<LockedInfo> = state
            .entries
            .iter()
            .flat_map(|(profile, map)| {
                map.iter().map(move |(host, id)| LockedInfo {
                    profile: *profile,
                    host: host.clone(),
                    strategy: *id,
                    user_lock: state.is_user(*profile, host),
                })
            })
            .collect();
        rows.sort_by(|a, b| (a.profile, &a.host).cmp(&(b.profile, &b.host)));
        rows
    }

    /// Rewrites every profile in full, dropping on-disk keys with no
    /// in-memory counterpart.
    pub fn save(&self) {
        let state = self.table.state();
        for profile in TrafficProfile::ALL {
            let entries = state.entries.get(&profile);
            let user = state.user.get(&profile);

            let locked: BTreeMap<&str, String> = entries
                .map(|m| {
                    m.iter()
                        .map(|(h, id)| (h.as_str(), codec::encode_strategy(*id)))
                        .collect()
                })
                .unwrap_or_default();
            let markers: BTreeMap<&str, String> = user
                .map(|s| s.iter().map(|h| (h.as_str(), codec::MARKER.to_string())).collect())
                .unwrap_or_default();

            self.dump(&Namespace::Locked.path(profile), &locked);
            self.dump(&Namespace::LockedUser.path(profile), &markers);
        }
    }

    fn dump(&self, path: &str, values: &BTreeMap<&str, String>) {
        for (host, value) in values {
            if let Err(e) = self.backend.write(path, host, value) {
                warn!("Failed to persist {} into {}: {}", host, path, e);
            }
        }
        match self.backend.enumerate(path) {
            Ok(stored) => {
                for key in stored.keys().filter(|k| !values.contains_key(k.as_str())) {
                    if let Err(e) = self.backend.delete(path, key) {
                        warn!("Failed to delete stale {} from {}: {}", key, path, e);
                    }
                }
            }
            Err(e) => warn!("Failed to enumerate {}: {}", path, e),
        }
    }

    /// Wipes locks, user markers and history. False on any backend error.
    pub fn clear(&self) -> bool {
        let mut ok = true;
        {
            let mut state = self.table.state();
            state.clear();
            for profile in TrafficProfile::ALL {
                for ns in [Namespace::Locked, Namespace::LockedUser] {
                    if let Err(e) = self.backend.delete_all(&ns.path(profile)) {
                        warn!("Failed to clear {}: {}", ns.path(profile), e);
                        ok = false;
                    }
                }
            }
        }
        ok &= self.history.clear();

        if ok {
            self.table
                .events
                .on_output_message("Cleared all locked strategies and history");
        }
        ok
    }

    pub fn increment_history(&self, host: &str, strategy: StrategyId, success: bool) {
        self.history.increment(host, strategy, success);
    }

    pub fn update_history(&self, host: &str, strategy: StrategyId, successes: u64, failures: u64) {
        self.history.update(host, strategy, successes, failures);
    }

    pub fn get_history_for_host(&self, host: &str) -> BTreeMap<StrategyId, HistoryStat> {
        self.history.for_host(host)
    }

    /// Best replacement strategy, checked against the TLS blocked map.
    pub fn best_strategy_from_history(
        &self,
        host: &str,
        exclude: Option<StrategyId>,
    ) -> Option<StrategyId> {
        self.history.best_strategy(host, exclude, TrafficProfile::Tls)
    }

    pub fn best_strategy_for_profile(
        &self,
        host: &str,
        exclude: Option<StrategyId>,
        profile: TrafficProfile,
    ) -> Option<StrategyId> {
        self.history.best_strategy(host, exclude, profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::policy::events::{NoopEvents, PolicyEvent, RecordingEvents};
    use std::collections::HashSet;

    /// Blocks exactly the listed `(host, id)` pairs, on every profile.
    #[derive(Default)]
    struct PairBlocks(HashSet<(String, StrategyId)>);

    impl BlockedLookup for PairBlocks {
        fn is_blocked(&self, host: &str, strategy: StrategyId, _p: TrafficProfile) -> bool {
            self.0.contains(&(host.to_string(), strategy))
        }
    }

    fn store_with(
        backend: Arc<MemoryBackend>,
        blocks: PairBlocks,
        events: Arc<dyn PolicyEvents>,
    ) -> LockedStrategyStore {
        let table = Arc::new(LockTable::new(backend, events));
        LockedStrategyStore::new(table, Arc::new(blocks))
    }

    fn store() -> (Arc<MemoryBackend>, LockedStrategyStore) {
        let backend = Arc::new(MemoryBackend::new());
        let locked = store_with(backend.clone(), PairBlocks::default(), Arc::new(NoopEvents));
        (backend, locked)
    }

    #[test]
    fn test_lock_overwrites_and_persists() {
        let (backend, locked) = store();
        assert!(locked.lock("Example.com", 3, TrafficProfile::Tls, false));
        assert!(locked.lock("example.com.", 5, TrafficProfile::Tls, false));

        assert_eq!(locked.get("example.com", TrafficProfile::Tls), Some(5));
        assert_eq!(
            backend.read("locked/tls", "example.com").unwrap().as_deref(),
            Some("5")
        );
        assert!(!locked.is_user_locked("example.com", TrafficProfile::Tls));
        assert!(!locked.lock("", 3, TrafficProfile::Tls, false));
        assert!(!locked.lock("a.com", 0, TrafficProfile::Tls, false));
    }

    #[test]
    fn test_unlock_clears_marker_and_notifies() {
        let backend = Arc::new(MemoryBackend::new());
        let events = Arc::new(RecordingEvents::new());
        let locked = store_with(backend.clone(), PairBlocks::default(), events.clone());

        locked.lock("a.com", 2, TrafficProfile::Quic, true);
        assert!(locked.is_user_locked("a.com", TrafficProfile::Quic));
        assert!(locked.unlock("A.com", TrafficProfile::Quic));
        assert!(!locked.unlock("a.com", TrafficProfile::Quic));

        assert!(!locked.is_user_locked("a.com", TrafficProfile::Quic));
        assert_eq!(backend.key_count("locked/quic"), 0);
        assert_eq!(backend.key_count("locked_user/quic"), 0);
        assert_eq!(
            events.take(),
            vec![
                PolicyEvent::Lock("a.com".to_string(), 2),
                PolicyEvent::Unlock("a.com".to_string()),
            ]
        );
    }

    #[test]
    fn test_drop_conflicting_lock_only_on_match() {
        let (_, locked) = store();
        locked.lock("a.com", 4, TrafficProfile::Tls, true);

        assert!(!locked.table().drop_conflicting_lock("a.com", 5, TrafficProfile::Tls));
        assert!(!locked.table().drop_conflicting_lock("a.com", 4, TrafficProfile::Http));
        assert!(locked.table().drop_conflicting_lock("a.com", 4, TrafficProfile::Tls));
        assert_eq!(locked.get("a.com", TrafficProfile::Tls), None);
        assert!(!locked.is_user_locked("a.com", TrafficProfile::Tls));
    }

    #[test]
    fn test_load_pass_a_spares_user_locks() {
        let backend = Arc::new(MemoryBackend::new());
        backend.write("locked/tls", "youtube.com", "1").unwrap();
        backend.write("locked/tls", "discord.com", "1").unwrap();
        backend.write("locked_user/tls", "discord.com", "true").unwrap();
        backend.write("locked/tls", "example.com", "1").unwrap();

        // A lookup that knows nothing about defaults isolates pass A.
        let locked = store_with(backend.clone(), PairBlocks::default(), Arc::new(NoopEvents));
        let tls = locked.load();

        assert!(!tls.contains_key("youtube.com"));
        assert_eq!(tls.get("discord.com"), Some(&1));
        assert_eq!(tls.get("example.com"), Some(&1));
        assert_eq!(backend.read("locked/tls", "youtube.com").unwrap(), None);
    }

    #[test]
    fn test_load_pass_b_removes_user_locks() {
        let backend = Arc::new(MemoryBackend::new());
        backend.write("locked/dns", "1.1.1.1", "6").unwrap();
        backend.write("locked_user/dns", "1.1.1.1", "true").unwrap();
        backend.write("locked/dns", "8.8.8.8", "7").unwrap();

        let blocks = PairBlocks(HashSet::from([("1.1.1.1".to_string(), 6)]));
        let locked = store_with(backend.clone(), blocks, Arc::new(NoopEvents));
        locked.load();

        assert_eq!(locked.get("1.1.1.1", TrafficProfile::Dns), None);
        assert!(!locked.is_user_locked("1.1.1.1", TrafficProfile::Dns));
        assert_eq!(backend.key_count("locked_user/dns"), 0);
        assert_eq!(locked.get("8.8.8.8", TrafficProfile::Dns), Some(7));
    }

    #[test]
    fn test_load_drops_orphan_markers_and_bad_values() {
        let backend = Arc::new(MemoryBackend::new());
        backend.write("locked_user/http", "ghost.com", "true").unwrap();
        backend.write("locked/http", "bad.com", "zero").unwrap();
        backend.write("locked/http", "ok.com", "3").unwrap();

        let locked = store_with(backend.clone(), PairBlocks::default(), Arc::new(NoopEvents));
        locked.load();

        assert_eq!(locked.get_all(TrafficProfile::Http).len(), 1);
        assert!(locked.user_locked_hosts(TrafficProfile::Http).is_empty());
        assert_eq!(backend.key_count("locked_user/http"), 0);
    }

    #[test]
    fn test_get_all_with_info_sorted() {
        let (_, locked) = store();
        locked.lock("b.com", 2, TrafficProfile::Http, false);
        locked.lock("a.com", 3, TrafficProfile::Http, true);
        locked.lock("z.com", 4, TrafficProfile::Tls, false);

        let info = locked.get_all_with_info();
        let keys: Vec<_> = info.iter().map(|i| (i.profile, i.host.as_str())).collect();
        assert_eq!(
            keys,
            vec![
                (TrafficProfile::Tls, "z.com"),
                (TrafficProfile::Http, "a.com"),
                (TrafficProfile::Http, "b.com"),
            ]
        );
        assert!(info[1].user_lock);
    }

    #[test]
    fn test_save_prunes_and_clear_wipes() {
        let (backend, locked) = store();
        locked.lock("a.com", 2, TrafficProfile::Stun, true);
        locked.increment_history("a.com", 2, true);
        backend.write("locked/stun", "stale.com", "9").unwrap();

        locked.save();
        assert_eq!(backend.key_count("locked/stun"), 1);
        assert_eq!(backend.key_count("locked_user/stun"), 1);

        assert!(locked.clear());
        assert!(locked.get_all(TrafficProfile::Stun).is_empty());
        assert!(locked.get_history_for_host("a.com").is_empty());
        assert_eq!(backend.key_count("locked/stun"), 0);
        assert_eq!(backend.key_count("history"), 0);
    }

    #[test]
    fn test_clear_reports_backend_failure() {
        let (backend, locked) = store();
        locked.lock("a.com", 2, TrafficProfile::Tls, false);
        backend.set_fail_writes(true);
        assert!(!locked.clear());
        assert!(locked.get_all(TrafficProfile::Tls).is_empty());
    }
}
