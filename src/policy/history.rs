use super::paths;
use super::profile::{normalize_host, TrafficProfile};
use super::traits::BlockedLookup;
use super::StrategyId;
use crate::backend::KvBackend;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

/// Raw counters as persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryCounts {
    #[serde(default)]
    pub successes: u64,
    #[serde(default)]
    pub failures: u64,
}

impl HistoryCounts {
    pub fn total(&self) -> u64 {
        self.successes.saturating_add(self.failures)
    }

    /// Success percentage, rounded down. Zero when nothing was recorded.
    pub fn rate(&self) -> u64 {
        let total = u128::from(self.successes) + u128::from(self.failures);
        match total {
            0 => 0,
            total => (u128::from(self.successes) * 100 / total) as u64,
        }
    }
}

/// Counters plus the derived rate, as handed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HistoryStat {
    pub successes: u64,
    pub failures: u64,
    pub rate: u64,
}

impl From<HistoryCounts> for HistoryStat {
    fn from(c: HistoryCounts) -> Self {
        Self {
            successes: c.successes,
            failures: c.failures,
            rate: c.rate(),
        }
    }
}

type HostHistory = BTreeMap<StrategyId, HistoryCounts>;

/// Per-host, per-strategy success/failure counters.
///
/// Records are never evicted. Every mutation writes the host's record through
/// to the backend under [`paths::HISTORY`].
pub struct HistoryStore {
    backend: Arc<dyn KvBackend>,
    blocked: Arc<dyn BlockedLookup>,
    records: Mutex<FxHashMap<String, HostHistory>>,
}

impl HistoryStore {
    pub fn new(backend: Arc<dyn KvBackend>, blocked: Arc<dyn BlockedLookup>) -> Self {
        Self {
            backend,
            blocked,
            records: Mutex::new(FxHashMap::default()),
        }
    }

    fn records(&self) -> MutexGuard<'_, FxHashMap<String, HostHistory>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn load(&self) {
        let mut records = self.records();
        records.clear();

        let stored = match self.backend.enumerate(paths::HISTORY) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Failed to read strategy history: {}", e);
                return;
            }
        };

        for (host, raw) in stored {
            let host = normalize_host(&host);
            match serde_json::from_str::<HostHistory>(&raw) {
                Ok(history) => {
                    let slot = records.entry(host).or_default();
                    for (id, counts) in history.into_iter().filter(|(id, _)| *id >= 1) {
                        slot.insert(id, counts);
                    }
                }
                Err(e) => warn!("Skipping malformed history for {}: {}", host, e),
            }
        }

        info!("Loaded strategy history for {} hosts", records.len());
    }

    pub fn increment(&self, host: &str, strategy: StrategyId, success: bool) {
        let host = normalize_host(host);
        if host.is_empty() || strategy == 0 {
            return;
        }

        let mut records = self.records();
        let counts = records
            .entry(host.clone())
            .or_default()
            .entry(strategy)
            .or_default();
        if success {
            counts.successes = counts.successes.saturating_add(1);
        } else {
            counts.failures = counts.failures.saturating_add(1);
        }
        self.persist(&records, &host);
    }

    /// Replaces both counters. Used for bulk import.
    pub fn update(&self, host: &str, strategy: StrategyId, successes: u64, failures: u64) {
        let host = normalize_host(host);
        if host.is_empty() || strategy == 0 {
            return;
        }

        let mut records = self.records();
        records.entry(host.clone()).or_default().insert(
            strategy,
            HistoryCounts {
                successes,
                failures,
            },
        );
        self.persist(&records, &host);
    }

    pub fn for_host(&self, host: &str) -> BTreeMap<StrategyId, HistoryStat> {
        let host = normalize_host(host);
        self.records()
            .get(&host)
            .map(|history| {
                history
                    .iter()
                    .map(|(id, counts)| (*id, HistoryStat::from(*counts)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Highest-rate strategy with at least one attempt that is not excluded and
    /// not blocked for `profile`. Ties go to the lowest id.
    pub fn best_strategy(
        &self,
        host: &str,
        exclude: Option<StrategyId>,
        profile: TrafficProfile,
    ) -> Option<StrategyId> {
        let host = normalize_host(host);
        // Snapshot first: the blocked check takes the blocked store's lock.
        let candidates: Vec<(StrategyId, HistoryCounts)> = self
            .records()
            .get(&host)
            .map(|h| h.iter().map(|(id, c)| (*id, *c)).collect())
            .unwrap_or_default();

        let mut best: Option<(StrategyId, u64)> = None;
        for (id, counts) in candidates {
            if Some(id) == exclude || counts.total() == 0 {
                continue;
            }
            if self.blocked.is_blocked(&host, id, profile) {
                continue;
            }
            let rate = counts.rate();
            if best.map_or(true, |(_, best_rate)| rate > best_rate) {
                best = Some((id, rate));
            }
        }
        best.map(|(id, _)| id)
    }

    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<StrategyId, HistoryStat>> {
        self.records()
            .iter()
            .map(|(host, history)| {
                let stats = history
                    .iter()
                    .map(|(id, c)| (*id, HistoryStat::from(*c)))
                    .collect();
                (host.clone(), stats)
            })
            .collect()
    }

    pub fn host_count(&self) -> usize {
        self.records().len()
    }

    /// Drops every record, in memory and on disk.
    pub fn clear(&self) -> bool {
        self.records().clear();
        match self.backend.delete_all(paths::HISTORY) {
            Ok(removed) => {
                info!("Cleared strategy history ({} hosts)", removed);
                true
            }
            Err(e) => {
                warn!("Failed to clear strategy history: {}", e);
                false
            }
        }
    }

    fn persist(&self, records: &FxHashMap<String, HostHistory>, host: &str) {
        let Some(history) = records.get(host) else {
            return;
        };
        let encoded = match serde_json::to_string(history) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Failed to encode history for {}: {}", host, e);
                return;
            }
        };
        if let Err(e) = self.backend.write(paths::HISTORY, host, &encoded) {
            warn!("Failed to persist history for {}: {}", host, e);
        }
    }
}
