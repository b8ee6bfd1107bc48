use super::history::HistoryStat;
use super::paths;
use super::{StrategyId, StrategyPolicy, TrafficProfile};
use serde::Serialize;
use std::collections::BTreeMap;

/// Everything the UI shows for one profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LearnedProfile {
    pub locked: BTreeMap<String, StrategyId>,
    pub user_locked: Vec<String>,
    pub blocked: BTreeMap<String, Vec<StrategyId>>,
    pub user_blocked: BTreeMap<String, Vec<StrategyId>>,
}

/// UI aggregate keyed by profile name. Older UIs still read `udp`, which
/// mirrors `quic`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LearnedData {
    pub profiles: BTreeMap<String, LearnedProfile>,
    pub history: BTreeMap<String, BTreeMap<StrategyId, HistoryStat>>,
}

impl LearnedData {
    pub fn profile(&self, profile: TrafficProfile) -> Option<&LearnedProfile> {
        self.profiles.get(profile.as_str())
    }

    pub fn total_locked(&self) -> usize {
        TrafficProfile::ALL
            .iter()
            .filter_map(|p| self.profile(*p))
            .map(|p| p.locked.len())
            .sum()
    }
}

pub(super) fn collect(policy: &StrategyPolicy) -> LearnedData {
    let mut profiles = BTreeMap::new();
    for profile in TrafficProfile::ALL {
        let learned = LearnedProfile {
            locked: policy.locked().get_all(profile),
            user_locked: policy.locked().user_locked_hosts(profile),
            blocked: policy.blocked().get_all(profile),
            user_blocked: policy.blocked().get_user_blocked(profile),
        };
        profiles.insert(profile.as_str().to_string(), learned);
    }

    if let Some(quic) = profiles.get(TrafficProfile::Quic.as_str()).cloned() {
        profiles.insert(paths::LEGACY_UDP_PROFILE.to_string(), quic);
    }

    LearnedData {
        profiles,
        history: policy.locked().history().snapshot(),
    }
}
