//! Text encodings of persisted values.

use super::StrategyId;
use std::collections::BTreeSet;

/// Value stored for user-lock and other presence markers.
pub const MARKER: &str = "true";

/// Locked ids are stored as plain decimal text. JSON numbers are accepted too.
pub fn decode_strategy(raw: &str) -> Option<StrategyId> {
    let raw = raw.trim();
    let id = raw.parse::<StrategyId>().ok().or_else(|| {
        serde_json::from_str::<serde_json::Value>(raw)
            .ok()
            .and_then(|v| strategy_from_json(&v))
    })?;
    (id >= 1).then_some(id)
}

pub fn encode_strategy(id: StrategyId) -> String {
    id.to_string()
}

/// Blocked-id sets are JSON arrays. A lone number is read as a one-element set.
pub fn decode_ids(raw: &str) -> Option<BTreeSet<StrategyId>> {
    let value: serde_json::Value = serde_json::from_str(raw.trim()).ok()?;
    ids_from_json(&value)
}

pub fn ids_from_json(value: &serde_json::Value) -> Option<BTreeSet<StrategyId>> {
    match value {
        serde_json::Value::Array(items) => items.iter().map(strategy_from_json).collect(),
        other => strategy_from_json(other).map(|id| BTreeSet::from([id])),
    }
}

pub fn encode_ids<'a>(ids: impl IntoIterator<Item = &'a StrategyId>) -> String {
    let ids: Vec<StrategyId> = ids.into_iter().copied().collect();
    serde_json::to_string(&ids).unwrap_or_else(|_| "[]".to_string())
}

pub fn strategy_from_json(value: &serde_json::Value) -> Option<StrategyId> {
    let id = match value {
        serde_json::Value::Number(n) => n.as_u64()?,
        serde_json::Value::String(s) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    StrategyId::try_from(id).ok().filter(|id| *id >= 1)
}
