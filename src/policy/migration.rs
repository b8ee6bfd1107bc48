//! Upgrades from the two legacy on-disk schemas.
//!
//! 1. Flat blobs: one JSON object per `(kind, profile)` under [`paths::LEGACY`],
//!    keyed by host. Rewritten as one key per host under the per-profile path.
//! 2. The undifferentiated `udp` profile, now `quic`.
//!
//! Both steps are no-ops once the legacy keys are gone.

use super::codec;
use super::defaults::DefaultBlockedDomains;
use super::paths::{self, Namespace};
use super::profile::{normalize_host, TrafficProfile};
use crate::backend::KvBackend;
use std::collections::BTreeSet;
use tracing::{info, warn};

/// How a migrated entry combines with a current per-host entry. Legacy data
/// never replaces what is already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Merge {
    KeepExisting,
    UnionIds,
}

/// Profile names that may carry legacy data, with the profile they now map to.
fn legacy_profile_names() -> impl Iterator<Item = (&'static str, TrafficProfile)> {
    TrafficProfile::ALL
        .into_iter()
        .map(|p| (p.as_str(), p))
        .chain(std::iter::once((paths::LEGACY_UDP_PROFILE, TrafficProfile::Quic)))
}

/// Migrates both locked namespaces. Returns the number of entries moved.
pub fn migrate_locked(backend: &dyn KvBackend) -> usize {
    let mut moved = 0;
    for (name, profile) in legacy_profile_names() {
        moved += migrate_flat_blob(
            backend,
            Namespace::Locked,
            name,
            profile,
            Merge::KeepExisting,
            |_, v| codec::strategy_from_json(v).map(codec::encode_strategy),
        );
        moved += migrate_flat_blob(
            backend,
            Namespace::LockedUser,
            name,
            profile,
            Merge::KeepExisting,
            |_, v| marker_from_json(v).then(|| codec::MARKER.to_string()),
        );
        moved += migrate_user_list(backend, Namespace::LockedUser, name, profile);
    }
    moved += migrate_udp_profile(backend, Namespace::Locked, Merge::KeepExisting);
    moved += migrate_udp_profile(backend, Namespace::LockedUser, Merge::KeepExisting);
    moved
}

/// Migrates both blocked namespaces, dropping ids implied by the defaults.
pub fn migrate_blocked(backend: &dyn KvBackend, defaults: &DefaultBlockedDomains) -> usize {
    let mut moved = 0;
    for ns in [Namespace::Blocked, Namespace::BlockedUser] {
        for (name, profile) in legacy_profile_names() {
            moved += migrate_flat_blob(backend, ns, name, profile, Merge::UnionIds, |host, v| {
                let ids: BTreeSet<_> = codec::ids_from_json(v)?
                    .into_iter()
                    .filter(|id| !(profile.is_tcp() && defaults.is_default_blocked(host, *id)))
                    .collect();
                (!ids.is_empty()).then(|| codec::encode_ids(&ids))
            });
        }
        moved += migrate_udp_profile(backend, ns, Merge::UnionIds);
    }
    moved
}

fn marker_from_json(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Null => false,
        _ => true,
    }
}

/// Rewrites one legacy JSON object into per-host keys. `convert` returns the
/// value to persist, or `None` to skip the entry. The legacy key is removed
/// only after every entry was written.
fn migrate_flat_blob<F>(
    backend: &dyn KvBackend,
    ns: Namespace,
    legacy_name: &str,
    profile: TrafficProfile,
    merge: Merge,
    convert: F,
) -> usize
where
    F: Fn(&str, &serde_json::Value) -> Option<String>,
{
    let legacy_key = ns.legacy_key(legacy_name);
    let raw = match backend.read(paths::LEGACY, &legacy_key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return 0,
        Err(e) => {
            warn!("Failed to read legacy key {}: {}", legacy_key, e);
            return 0;
        }
    };

    let object = match serde_json::from_str::<serde_json::Value>(&raw) {
        Ok(serde_json::Value::Object(object)) => object,
        // Lists are handled by `migrate_user_list`.
        Ok(serde_json::Value::Array(_)) => return 0,
        Ok(_) | Err(_) => {
            warn!("Legacy key {} is not a JSON object; leaving it in place", legacy_key);
            return 0;
        }
    };

    let target = ns.path(profile);
    let mut written = 0;
    let mut failed = false;
    for (host, value) in &object {
        let host = normalize_host(host);
        if host.is_empty() {
            continue;
        }
        let Some(encoded) = convert(&host, value) else {
            continue;
        };
        let Some(encoded) = merge_with_existing(backend, &target, &host, encoded, merge) else {
            written += 1;
            continue;
        };
        match backend.write(&target, &host, &encoded) {
            Ok(()) => written += 1,
            Err(e) => {
                warn!("Failed to migrate {} into {}: {}", host, target, e);
                failed = true;
            }
        }
    }

    if failed {
        return written;
    }
    if let Err(e) = backend.delete(paths::LEGACY, &legacy_key) {
        warn!("Failed to delete legacy key {}: {}", legacy_key, e);
    }
    info!(
        "Migrated {} entries from legacy {} into {}",
        written, legacy_key, target
    );
    written
}

/// User markers were sometimes stored as a plain list of hosts.
fn migrate_user_list(
    backend: &dyn KvBackend,
    ns: Namespace,
    legacy_name: &str,
    profile: TrafficProfile,
) -> usize {
    let legacy_key = ns.legacy_key(legacy_name);
    let Ok(Some(raw)) = backend.read(paths::LEGACY, &legacy_key) else {
        return 0;
    };
    let Ok(serde_json::Value::Array(hosts)) = serde_json::from_str::<serde_json::Value>(&raw)
    else {
        return 0;
    };

    let target = ns.path(profile);
    let mut written = 0;
    for host in hosts.iter().filter_map(|h| h.as_str()).map(normalize_host) {
        if host.is_empty() {
            continue;
        }
        if let Err(e) = backend.write(&target, &host, codec::MARKER) {
            warn!("Failed to migrate user marker {} into {}: {}", host, target, e);
            return written;
        }
        written += 1;
    }

    if let Err(e) = backend.delete(paths::LEGACY, &legacy_key) {
        warn!("Failed to delete legacy key {}: {}", legacy_key, e);
    }
    info!(
        "Migrated {} user markers from legacy {} into {}",
        written, legacy_key, target
    );
    written
}

/// Combines a migrated value with whatever already sits at `target/key`.
/// `None` means the existing value stays and nothing is written.
fn merge_with_existing(
    backend: &dyn KvBackend,
    target: &str,
    key: &str,
    value: String,
    merge: Merge,
) -> Option<String> {
    let existing = backend.read(target, key).ok().flatten();
    match (merge, existing) {
        (_, None) => Some(value),
        (Merge::KeepExisting, Some(_)) => None,
        (Merge::UnionIds, Some(current)) => {
            let mut ids = codec::decode_ids(&current).unwrap_or_default();
            ids.extend(codec::decode_ids(&value).unwrap_or_default());
            Some(codec::encode_ids(&ids))
        }
    }
}

/// Moves every key under `<ns>/udp` to `<ns>/quic`, deleting each legacy key
/// once it has been copied.
fn migrate_udp_profile(backend: &dyn KvBackend, ns: Namespace, merge: Merge) -> usize {
    let source = ns.raw_path(paths::LEGACY_UDP_PROFILE);
    let entries = match backend.enumerate(&source) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Failed to enumerate {}: {}", source, e);
            return 0;
        }
    };
    if entries.is_empty() {
        return 0;
    }

    let target = ns.path(TrafficProfile::Quic);
    let mut moved = 0;
    for (key, value) in entries {
        if let Some(merged) = merge_with_existing(backend, &target, &key, value, merge) {
            if let Err(e) = backend.write(&target, &key, &merged) {
                warn!("Failed to copy {} from {} to {}: {}", key, source, target, e);
                continue;
            }
        }
        if let Err(e) = backend.delete(&source, &key) {
            warn!("Failed to delete {} from {}: {}", key, source, e);
            continue;
        }
        moved += 1;
    }

    info!("Migrated {} entries from {} to {}", moved, source, target);
    moved
}
