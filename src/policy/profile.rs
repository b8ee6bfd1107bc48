use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Traffic classification bucket. Strategy state is partitioned by profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficProfile {
    Tls,
    Http,
    Quic,
    Discord,
    Wireguard,
    Mtproto,
    Dns,
    Stun,
    Unknown,
}

/// Historical profile names that now resolve to a current profile.
pub const LEGACY_PROFILE_ALIASES: &[(&str, TrafficProfile)] = &[("udp", TrafficProfile::Quic)];

impl TrafficProfile {
    pub const ALL: [TrafficProfile; 9] = [
        TrafficProfile::Tls,
        TrafficProfile::Http,
        TrafficProfile::Quic,
        TrafficProfile::Discord,
        TrafficProfile::Wireguard,
        TrafficProfile::Mtproto,
        TrafficProfile::Dns,
        TrafficProfile::Stun,
        TrafficProfile::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TrafficProfile::Tls => "tls",
            TrafficProfile::Http => "http",
            TrafficProfile::Quic => "quic",
            TrafficProfile::Discord => "discord",
            TrafficProfile::Wireguard => "wireguard",
            TrafficProfile::Mtproto => "mtproto",
            TrafficProfile::Dns => "dns",
            TrafficProfile::Stun => "stun",
            TrafficProfile::Unknown => "unknown",
        }
    }

    /// TCP profiles are keyed by hostname; the rest accept IP literals too.
    pub fn is_tcp(self) -> bool {
        matches!(
            self,
            TrafficProfile::Tls | TrafficProfile::Http | TrafficProfile::Mtproto
        )
    }

    /// Like `from_str`, but returns `None` for names that are neither current
    /// nor legacy instead of falling back to `Unknown`.
    pub fn parse_known(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        if let Some(profile) = Self::ALL.iter().find(|p| p.as_str() == name) {
            return Some(*profile);
        }
        LEGACY_PROFILE_ALIASES
            .iter()
            .find(|(alias, _)| *alias == name)
            .map(|(_, profile)| *profile)
    }
}

impl FromStr for TrafficProfile {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse_known(s).unwrap_or(TrafficProfile::Unknown))
    }
}

impl fmt::Display for TrafficProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lowercased, trimmed, trailing dots stripped. Applied on every read and write.
pub fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_partition() {
        let tcp: Vec<_> = TrafficProfile::ALL
            .iter()
            .filter(|p| p.is_tcp())
            .map(|p| p.as_str())
            .collect();
        assert_eq!(tcp, vec!["tls", "http", "mtproto"]);
    }

    #[test]
    fn test_parse_resolves_legacy_alias() {
        assert_eq!("udp".parse::<TrafficProfile>().unwrap(), TrafficProfile::Quic);
        assert_eq!(" TLS ".parse::<TrafficProfile>().unwrap(), TrafficProfile::Tls);
        assert_eq!(
            "carrier-pigeon".parse::<TrafficProfile>().unwrap(),
            TrafficProfile::Unknown
        );
        assert_eq!(TrafficProfile::parse_known("carrier-pigeon"), None);
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("  WWW.YouTube.COM.. "), "www.youtube.com");
        assert_eq!(normalize_host("1.2.3.4"), "1.2.3.4");
        assert_eq!(normalize_host("."), "");
    }
}
