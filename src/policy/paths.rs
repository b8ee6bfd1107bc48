//! Backend path layout.

use super::TrafficProfile;

pub const HISTORY: &str = "history";
pub const LEGACY: &str = "legacy";
pub const LEGACY_UDP_PROFILE: &str = "udp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Locked,
    LockedUser,
    Blocked,
    BlockedUser,
}

impl Namespace {
    pub fn prefix(self) -> &'static str {
        match self {
            Namespace::Locked => "locked",
            Namespace::LockedUser => "locked_user",
            Namespace::Blocked => "blocked",
            Namespace::BlockedUser => "blocked_user",
        }
    }

    /// Per-profile path, e.g. `blocked/tls`.
    pub fn path(self, profile: TrafficProfile) -> String {
        self.raw_path(profile.as_str())
    }

    /// Per-profile path for a profile name that may no longer exist.
    pub fn raw_path(self, profile_name: &str) -> String {
        format!("{}/{}", self.prefix(), profile_name)
    }

    /// Key of the legacy single-blob entry under [`LEGACY`].
    pub fn legacy_key(self, profile_name: &str) -> String {
        format!("{}_{}", self.prefix(), profile_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        assert_eq!(Namespace::Blocked.path(TrafficProfile::Tls), "blocked/tls");
        assert_eq!(Namespace::LockedUser.raw_path("udp"), "locked_user/udp");
        assert_eq!(Namespace::BlockedUser.legacy_key("quic"), "blocked_user_quic");
    }
}
