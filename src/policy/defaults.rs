use super::StrategyId;
use rustc_hash::FxHashSet;
use std::sync::OnceLock;

/// Strategy id that is forbidden for every default-blocked domain.
pub const DEFAULT_BLOCKED_STRATEGY: StrategyId = 1;

const BUILTIN_DOMAINS: &[&str] = &[
    "youtube.com",
    "youtu.be",
    "googlevideo.com",
    "ytimg.com",
    "ggpht.com",
    "discord.com",
    "discord.gg",
    "discordapp.com",
    "discordapp.net",
    "discord.media",
    "facebook.com",
    "fbcdn.net",
    "instagram.com",
    "cdninstagram.com",
    "twitter.com",
    "x.com",
    "twimg.com",
    "telegram.org",
    "t.me",
    "linkedin.com",
    "rutracker.org",
    "soundcloud.com",
];

/// Apex domains for which strategy 1 is always blocked.
#[derive(Debug)]
pub struct DefaultBlockedDomains {
    domains: FxHashSet<&'static str>,
}

impl DefaultBlockedDomains {
    pub fn builtin() -> &'static Self {
        static BUILTIN: OnceLock<DefaultBlockedDomains> = OnceLock::new();
        BUILTIN.get_or_init(|| Self {
            domains: BUILTIN_DOMAINS.iter().copied().collect(),
        })
    }

    /// True when `host` is a listed domain or a subdomain of one.
    /// `host` must already be normalized.
    pub fn contains(&self, host: &str) -> bool {
        let mut part = host;
        loop {
            if self.domains.contains(part) {
                return true;
            }

            match part.find('.') {
                Some(idx) => {
                    part = &part[idx + 1..];
                    if part.is_empty() {
                        return false;
                    }
                }
                None => return false,
            }
        }
    }

    pub fn is_default_blocked(&self, host: &str, strategy: StrategyId) -> bool {
        strategy == DEFAULT_BLOCKED_STRATEGY && self.contains(host)
    }

    /// Apex domains in a stable order.
    pub fn iter(&self) -> impl Iterator<Item = &'static str> {
        BUILTIN_DOMAINS.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffix_match() {
        let defaults = DefaultBlockedDomains::builtin();

        assert!(defaults.contains("discord.com"));
        assert!(defaults.contains("cdn.discord.com"));
        assert!(defaults.contains("a.b.googlevideo.com"));

        // Label boundary matters
        assert!(!defaults.contains("notdiscord.com"));
        assert!(!defaults.contains("com"));
        assert!(!defaults.contains("example.org"));
    }

    #[test]
    fn test_only_strategy_one_is_default_blocked() {
        let defaults = DefaultBlockedDomains::builtin();
        assert!(defaults.is_default_blocked("facebook.com", 1));
        assert!(!defaults.is_default_blocked("facebook.com", 2));
        assert!(!defaults.is_default_blocked("example.com", 1));
    }

    #[test]
    fn test_iter_matches_set() {
        let defaults = DefaultBlockedDomains::builtin();
        assert_eq!(defaults.iter().count(), defaults.len());
        assert!(defaults.iter().all(|d| defaults.contains(d)));
    }
}
