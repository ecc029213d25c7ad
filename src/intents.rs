//! Event-subscription intents.
//!
//! Intents can be supplied as a raw bitmask, a list of names, or one of two
//! sentinel sets. Whatever the input shape, it is parsed exactly once at
//! config-build time into a canonical `u64` bitmask.

/// Named intent bits.
pub mod bits {
    pub const GUILDS: u64 = 1 << 0;
    pub const GUILD_MEMBERS: u64 = 1 << 1;
    pub const GUILD_MODERATION: u64 = 1 << 2;
    pub const GUILD_EXPRESSIONS: u64 = 1 << 3;
    pub const GUILD_INTEGRATIONS: u64 = 1 << 4;
    pub const GUILD_WEBHOOKS: u64 = 1 << 5;
    pub const GUILD_INVITES: u64 = 1 << 6;
    pub const GUILD_VOICE_STATES: u64 = 1 << 7;
    pub const GUILD_PRESENCES: u64 = 1 << 8;
    pub const GUILD_MESSAGES: u64 = 1 << 9;
    pub const GUILD_MESSAGE_REACTIONS: u64 = 1 << 10;
    pub const GUILD_MESSAGE_TYPING: u64 = 1 << 11;
    pub const DIRECT_MESSAGES: u64 = 1 << 12;
    pub const DIRECT_MESSAGE_REACTIONS: u64 = 1 << 13;
    pub const DIRECT_MESSAGE_TYPING: u64 = 1 << 14;
    pub const MESSAGE_CONTENT: u64 = 1 << 15;
    pub const GUILD_SCHEDULED_EVENTS: u64 = 1 << 16;
    pub const AUTO_MODERATION_CONFIGURATION: u64 = 1 << 20;
    pub const AUTO_MODERATION_EXECUTION: u64 = 1 << 21;
}

/// Application feature flags that authorize privileged intents.
pub mod app_flags {
    pub const GATEWAY_PRESENCE: u64 = 1 << 12;
    pub const GATEWAY_PRESENCE_LIMITED: u64 = 1 << 13;
    pub const GATEWAY_GUILD_MEMBERS: u64 = 1 << 14;
    pub const GATEWAY_GUILD_MEMBERS_LIMITED: u64 = 1 << 15;
    pub const GATEWAY_MESSAGE_CONTENT: u64 = 1 << 18;
    pub const GATEWAY_MESSAGE_CONTENT_LIMITED: u64 = 1 << 19;
}

const NAMED: &[(&str, u64)] = &[
    ("GUILDS", bits::GUILDS),
    ("GUILD_MEMBERS", bits::GUILD_MEMBERS),
    ("GUILD_MODERATION", bits::GUILD_MODERATION),
    ("GUILD_EXPRESSIONS", bits::GUILD_EXPRESSIONS),
    ("GUILD_INTEGRATIONS", bits::GUILD_INTEGRATIONS),
    ("GUILD_WEBHOOKS", bits::GUILD_WEBHOOKS),
    ("GUILD_INVITES", bits::GUILD_INVITES),
    ("GUILD_VOICE_STATES", bits::GUILD_VOICE_STATES),
    ("GUILD_PRESENCES", bits::GUILD_PRESENCES),
    ("GUILD_MESSAGES", bits::GUILD_MESSAGES),
    ("GUILD_MESSAGE_REACTIONS", bits::GUILD_MESSAGE_REACTIONS),
    ("GUILD_MESSAGE_TYPING", bits::GUILD_MESSAGE_TYPING),
    ("DIRECT_MESSAGES", bits::DIRECT_MESSAGES),
    ("DIRECT_MESSAGE_REACTIONS", bits::DIRECT_MESSAGE_REACTIONS),
    ("DIRECT_MESSAGE_TYPING", bits::DIRECT_MESSAGE_TYPING),
    ("MESSAGE_CONTENT", bits::MESSAGE_CONTENT),
    ("GUILD_SCHEDULED_EVENTS", bits::GUILD_SCHEDULED_EVENTS),
    (
        "AUTO_MODERATION_CONFIGURATION",
        bits::AUTO_MODERATION_CONFIGURATION,
    ),
    ("AUTO_MODERATION_EXECUTION", bits::AUTO_MODERATION_EXECUTION),
];

/// All defined intents.
pub const ALL: u64 = {
    let mut v = 0;
    let mut i = 0;
    while i < NAMED.len() {
        v |= NAMED[i].1;
        i += 1;
    }
    v
};

/// Intents that require no prior platform approval.
pub const ALL_NON_PRIVILEGED: u64 =
    ALL & !(bits::GUILD_MEMBERS | bits::GUILD_PRESENCES | bits::MESSAGE_CONTENT);

/// Privileged intent -> application flags, any one of which authorizes it.
pub const PRIVILEGED: &[(u64, &str, &[u64])] = &[
    (
        bits::GUILD_MEMBERS,
        "GUILD_MEMBERS",
        &[
            app_flags::GATEWAY_GUILD_MEMBERS,
            app_flags::GATEWAY_GUILD_MEMBERS_LIMITED,
        ],
    ),
    (
        bits::GUILD_PRESENCES,
        "GUILD_PRESENCES",
        &[
            app_flags::GATEWAY_PRESENCE,
            app_flags::GATEWAY_PRESENCE_LIMITED,
        ],
    ),
    (
        bits::MESSAGE_CONTENT,
        "MESSAGE_CONTENT",
        &[
            app_flags::GATEWAY_MESSAGE_CONTENT,
            app_flags::GATEWAY_MESSAGE_CONTENT_LIMITED,
        ],
    ),
];

/// Intent input shapes accepted at configuration time.
#[derive(Debug, Clone)]
pub enum IntentsInput {
    /// Raw bitmask
    Bits(u64),
    /// Named intents; unknown names are skipped with a warning
    Named(Vec<String>),
    /// Every defined intent, privileged included
    All,
    /// Every non-privileged intent
    AllNonPrivileged,
}

impl Default for IntentsInput {
    fn default() -> Self {
        IntentsInput::AllNonPrivileged
    }
}

impl IntentsInput {
    /// Resolve to a canonical bitmask.
    ///
    /// Returns the bitmask and a warning for each unrecognized name.
    pub fn resolve(&self) -> (u64, Vec<String>) {
        match self {
            IntentsInput::Bits(mask) => (*mask, Vec::new()),
            IntentsInput::All => (ALL, Vec::new()),
            IntentsInput::AllNonPrivileged => (ALL_NON_PRIVILEGED, Vec::new()),
            IntentsInput::Named(names) => {
                let mut mask = 0u64;
                let mut warnings = Vec::new();
                for name in names {
                    if name == "ALL" {
                        mask = ALL;
                        break;
                    }
                    if name == "ALL_NON_PRIVILEGED" {
                        mask |= ALL_NON_PRIVILEGED;
                        continue;
                    }
                    match NAMED.iter().find(|(n, _)| n == name) {
                        Some((_, bit)) => mask |= bit,
                        None => warnings.push(format!("Unknown intent: {name}")),
                    }
                }
                (mask, warnings)
            }
        }
    }
}

/// Clear privileged intents not authorized by `flags`.
///
/// Returns the filtered mask and the names of every removed intent.
pub fn remove_disallowed(mask: u64, flags: u64) -> (u64, Vec<&'static str>) {
    let mut out = mask;
    let mut removed = Vec::new();
    for (bit, name, allowed) in PRIVILEGED {
        if out & bit == *bit && !allowed.iter().any(|f| flags & f == *f) {
            out &= !bit;
            removed.push(*name);
        }
    }
    (out, removed)
}

/// Whether any privileged intent bit is present in `mask`.
pub fn has_privileged(mask: u64) -> bool {
    PRIVILEGED.iter().any(|(bit, _, _)| mask & bit == *bit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_parsing() {
        let input = IntentsInput::Named(vec!["GUILDS".into(), "GUILD_MESSAGES".into()]);
        let (mask, warnings) = input.resolve();
        assert_eq!(mask, bits::GUILDS | bits::GUILD_MESSAGES);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_unknown_name_warns() {
        let input = IntentsInput::Named(vec!["GUILDS".into(), "GUILD_TYPOS".into()]);
        let (mask, warnings) = input.resolve();
        assert_eq!(mask, bits::GUILDS);
        assert_eq!(warnings, vec!["Unknown intent: GUILD_TYPOS".to_string()]);
    }

    #[test]
    fn test_all_sentinel_overrides() {
        let input = IntentsInput::Named(vec!["GUILDS".into(), "ALL".into()]);
        assert_eq!(input.resolve().0, ALL);
    }

    #[test]
    fn test_all_non_privileged_excludes_privileged() {
        assert_eq!(ALL_NON_PRIVILEGED & bits::GUILD_MEMBERS, 0);
        assert_eq!(ALL_NON_PRIVILEGED & bits::GUILD_PRESENCES, 0);
        assert_eq!(ALL_NON_PRIVILEGED & bits::MESSAGE_CONTENT, 0);
        assert_ne!(ALL_NON_PRIVILEGED & bits::GUILDS, 0);
    }

    #[test]
    fn test_remove_disallowed() {
        let mask = bits::GUILDS | bits::GUILD_MEMBERS | bits::MESSAGE_CONTENT;
        // Only members is authorized (limited flag counts)
        let flags = app_flags::GATEWAY_GUILD_MEMBERS_LIMITED;
        let (filtered, removed) = remove_disallowed(mask, flags);
        assert_eq!(filtered, bits::GUILDS | bits::GUILD_MEMBERS);
        assert_eq!(removed, vec!["MESSAGE_CONTENT"]);
    }

    #[test]
    fn test_remove_disallowed_noop_without_privileged() {
        let (filtered, removed) = remove_disallowed(bits::GUILDS, 0);
        assert_eq!(filtered, bits::GUILDS);
        assert!(removed.is_empty());
    }

    #[test]
    fn test_has_privileged() {
        assert!(has_privileged(bits::GUILD_PRESENCES));
        assert!(!has_privileged(bits::GUILDS | bits::GUILD_INVITES));
    }
}
