use crate::handler::BotGateway;
use crate::intents::{self, IntentsInput};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Delay function for reconnect pacing: `(last_delay, attempts) -> delay`.
pub type ReconnectDelayFn = Arc<dyn Fn(Duration, u32) -> Duration + Send + Sync>;

/// Negotiated transport compression scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Shared zlib stream over the whole connection
    ZlibStream,
    /// Declared but currently unsupported; every decode fails explicitly
    ZstdStream,
}

impl Compression {
    pub(crate) fn query_value(self) -> &'static str {
        match self {
            Compression::ZlibStream => "zlib-stream",
            Compression::ZstdStream => "zstd-stream",
        }
    }
}

/// Total shard count for the sharding plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaxShards {
    /// Use the count recommended by gateway discovery
    #[default]
    Auto,
    /// Fixed shard count (>= 1)
    Fixed(u16),
}

/// Identify-concurrency bucket count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Concurrency {
    /// Use the max concurrency reported by gateway discovery
    #[default]
    Auto,
    /// Fixed bucket count (>= 1)
    Fixed(u16),
}

/// Initial presence sent with each identify.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Presence {
    pub status: String,
    pub afk: bool,
    pub activities: Vec<Activity>,
}

impl Default for Presence {
    fn default() -> Self {
        Self {
            status: "online".to_string(),
            afk: false,
            activities: Vec::new(),
        }
    }
}

/// A single presence activity.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Activity {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Identify connection properties.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "gateway-shard-manager".to_string(),
            device: "gateway-shard-manager".to_string(),
        }
    }
}

/// Escape hatches for custom discovery and connect spacing.
#[derive(Debug, Clone, Default)]
pub struct OverrideOptions {
    /// Fixed gateway URL; skips discovery and query building
    pub url: Option<String>,
    /// Pre-supplied session info; skips the bot-gateway discovery call
    pub session_info: Option<BotGateway>,
    /// Append `?v=..&encoding=..&compress=..` to the URL.
    /// Defaults to true unless `url` or `session_info` is supplied.
    pub append_query: Option<bool>,
    /// Resume on the connect URL instead of the session's resume URL.
    /// Defaults to true when `url` or `session_info` is supplied.
    pub resume_url_is_gateway_url: Option<bool>,
    /// Spacing between fresh identifies within one bucket
    pub time_between_shard_connects: Option<Duration>,
}

/// Resolved-once configuration for the shard manager.
#[derive(Clone)]
pub struct GatewayConfig {
    /// Authentication token included in identify/resume payloads
    pub token: String,
    /// Attempt reconnection when a session drops
    pub auto_reconnect: bool,
    /// Transport compression to negotiate, if any
    pub compress: Option<Compression>,
    /// Identify-concurrency bucket count
    pub concurrency: Concurrency,
    /// Total shard count
    pub max_shards: MaxShards,
    /// First shard id of the contiguous range
    pub first_shard_id: u16,
    /// Last shard id of the contiguous range; defaults to `max_shards - 1`
    pub last_shard_id: Option<u16>,
    /// Explicit shard id list; takes precedence over the first/last range
    pub shard_ids: Vec<u16>,
    /// Canonical intents bitmask, resolved from whatever shape was supplied
    pub intents: u64,
    /// Drop privileged intents the application is not approved for
    pub remove_disallowed_intents: bool,
    /// Backoff function for reconnect pacing
    pub reconnect_delay: ReconnectDelayFn,
    /// Fresh-connect attempt budget; `None` is unbounded
    pub max_reconnect_attempts: Option<u32>,
    /// Resume attempt budget before falling back to a fresh identify
    pub max_resume_attempts: u32,
    /// Hard deadline on the socket-open to ready window
    pub connect_timeout: Duration,
    /// Member-list threshold above which guilds are considered large
    pub large_threshold: u32,
    /// Initial presence for each shard
    pub presence: Presence,
    /// Identify connection properties
    pub connection_properties: ConnectionProperties,
    /// Discovery/spacing escape hatches
    pub overrides: OverrideOptions,
    /// Warnings produced while resolving the configuration (unknown intent
    /// names, ...); surfaced by the manager once connected
    pub(crate) warnings: Vec<String>,
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("auto_reconnect", &self.auto_reconnect)
            .field("compress", &self.compress)
            .field("concurrency", &self.concurrency)
            .field("max_shards", &self.max_shards)
            .field("first_shard_id", &self.first_shard_id)
            .field("last_shard_id", &self.last_shard_id)
            .field("shard_ids", &self.shard_ids)
            .field("intents", &format_args!("{:#x}", self.intents))
            .field("remove_disallowed_intents", &self.remove_disallowed_intents)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("max_resume_attempts", &self.max_resume_attempts)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl GatewayConfig {
    /// Create a new builder for configuration.
    pub fn builder(token: impl Into<String>) -> GatewayConfigBuilder {
        GatewayConfigBuilder::new(token)
    }

    /// Effective spacing between fresh identifies within one bucket.
    pub fn connect_spacing(&self) -> Duration {
        self.overrides
            .time_between_shard_connects
            .unwrap_or(DEFAULT_CONNECT_SPACING)
    }

    /// Whether version/encoding/compress query parameters are appended.
    pub fn append_query(&self) -> bool {
        self.overrides.append_query.unwrap_or_else(|| {
            self.overrides.url.is_none() && self.overrides.session_info.is_none()
        })
    }

    /// Whether resumes reuse the connect URL instead of the resume URL.
    pub fn resume_url_is_gateway_url(&self) -> bool {
        self.overrides.resume_url_is_gateway_url.unwrap_or_else(|| {
            self.overrides.url.is_some() || self.overrides.session_info.is_some()
        })
    }
}

/// Default spacing between fresh identifies within one bucket.
pub const DEFAULT_CONNECT_SPACING: Duration = Duration::from_millis(5000);

/// Ceiling applied to the default reconnect-delay formula.
const DEFAULT_DELAY_CAP: Duration = Duration::from_secs(120);

/// Default reconnect delay: `(attempts + 1)^0.7 * 20s`, capped.
pub fn default_reconnect_delay(_last_delay: Duration, attempts: u32) -> Duration {
    let ms = ((attempts as f64) + 1.0).powf(0.7) * 20_000.0;
    Duration::from_millis(ms as u64).min(DEFAULT_DELAY_CAP)
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// A capability was requested without the intent bit it requires
    #[error("{capability} cannot be requested without the {intent} intent")]
    MissingIntent {
        capability: &'static str,
        intent: &'static str,
    },
    /// Invalid sharding parameters
    #[error("Invalid sharding configuration: {0}")]
    InvalidSharding(String),
    /// Invalid large-guild threshold
    #[error("Invalid large_threshold: {0} (must be between 50 and 250)")]
    InvalidLargeThreshold(u32),
    /// Invalid connect timeout
    #[error("Invalid connect_timeout: must be non-zero")]
    InvalidConnectTimeout,
}

/// Builder for [`GatewayConfig`].
pub struct GatewayConfigBuilder {
    token: String,
    auto_reconnect: bool,
    compress: Option<Compression>,
    concurrency: Concurrency,
    max_shards: MaxShards,
    first_shard_id: u16,
    last_shard_id: Option<u16>,
    shard_ids: Vec<u16>,
    intents: IntentsInput,
    remove_disallowed_intents: bool,
    request_all_members: bool,
    reconnect_delay: ReconnectDelayFn,
    max_reconnect_attempts: Option<u32>,
    max_resume_attempts: u32,
    connect_timeout: Duration,
    large_threshold: u32,
    presence: Presence,
    connection_properties: ConnectionProperties,
    overrides: OverrideOptions,
}

impl GatewayConfigBuilder {
    fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            auto_reconnect: true,
            compress: None,
            concurrency: Concurrency::Auto,
            max_shards: MaxShards::Auto,
            first_shard_id: 0,
            last_shard_id: None,
            shard_ids: Vec::new(),
            intents: IntentsInput::default(),
            remove_disallowed_intents: false,
            request_all_members: false,
            reconnect_delay: Arc::new(default_reconnect_delay),
            max_reconnect_attempts: None,
            max_resume_attempts: 10,
            connect_timeout: Duration::from_secs(30),
            large_threshold: 250,
            presence: Presence::default(),
            connection_properties: ConnectionProperties::default(),
            overrides: OverrideOptions::default(),
        }
    }

    /// Enable or disable automatic reconnection
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Negotiate transport compression
    pub fn compress(mut self, scheme: Compression) -> Self {
        self.compress = Some(scheme);
        self
    }

    /// Set the identify-concurrency bucket count
    pub fn concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the total shard count
    pub fn max_shards(mut self, max_shards: MaxShards) -> Self {
        self.max_shards = max_shards;
        self
    }

    /// Set the first shard id of the contiguous range
    pub fn first_shard_id(mut self, id: u16) -> Self {
        self.first_shard_id = id;
        self
    }

    /// Set the last shard id of the contiguous range
    pub fn last_shard_id(mut self, id: u16) -> Self {
        self.last_shard_id = Some(id);
        self
    }

    /// Set an explicit shard id list (takes precedence over first/last)
    pub fn shard_ids(mut self, ids: Vec<u16>) -> Self {
        self.shard_ids = ids;
        self
    }

    /// Set the intents (bitmask, named list, or sentinel set)
    pub fn intents(mut self, intents: IntentsInput) -> Self {
        self.intents = intents;
        self
    }

    /// Drop privileged intents the application is not approved for
    pub fn remove_disallowed_intents(mut self, enabled: bool) -> Self {
        self.remove_disallowed_intents = enabled;
        self
    }

    /// Request the full member list on startup (requires GUILD_MEMBERS)
    pub fn request_all_members(mut self, enabled: bool) -> Self {
        self.request_all_members = enabled;
        self
    }

    /// Set the reconnect delay function
    pub fn reconnect_delay(
        mut self,
        f: impl Fn(Duration, u32) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.reconnect_delay = Arc::new(f);
        self
    }

    /// Set the fresh-connect attempt budget (`None` = unbounded)
    pub fn max_reconnect_attempts(mut self, max: Option<u32>) -> Self {
        self.max_reconnect_attempts = max;
        self
    }

    /// Set the resume attempt budget
    pub fn max_resume_attempts(mut self, max: u32) -> Self {
        self.max_resume_attempts = max;
        self
    }

    /// Set the handshake deadline (socket open through ready)
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the large-guild member threshold
    pub fn large_threshold(mut self, threshold: u32) -> Self {
        self.large_threshold = threshold;
        self
    }

    /// Set the initial presence
    pub fn presence(mut self, presence: Presence) -> Self {
        self.presence = presence;
        self
    }

    /// Set the identify connection properties
    pub fn connection_properties(mut self, props: ConnectionProperties) -> Self {
        self.connection_properties = props;
        self
    }

    /// Set discovery/spacing overrides
    pub fn overrides(mut self, overrides: OverrideOptions) -> Self {
        self.overrides = overrides;
        self
    }

    /// Build the configuration with validation.
    ///
    /// Intents are resolved into one canonical bitmask here; capability
    /// checks against that bitmask fail synchronously, before any network
    /// call is made.
    pub fn build(self) -> Result<GatewayConfig, ConfigError> {
        let (intents, warnings) = self.intents.resolve();

        if self.request_all_members && intents & intents_bit_guild_members() == 0 {
            return Err(ConfigError::MissingIntent {
                capability: "request_all_members",
                intent: "GUILD_MEMBERS",
            });
        }

        if !(50..=250).contains(&self.large_threshold) {
            return Err(ConfigError::InvalidLargeThreshold(self.large_threshold));
        }

        if self.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidConnectTimeout);
        }

        if let MaxShards::Fixed(0) = self.max_shards {
            return Err(ConfigError::InvalidSharding(
                "max_shards must be >= 1".to_string(),
            ));
        }
        if let Concurrency::Fixed(0) = self.concurrency {
            return Err(ConfigError::InvalidSharding(
                "concurrency must be >= 1".to_string(),
            ));
        }

        if self.shard_ids.is_empty() {
            if let (MaxShards::Fixed(max), Some(last)) = (self.max_shards, self.last_shard_id) {
                if last >= max {
                    return Err(ConfigError::InvalidSharding(format!(
                        "last_shard_id {last} is out of range for {max} shards"
                    )));
                }
            }
            if let Some(last) = self.last_shard_id {
                if self.first_shard_id > last {
                    return Err(ConfigError::InvalidSharding(format!(
                        "first_shard_id {} > last_shard_id {last}",
                        self.first_shard_id
                    )));
                }
            }
        }

        Ok(GatewayConfig {
            token: self.token,
            auto_reconnect: self.auto_reconnect,
            compress: self.compress,
            concurrency: self.concurrency,
            max_shards: self.max_shards,
            first_shard_id: self.first_shard_id,
            last_shard_id: self.last_shard_id,
            shard_ids: self.shard_ids,
            intents,
            remove_disallowed_intents: self.remove_disallowed_intents,
            reconnect_delay: self.reconnect_delay,
            max_reconnect_attempts: self.max_reconnect_attempts,
            max_resume_attempts: self.max_resume_attempts,
            connect_timeout: self.connect_timeout,
            large_threshold: self.large_threshold,
            presence: self.presence,
            connection_properties: self.connection_properties,
            overrides: self.overrides,
            warnings,
        })
    }
}

fn intents_bit_guild_members() -> u64 {
    intents::bits::GUILD_MEMBERS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intents::bits;

    #[test]
    fn test_default_reconnect_delay_growth() {
        let d0 = default_reconnect_delay(Duration::ZERO, 0);
        let d1 = default_reconnect_delay(d0, 1);
        let d2 = default_reconnect_delay(d1, 2);
        assert_eq!(d0, Duration::from_millis(20_000));
        assert!(d1 > d0);
        assert!(d2 > d1);
    }

    #[test]
    fn test_default_reconnect_delay_is_capped() {
        let d = default_reconnect_delay(Duration::ZERO, 10_000);
        assert_eq!(d, Duration::from_secs(120));
    }

    #[test]
    fn test_builder_defaults() {
        let config = GatewayConfig::builder("token").build().expect("valid config");
        assert!(config.auto_reconnect);
        assert_eq!(config.max_shards, MaxShards::Auto);
        assert_eq!(config.concurrency, Concurrency::Auto);
        assert_eq!(config.max_resume_attempts, 10);
        assert_eq!(config.max_reconnect_attempts, None);
        assert_eq!(config.connect_spacing(), Duration::from_millis(5000));
        assert_eq!(config.intents, crate::intents::ALL_NON_PRIVILEGED);
        assert!(config.append_query());
        assert!(!config.resume_url_is_gateway_url());
    }

    #[test]
    fn test_request_all_members_requires_intent() {
        let result = GatewayConfig::builder("token")
            .intents(IntentsInput::Bits(bits::GUILDS))
            .request_all_members(true)
            .build();
        assert!(matches!(result, Err(ConfigError::MissingIntent { .. })));

        let ok = GatewayConfig::builder("token")
            .intents(IntentsInput::Bits(bits::GUILDS | bits::GUILD_MEMBERS))
            .request_all_members(true)
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn test_builder_rejects_zero_shards() {
        assert!(GatewayConfig::builder("t")
            .max_shards(MaxShards::Fixed(0))
            .build()
            .is_err());
        assert!(GatewayConfig::builder("t")
            .concurrency(Concurrency::Fixed(0))
            .build()
            .is_err());
    }

    #[test]
    fn test_builder_rejects_bad_range() {
        let result = GatewayConfig::builder("t")
            .max_shards(MaxShards::Fixed(4))
            .last_shard_id(7)
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidSharding(_))));

        let result = GatewayConfig::builder("t")
            .first_shard_id(5)
            .last_shard_id(2)
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidSharding(_))));
    }

    #[test]
    fn test_builder_rejects_bad_large_threshold() {
        assert!(GatewayConfig::builder("t").large_threshold(10).build().is_err());
        assert!(GatewayConfig::builder("t").large_threshold(500).build().is_err());
        assert!(GatewayConfig::builder("t").large_threshold(250).build().is_ok());
    }

    #[test]
    fn test_url_override_flips_query_defaults() {
        let config = GatewayConfig::builder("t")
            .overrides(OverrideOptions {
                url: Some("wss://gateway.example.test".to_string()),
                ..Default::default()
            })
            .build()
            .expect("valid config");
        assert!(!config.append_query());
        assert!(config.resume_url_is_gateway_url());
    }

    #[test]
    fn test_spacing_override() {
        let config = GatewayConfig::builder("t")
            .overrides(OverrideOptions {
                time_between_shard_connects: Some(Duration::ZERO),
                ..Default::default()
            })
            .build()
            .expect("valid config");
        assert_eq!(config.connect_spacing(), Duration::ZERO);
    }

    #[test]
    fn test_unknown_intent_name_recorded_as_warning() {
        let config = GatewayConfig::builder("t")
            .intents(IntentsInput::Named(vec!["GUILDS".into(), "BOGUS".into()]))
            .build()
            .expect("valid config");
        assert_eq!(config.intents, bits::GUILDS);
        assert_eq!(config.warnings.len(), 1);
    }
}
