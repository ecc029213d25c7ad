//! # gateway-shard-manager
//!
//! The connection layer of a real-time event-streaming client: manages a set
//! of sharded WebSocket gateway sessions with rate-limited connect admission,
//! heartbeating, and resume/reconnect handling.
//!
//! ## Features
//!
//! - **Sharding** with an auto-resolved or fixed plan, and guild routing
//! - **Identify rate limiting** per concurrency bucket with configurable spacing
//! - **Session resumption** with bounded resume/reconnect budgets and backoff
//! - **Heartbeating** with jittered start and missed-ack detection
//! - **Transport compression** (shared zlib stream)
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use gateway_shard_manager::{GatewayConfig, GatewayHandler, ShardManager};
//!
//! struct MyHandler;
//!
//! impl GatewayHandler for MyHandler {
//!     // ... wire up gateway discovery and dispatch handling
//! }
//!
//! let config = GatewayConfig::builder("token")
//!     .build()?;
//!
//! let manager = ShardManager::new(config, MyHandler);
//! let mut events = manager.events().unwrap();
//! manager.connect().await?;
//! ```

mod compression;
mod config;
mod error;
mod handler;
mod intents;
mod manager;
mod metrics;
mod protocol;
mod queue;
mod shard;

pub use config::{
    default_reconnect_delay, Activity, Compression, Concurrency, ConfigError,
    ConnectionProperties, GatewayConfig, GatewayConfigBuilder, MaxShards, OverrideOptions,
    Presence, ReconnectDelayFn, DEFAULT_CONNECT_SPACING,
};
pub use error::{Error, ErrorKind};
pub use handler::{BotGateway, DispatchEvent, GatewayHandler};
pub use intents::{bits, IntentsInput, ALL, ALL_NON_PRIVILEGED};
pub use manager::{shard_index, ManagerEvent, ShardManager, ShardingPlan};
pub use metrics::{Metrics, MetricsSnapshot, ShardMetrics};
pub use protocol::{close_policy, ClosePolicy, GatewayPayload, GATEWAY_VERSION};
pub use shard::ShardStatus;

/// Result type for gateway-shard-manager operations
pub type Result<T> = std::result::Result<T, Error>;
