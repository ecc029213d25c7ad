use crate::error::Error;
use std::future::Future;

/// Bot-gateway metadata returned by the authenticated request layer.
#[derive(Debug, Clone)]
pub struct BotGateway {
    /// Resolved gateway URL
    pub url: String,
    /// Recommended shard count, if reported
    pub shards: Option<u16>,
    /// Maximum identify concurrency, if reported
    pub max_concurrency: Option<u16>,
}

/// A decoded dispatch frame handed to the dispatch layer.
///
/// The manager does not interpret these beyond the handshake events it needs
/// for its own state machine; turning them into cached entities and typed
/// application events is the dispatch layer's job.
#[derive(Debug, Clone)]
pub struct DispatchEvent {
    /// Event name (e.g. `MESSAGE_CREATE`)
    pub name: String,
    /// Raw event payload
    pub data: serde_json::Value,
    /// Gateway sequence number of this event
    pub sequence: Option<u64>,
}

/// Trait users implement to wire the manager to its external collaborators.
///
/// Discovery methods are backed by the authenticated request layer;
/// `on_dispatch` feeds the payload-dispatch layer. The manager handles
/// connection lifecycle, identify rate limiting, heartbeating, and
/// resume/reconnect on its own.
pub trait GatewayHandler: Send + Sync + 'static {
    /// Fetch the plain gateway URL.
    fn get_gateway(&self) -> impl Future<Output = Result<String, Error>> + Send;

    /// Fetch bot-gateway metadata (URL, recommended shards, max concurrency).
    ///
    /// Called when shard count or concurrency is configured as auto.
    fn get_bot_gateway(&self) -> impl Future<Output = Result<BotGateway, Error>> + Send;

    /// Fetch the application's enabled feature flags.
    ///
    /// Only called when `remove_disallowed_intents` is enabled and a
    /// privileged intent is requested.
    fn get_application_flags(&self) -> impl Future<Output = Result<u64, Error>> + Send {
        async {
            Err(Error::Discovery(
                "application flag lookup is not implemented by this handler".to_string(),
            ))
        }
    }

    /// Called for every dispatch frame a shard receives.
    fn on_dispatch(
        &self,
        shard_id: u16,
        event: DispatchEvent,
    ) -> impl Future<Output = ()> + Send;
}
