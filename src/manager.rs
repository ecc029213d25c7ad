//! The shard manager: plan resolution, connect admission, readiness
//! aggregation, and guild routing.
//!
//! The manager owns one task per shard plus an internal event loop that
//! reacts to shard lifecycle notifications. Shards ask for connect slots
//! through the queue; the manager admits them per concurrency bucket and
//! aggregates their per-shard readiness into manager-level events.

use crate::config::{Concurrency, GatewayConfig, MaxShards};
use crate::error::Error;
use crate::handler::GatewayHandler;
use crate::intents;
use crate::metrics::Metrics;
use crate::protocol;
use crate::queue::{ConnectKind, ConnectQueue};
use crate::shard::{ShardCommand, ShardEvent, ShardRunner, ShardStatus};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long to wait before re-draining the queue when entries were skipped.
const QUEUE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Lifecycle notifications surfaced to the embedding application.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// Every spawned shard holds a ready session
    Ready,
    /// The last remaining ready shard went down
    Disconnect,
    /// A shard established a session via identify
    ShardReady(u16),
    /// A shard replayed a previous session
    ShardResume(u16),
    /// A shard sent its identify and is waiting for acknowledgement
    ShardPreReady(u16),
    /// A shard's connection ended; `error` is `None` for requested disconnects
    ShardDisconnect { id: u16, error: Option<String> },
    /// Non-fatal problem worth surfacing (unknown intent names, dropped
    /// disallowed intents, ...)
    Warn { shard: Option<u16>, message: String },
}

/// The sharding plan resolved by [`ShardManager::connect`].
#[derive(Debug, Clone)]
pub struct ShardingPlan {
    /// Total shard count guild routing is computed against
    pub max_shards: u16,
    /// Identify-concurrency bucket count
    pub concurrency: u16,
    /// Shard ids managed by this process
    pub shard_ids: Vec<u16>,
    /// Fully-built connect URL
    pub gateway_url: String,
}

struct ShardHandle {
    commands: mpsc::UnboundedSender<ShardCommand>,
    status: ShardStatus,
    /// Whether the runner still holds a resumable session identity.
    has_session: bool,
    task: JoinHandle<()>,
}

struct ManagerState {
    shards: HashMap<u16, ShardHandle>,
    queue: ConnectQueue,
    plan: Option<ShardingPlan>,
    connected: bool,
    ready: bool,
    start_time: Option<Instant>,
}

struct Inner<H> {
    handler: Arc<H>,
    config: RwLock<Arc<GatewayConfig>>,
    metrics: Arc<Metrics>,
    state: RwLock<ManagerState>,
    events_tx: mpsc::UnboundedSender<ManagerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ManagerEvent>>>,
    shard_events_tx: mpsc::UnboundedSender<ShardEvent>,
    shard_events_rx: Mutex<Option<mpsc::UnboundedReceiver<ShardEvent>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    retry_pending: AtomicBool,
}

/// Manages the full set of shard connections.
///
/// Cheap to clone; all clones share the same state.
pub struct ShardManager<H> {
    inner: Arc<Inner<H>>,
}

impl<H> Clone for ShardManager<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Map a guild id to the shard responsible for it.
pub fn shard_index(guild_id: u64, max_shards: u16) -> u16 {
    ((guild_id >> 22) % u64::from(max_shards.max(1))) as u16
}

impl<H: GatewayHandler> ShardManager<H> {
    /// Create a manager from a validated configuration and a handler wiring
    /// it to discovery and dispatch.
    pub fn new(config: GatewayConfig, handler: H) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shard_events_tx, shard_events_rx) = mpsc::unbounded_channel();
        let spacing = config.connect_spacing();
        Self {
            inner: Arc::new(Inner {
                handler: Arc::new(handler),
                config: RwLock::new(Arc::new(config)),
                metrics: Arc::new(Metrics::new()),
                state: RwLock::new(ManagerState {
                    shards: HashMap::new(),
                    queue: ConnectQueue::new(1, spacing),
                    plan: None,
                    connected: false,
                    ready: false,
                    start_time: None,
                }),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                shard_events_tx,
                shard_events_rx: Mutex::new(Some(shard_events_rx)),
                event_loop: Mutex::new(None),
                retry_pending: AtomicBool::new(false),
            }),
        }
    }

    /// Take the manager event stream. Returns `None` after the first call.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<ManagerEvent>> {
        self.inner.events_rx.lock().take()
    }

    /// Resolve the sharding plan, spawn every shard, and start draining the
    /// connect queue.
    ///
    /// Fails without side effects when discovery fails or required plan
    /// fields are missing; fails with [`Error::AlreadyConnected`] when
    /// called on an active manager.
    pub async fn connect(&self) -> Result<(), Error> {
        let inner = &self.inner;
        if inner.state.read().connected {
            return Err(Error::AlreadyConnected);
        }

        let base = inner.config.read().clone();
        let needs_discovery =
            matches!(base.max_shards, MaxShards::Auto) || matches!(base.concurrency, Concurrency::Auto);

        let mut session_info = base.overrides.session_info.clone();
        if needs_discovery && session_info.is_none() {
            session_info = Some(inner.handler.get_bot_gateway().await?);
        }

        let raw_url = if let Some(url) = base.overrides.url.clone() {
            url
        } else if let Some(info) = &session_info {
            info.url.clone()
        } else {
            inner.handler.get_gateway().await?
        };
        let gateway_url = build_gateway_url(&base, raw_url);

        for warning in &base.warnings {
            warn!("{warning}");
            inner.emit(ManagerEvent::Warn {
                shard: None,
                message: warning.clone(),
            });
        }

        let mut effective = (*base).clone();
        if effective.remove_disallowed_intents && intents::has_privileged(effective.intents) {
            let flags = inner.handler.get_application_flags().await?;
            let (mask, removed) = intents::remove_disallowed(effective.intents, flags);
            for name in removed {
                let message = format!("removing disallowed privileged intent {name}");
                warn!("{message}");
                inner.emit(ManagerEvent::Warn {
                    shard: None,
                    message,
                });
            }
            effective.intents = mask;
        }

        let max_shards = match effective.max_shards {
            MaxShards::Fixed(n) => n,
            MaxShards::Auto => session_info
                .as_ref()
                .and_then(|info| info.shards)
                .ok_or(Error::AutoShardingFailed(
                    "discovery did not report a recommended shard count",
                ))?,
        };
        let concurrency = match effective.concurrency {
            Concurrency::Fixed(n) => n,
            Concurrency::Auto => session_info
                .as_ref()
                .and_then(|info| info.max_concurrency)
                .ok_or(Error::AutoShardingFailed(
                    "discovery did not report a max concurrency",
                ))?,
        };
        let shard_ids: Vec<u16> = if effective.shard_ids.is_empty() {
            let last = effective.last_shard_id.unwrap_or(max_shards.saturating_sub(1));
            (effective.first_shard_id..=last).collect()
        } else {
            let mut ids = effective.shard_ids.clone();
            ids.sort_unstable();
            ids.dedup();
            ids
        };

        effective.max_shards = MaxShards::Fixed(max_shards);
        effective.concurrency = Concurrency::Fixed(concurrency);
        let spacing = effective.connect_spacing();
        *inner.config.write() = Arc::new(effective);

        info!(
            "starting {} shard(s) of {max_shards} across {concurrency} bucket(s)",
            shard_ids.len()
        );

        {
            let mut state = inner.state.write();
            if state.connected {
                return Err(Error::AlreadyConnected);
            }
            state.connected = true;
            state.plan = Some(ShardingPlan {
                max_shards,
                concurrency,
                shard_ids: shard_ids.clone(),
                gateway_url,
            });
            state.queue = ConnectQueue::new(concurrency, spacing);
        }
        self.ensure_event_loop();

        for id in shard_ids {
            self.spawn(id)?;
        }
        Inner::try_connect(&self.inner);
        Ok(())
    }

    /// Spawn a shard task and queue it for connection. Idempotent: a shard
    /// that already exists is only re-queued if it is disconnected.
    pub fn spawn(&self, shard_id: u16) -> Result<(), Error> {
        let inner = &self.inner;
        let config = inner.config.read().clone();
        {
            let mut state = inner.state.write();
            let plan = state.plan.as_ref().ok_or(Error::PlanUnresolved)?;
            let (max_shards, gateway_url) = (plan.max_shards, plan.gateway_url.clone());

            if !state.shards.contains_key(&shard_id) {
                let (commands_tx, commands_rx) = mpsc::unbounded_channel();
                let runner = ShardRunner::new(
                    shard_id,
                    max_shards,
                    gateway_url,
                    config,
                    Arc::clone(&inner.handler),
                    Arc::clone(&inner.metrics),
                    commands_rx,
                    inner.shard_events_tx.clone(),
                );
                let task = tokio::spawn(runner.run());
                state.shards.insert(
                    shard_id,
                    ShardHandle {
                        commands: commands_tx,
                        status: ShardStatus::Disconnected,
                        has_session: false,
                        task,
                    },
                );
                inner.metrics.update_shard(shard_id, |_| {});
                debug!("[SHARD-{shard_id}] spawned");
            }

            let (status, has_session) = {
                let handle = &state.shards[&shard_id];
                (handle.status, handle.has_session)
            };
            if status == ShardStatus::Disconnected {
                // A shard holding a session identity re-enters as a resume so
                // it is not charged fresh-connect spacing.
                state.queue.enqueue(
                    shard_id,
                    if has_session {
                        ConnectKind::Resume
                    } else {
                        ConnectKind::Fresh
                    },
                );
            }
        }
        Inner::try_connect(inner);
        Ok(())
    }

    /// Disconnect every shard. With `reconnect`, shards are re-queued and the
    /// manager stays active; without it, the manager returns to the state
    /// where `connect()` may be called again.
    pub fn disconnect(&self, reconnect: bool) {
        let mut state = self.inner.state.write();
        if !reconnect {
            state.connected = false;
        }
        state.queue.clear();
        for (id, handle) in &state.shards {
            if handle.commands.send(ShardCommand::Disconnect { reconnect }).is_err() {
                debug!("[SHARD-{id}] already gone");
            }
        }
    }

    /// The shard responsible for a guild, or `None` before the plan is
    /// resolved.
    pub fn shard_for(&self, guild_id: u64) -> Option<u16> {
        let state = self.inner.state.read();
        let plan = state.plan.as_ref()?;
        Some(shard_index(guild_id, plan.max_shards))
    }

    /// The resolved sharding plan, if `connect()` has completed.
    pub fn plan(&self) -> Option<ShardingPlan> {
        self.inner.state.read().plan.clone()
    }

    /// Whether `connect()` has been called and not torn down.
    pub fn is_connected(&self) -> bool {
        self.inner.state.read().connected
    }

    /// Whether every spawned shard currently holds a ready session.
    pub fn is_ready(&self) -> bool {
        self.inner.state.read().ready
    }

    /// Time since all shards last became ready.
    pub fn uptime(&self) -> Option<Duration> {
        self.inner.state.read().start_time.map(|t| t.elapsed())
    }

    /// Current status of a single shard.
    pub fn shard_status(&self, shard_id: u16) -> Option<ShardStatus> {
        self.inner
            .state
            .read()
            .shards
            .get(&shard_id)
            .map(|h| h.status)
    }

    /// Current status of every spawned shard.
    pub fn shard_statuses(&self) -> HashMap<u16, ShardStatus> {
        self.inner
            .state
            .read()
            .shards
            .iter()
            .map(|(id, h)| (*id, h.status))
            .collect()
    }

    /// Connection and heartbeat metrics.
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.inner.metrics)
    }

    fn ensure_event_loop(&self) {
        let mut slot = self.inner.event_loop.lock();
        if slot.is_some() {
            return;
        }
        let Some(mut shard_events) = self.inner.shard_events_rx.lock().take() else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(async move {
            while let Some(event) = shard_events.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                Inner::handle_shard_event(&inner, event);
            }
        }));
    }
}

impl<H: GatewayHandler> Inner<H> {
    fn emit(&self, event: ManagerEvent) {
        let _ = self.events_tx.send(event);
    }

    fn set_status(&self, shard_id: u16, status: ShardStatus) {
        if let Some(handle) = self.state.write().shards.get_mut(&shard_id) {
            handle.status = status;
        }
    }

    fn handle_shard_event(inner: &Arc<Self>, event: ShardEvent) {
        match event {
            ShardEvent::Resuming { id } => inner.set_status(id, ShardStatus::Resuming),
            ShardEvent::PreReady { id } => {
                inner.set_status(id, ShardStatus::PreReady);
                inner.emit(ManagerEvent::ShardPreReady(id));
            }
            ShardEvent::Ready { id } => Self::shard_became_ready(inner, id, false),
            ShardEvent::Resumed { id } => Self::shard_became_ready(inner, id, true),
            ShardEvent::Disconnected { id, error, resumable } => {
                let fire_disconnect = {
                    let mut state = inner.state.write();
                    if let Some(handle) = state.shards.get_mut(&id) {
                        handle.status = ShardStatus::Disconnected;
                        handle.has_session = resumable;
                    }
                    let any_ready = state
                        .shards
                        .values()
                        .any(|h| h.status == ShardStatus::Ready);
                    if !any_ready && state.ready {
                        state.ready = false;
                        state.start_time = None;
                        true
                    } else {
                        false
                    }
                };
                inner.emit(ManagerEvent::ShardDisconnect { id, error });
                if fire_disconnect {
                    info!("last ready shard disconnected");
                    inner.emit(ManagerEvent::Disconnect);
                }
                // The disconnect may have freed a concurrency bucket.
                Self::try_connect(inner);
            }
            ShardEvent::ConnectRequest { id, resume } => {
                {
                    let mut state = inner.state.write();
                    if !state.connected || !state.shards.contains_key(&id) {
                        return;
                    }
                    state.queue.enqueue(
                        id,
                        if resume {
                            ConnectKind::Resume
                        } else {
                            ConnectKind::Fresh
                        },
                    );
                }
                Self::try_connect(inner);
            }
        }
    }

    fn shard_became_ready(inner: &Arc<Self>, id: u16, resumed: bool) {
        let fire_ready = {
            let mut state = inner.state.write();
            if let Some(handle) = state.shards.get_mut(&id) {
                handle.status = ShardStatus::Ready;
                handle.has_session = true;
            }
            let all_ready = !state.shards.is_empty()
                && state.shards.values().all(|h| h.status == ShardStatus::Ready);
            if all_ready && !state.ready {
                state.ready = true;
                state.start_time = Some(Instant::now());
                true
            } else {
                false
            }
        };
        inner.emit(if resumed {
            ManagerEvent::ShardResume(id)
        } else {
            ManagerEvent::ShardReady(id)
        });
        if fire_ready {
            info!("all shards ready");
            inner.emit(ManagerEvent::Ready);
        }
        Self::try_connect(inner);
    }

    /// Drain the connect queue, excluding buckets with a shard mid-connect.
    /// When entries remain, exactly one retry timer is scheduled.
    fn try_connect(inner: &Arc<Self>) {
        let pending = {
            let mut state = inner.state.write();
            if !state.connected || state.queue.is_empty() {
                return;
            }

            let mid_connect: Vec<u16> = state
                .shards
                .iter()
                .filter(|(_, h)| h.status.is_mid_connect())
                .map(|(id, _)| *id)
                .collect();
            let busy_keys: HashSet<u16> = mid_connect
                .iter()
                .map(|id| state.queue.bucket_key(*id))
                .collect();

            let admitted = state.queue.drain(|key| busy_keys.contains(&key));
            for entry in &admitted {
                if let Some(handle) = state.shards.get_mut(&entry.shard_id) {
                    if handle.commands.send(ShardCommand::Connect).is_ok() {
                        handle.status = ShardStatus::Connecting;
                        debug!("[SHARD-{}] admitted for connect", entry.shard_id);
                    } else {
                        warn!("[SHARD-{}] task is gone, dropping connect slot", entry.shard_id);
                    }
                }
            }
            !state.queue.is_empty()
        };
        if pending {
            Self::schedule_retry(inner);
        }
    }

    fn schedule_retry(inner: &Arc<Self>) {
        if inner.retry_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            tokio::time::sleep(QUEUE_RETRY_DELAY).await;
            if let Some(inner) = weak.upgrade() {
                inner.retry_pending.store(false, Ordering::SeqCst);
                Self::try_connect(&inner);
            }
        });
    }
}

impl<H> Drop for Inner<H> {
    fn drop(&mut self) {
        if let Some(task) = self.event_loop.get_mut().take() {
            task.abort();
        }
        for handle in self.state.get_mut().shards.values() {
            handle.task.abort();
        }
    }
}

/// Strip any existing query, then append version/encoding/compress
/// parameters unless the configuration says otherwise.
fn build_gateway_url(config: &GatewayConfig, mut url: String) -> String {
    if !config.append_query() {
        return url;
    }
    if let Some(idx) = url.find('?') {
        url.truncate(idx);
    }
    while url.ends_with('/') {
        url.pop();
    }
    url.push_str(&format!("/?v={}&encoding=json", protocol::GATEWAY_VERSION));
    if let Some(scheme) = config.compress {
        url.push_str(&format!("&compress={}", scheme.query_value()));
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Compression, OverrideOptions};
    use crate::handler::{BotGateway, DispatchEvent};

    struct StubHandler {
        bot_gateway: Option<BotGateway>,
    }

    impl StubHandler {
        fn with_plan(shards: Option<u16>, max_concurrency: Option<u16>) -> Self {
            Self {
                bot_gateway: Some(BotGateway {
                    url: "wss://gateway.test".to_string(),
                    shards,
                    max_concurrency,
                }),
            }
        }
    }

    impl GatewayHandler for StubHandler {
        async fn get_gateway(&self) -> Result<String, Error> {
            Ok("wss://gateway.test".to_string())
        }

        async fn get_bot_gateway(&self) -> Result<BotGateway, Error> {
            self.bot_gateway
                .clone()
                .ok_or_else(|| Error::Discovery("bot gateway unavailable".to_string()))
        }

        async fn on_dispatch(&self, _shard_id: u16, _event: DispatchEvent) {}
    }

    fn test_config() -> GatewayConfig {
        GatewayConfig::builder("token")
            .auto_reconnect(false)
            .build()
            .expect("valid config")
    }

    impl<H: GatewayHandler> ShardManager<H> {
        /// Install fake shard handles so aggregation can be driven without
        /// real connections.
        fn install_test_shards(&self, ids: &[u16]) {
            let mut state = self.inner.state.write();
            state.connected = true;
            state.plan = Some(ShardingPlan {
                max_shards: ids.len() as u16,
                concurrency: 1,
                shard_ids: ids.to_vec(),
                gateway_url: "wss://gateway.test/?v=10&encoding=json".to_string(),
            });
            state.queue = ConnectQueue::new(1, Duration::ZERO);
            for &id in ids {
                let (commands_tx, mut commands_rx) = mpsc::unbounded_channel();
                let task = tokio::spawn(async move { while commands_rx.recv().await.is_some() {} });
                state.shards.insert(
                    id,
                    ShardHandle {
                        commands: commands_tx,
                        status: ShardStatus::Disconnected,
                        has_session: false,
                        task,
                    },
                );
            }
        }
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<ManagerEvent>) -> Vec<ManagerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_shard_index_routing() {
        assert_eq!(shard_index(175928847299117063, 16), 4);
        assert_eq!(shard_index(175928847299117063, 5), 1);
        // Same guild always routes to the same shard.
        assert_eq!(shard_index(175928847299117063, 16), shard_index(175928847299117063, 16));
        // Ids below 2^22 collapse to shard 0.
        assert_eq!(shard_index(1, 16), 0);
        assert_eq!(shard_index(1 << 22, 2), 1);
    }

    #[test]
    fn test_build_gateway_url() {
        let config = test_config();
        assert_eq!(
            build_gateway_url(&config, "wss://gateway.test".to_string()),
            "wss://gateway.test/?v=10&encoding=json"
        );
        // An existing query is replaced, not duplicated.
        assert_eq!(
            build_gateway_url(&config, "wss://gateway.test/?v=9".to_string()),
            "wss://gateway.test/?v=10&encoding=json"
        );
    }

    #[test]
    fn test_build_gateway_url_with_compression() {
        let config = GatewayConfig::builder("token")
            .compress(Compression::ZlibStream)
            .build()
            .expect("valid config");
        assert_eq!(
            build_gateway_url(&config, "wss://gateway.test".to_string()),
            "wss://gateway.test/?v=10&encoding=json&compress=zlib-stream"
        );
    }

    #[test]
    fn test_build_gateway_url_skipped_for_overrides() {
        let config = GatewayConfig::builder("token")
            .overrides(OverrideOptions {
                url: Some("wss://custom.test/path".to_string()),
                ..Default::default()
            })
            .build()
            .expect("valid config");
        assert_eq!(
            build_gateway_url(&config, "wss://custom.test/path".to_string()),
            "wss://custom.test/path"
        );
    }

    #[tokio::test]
    async fn test_spawn_requires_plan() {
        let manager = ShardManager::new(test_config(), StubHandler::with_plan(Some(1), Some(1)));
        assert!(matches!(manager.spawn(0), Err(Error::PlanUnresolved)));
    }

    #[tokio::test]
    async fn test_connect_rejects_double_connect() {
        let manager = ShardManager::new(test_config(), StubHandler::with_plan(Some(1), Some(1)));
        manager.install_test_shards(&[0]);
        assert!(matches!(
            manager.connect().await,
            Err(Error::AlreadyConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_fails_without_discovery_fields() {
        let manager = ShardManager::new(test_config(), StubHandler::with_plan(None, Some(1)));
        assert!(matches!(
            manager.connect().await,
            Err(Error::AutoShardingFailed(_))
        ));
        assert!(!manager.is_connected());

        let manager = ShardManager::new(test_config(), StubHandler::with_plan(Some(2), None));
        assert!(matches!(
            manager.connect().await,
            Err(Error::AutoShardingFailed(_))
        ));
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_connect_resolves_auto_plan() {
        let manager = ShardManager::new(test_config(), StubHandler::with_plan(Some(5), Some(1)));
        manager.connect().await.expect("connect succeeds");

        let plan = manager.plan().expect("plan resolved");
        assert_eq!(plan.max_shards, 5);
        assert_eq!(plan.concurrency, 1);
        assert_eq!(plan.shard_ids, vec![0, 1, 2, 3, 4]);
        assert_eq!(plan.gateway_url, "wss://gateway.test/?v=10&encoding=json");

        assert!(manager.is_connected());
        assert!(!manager.is_ready());
        assert_eq!(manager.shard_statuses().len(), 5);
        assert_eq!(manager.shard_for(175928847299117063), Some(1));

        manager.disconnect(false);
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_shard_for_undefined_before_connect() {
        let manager = ShardManager::new(test_config(), StubHandler::with_plan(Some(1), Some(1)));
        assert_eq!(manager.shard_for(175928847299117063), None);
    }

    #[tokio::test]
    async fn test_explicit_shard_ids_sorted_and_deduped() {
        let config = GatewayConfig::builder("token")
            .auto_reconnect(false)
            .max_shards(MaxShards::Fixed(8))
            .concurrency(Concurrency::Fixed(2))
            .shard_ids(vec![5, 1, 5, 3])
            .build()
            .expect("valid config");
        let manager = ShardManager::new(config, StubHandler::with_plan(Some(8), Some(2)));
        manager.connect().await.expect("connect succeeds");
        assert_eq!(manager.plan().expect("plan").shard_ids, vec![1, 3, 5]);
        manager.disconnect(false);
    }

    #[tokio::test]
    async fn test_ready_aggregation_lifecycle() {
        let manager = ShardManager::new(test_config(), StubHandler::with_plan(Some(2), Some(1)));
        let mut events = manager.events().expect("first take");
        manager.install_test_shards(&[0, 1]);

        Inner::handle_shard_event(&manager.inner, ShardEvent::Ready { id: 0 });
        assert!(!manager.is_ready());
        let first = drain_events(&mut events);
        assert!(matches!(first.as_slice(), [ManagerEvent::ShardReady(0)]));

        Inner::handle_shard_event(&manager.inner, ShardEvent::Ready { id: 1 });
        assert!(manager.is_ready());
        assert!(manager.uptime().is_some());
        let second = drain_events(&mut events);
        assert!(matches!(
            second.as_slice(),
            [ManagerEvent::ShardReady(1), ManagerEvent::Ready]
        ));

        // One shard dropping does not fire the manager-level disconnect.
        Inner::handle_shard_event(
            &manager.inner,
            ShardEvent::Disconnected {
                id: 0,
                error: None,
                resumable: false,
            },
        );
        assert!(manager.is_ready());
        let third = drain_events(&mut events);
        assert!(matches!(
            third.as_slice(),
            [ManagerEvent::ShardDisconnect { id: 0, error: None }]
        ));

        // The last ready shard going down does.
        Inner::handle_shard_event(
            &manager.inner,
            ShardEvent::Disconnected {
                id: 1,
                error: None,
                resumable: false,
            },
        );
        assert!(!manager.is_ready());
        assert!(manager.uptime().is_none());
        let fourth = drain_events(&mut events);
        assert!(matches!(
            fourth.as_slice(),
            [
                ManagerEvent::ShardDisconnect { id: 1, error: None },
                ManagerEvent::Disconnect
            ]
        ));

        // Readiness can be regained, firing ready again.
        Inner::handle_shard_event(&manager.inner, ShardEvent::Resumed { id: 0 });
        Inner::handle_shard_event(&manager.inner, ShardEvent::Resumed { id: 1 });
        assert!(manager.is_ready());
        let fifth = drain_events(&mut events);
        assert!(matches!(
            fifth.as_slice(),
            [
                ManagerEvent::ShardResume(0),
                ManagerEvent::ShardResume(1),
                ManagerEvent::Ready
            ]
        ));
    }

    #[tokio::test]
    async fn test_ready_fires_once_per_ready_period() {
        let manager = ShardManager::new(test_config(), StubHandler::with_plan(Some(1), Some(1)));
        let mut events = manager.events().expect("first take");
        manager.install_test_shards(&[0]);

        Inner::handle_shard_event(&manager.inner, ShardEvent::Ready { id: 0 });
        Inner::handle_shard_event(&manager.inner, ShardEvent::Ready { id: 0 });
        let ready_count = drain_events(&mut events)
            .iter()
            .filter(|e| matches!(e, ManagerEvent::Ready))
            .count();
        assert_eq!(ready_count, 1);
    }

    #[tokio::test]
    async fn test_connect_request_admits_and_marks_connecting() {
        let manager = ShardManager::new(test_config(), StubHandler::with_plan(Some(1), Some(1)));
        manager.install_test_shards(&[0]);

        Inner::handle_shard_event(
            &manager.inner,
            ShardEvent::ConnectRequest { id: 0, resume: true },
        );
        assert_eq!(manager.shard_status(0), Some(ShardStatus::Connecting));
    }

    #[tokio::test]
    async fn test_connect_request_ignored_when_not_connected() {
        let manager = ShardManager::new(test_config(), StubHandler::with_plan(Some(1), Some(1)));
        manager.install_test_shards(&[0]);
        manager.disconnect(false);

        Inner::handle_shard_event(
            &manager.inner,
            ShardEvent::ConnectRequest { id: 0, resume: false },
        );
        assert_eq!(manager.shard_status(0), Some(ShardStatus::Disconnected));
    }

    #[tokio::test]
    async fn test_busy_bucket_defers_admission() {
        let manager = ShardManager::new(test_config(), StubHandler::with_plan(Some(2), Some(1)));
        manager.install_test_shards(&[0, 1]);

        Inner::handle_shard_event(
            &manager.inner,
            ShardEvent::ConnectRequest { id: 0, resume: false },
        );
        assert_eq!(manager.shard_status(0), Some(ShardStatus::Connecting));

        // Shard 1 shares the only bucket with mid-connect shard 0.
        Inner::handle_shard_event(
            &manager.inner,
            ShardEvent::ConnectRequest { id: 1, resume: false },
        );
        assert_eq!(manager.shard_status(1), Some(ShardStatus::Disconnected));

        // Once shard 0 is ready the bucket frees up and the queue re-drains.
        Inner::handle_shard_event(&manager.inner, ShardEvent::Ready { id: 0 });
        assert_eq!(manager.shard_status(1), Some(ShardStatus::Connecting));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_timer_readmits_spacing_blocked_shard() {
        let manager = ShardManager::new(test_config(), StubHandler::with_plan(Some(2), Some(1)));
        manager.install_test_shards(&[0, 1]);
        let spacing = Duration::from_millis(5000);
        manager.inner.state.write().queue = ConnectQueue::new(1, spacing);

        // Shard 0 takes the only bucket and stamps its spacing window.
        Inner::handle_shard_event(
            &manager.inner,
            ShardEvent::ConnectRequest { id: 0, resume: false },
        );
        assert_eq!(manager.shard_status(0), Some(ShardStatus::Connecting));
        Inner::handle_shard_event(&manager.inner, ShardEvent::Ready { id: 0 });

        // Shard 1 is blocked by the window, which arms the retry timer.
        Inner::handle_shard_event(
            &manager.inner,
            ShardEvent::ConnectRequest { id: 1, resume: false },
        );
        assert_eq!(manager.shard_status(1), Some(ShardStatus::Disconnected));
        assert!(manager.inner.retry_pending.load(Ordering::SeqCst));

        // Further blocked drains must not arm a second timer.
        Inner::try_connect(&manager.inner);
        assert!(manager.inner.retry_pending.load(Ordering::SeqCst));

        // The timer re-drains every 500ms until the window elapses.
        for _ in 0..11 {
            tokio::time::advance(QUEUE_RETRY_DELAY).await;
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
        }
        assert_eq!(manager.shard_status(1), Some(ShardStatus::Connecting));
        assert!(!manager.inner.retry_pending.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_requeues_resume_when_session_survives() {
        let manager = ShardManager::new(test_config(), StubHandler::with_plan(Some(1), Some(1)));
        manager.install_test_shards(&[0]);
        manager.inner.state.write().queue = ConnectQueue::new(1, Duration::from_millis(5000));

        Inner::handle_shard_event(
            &manager.inner,
            ShardEvent::ConnectRequest { id: 0, resume: false },
        );
        Inner::handle_shard_event(&manager.inner, ShardEvent::Ready { id: 0 });
        Inner::handle_shard_event(
            &manager.inner,
            ShardEvent::Disconnected {
                id: 0,
                error: Some("connection reset".to_string()),
                resumable: true,
            },
        );
        assert_eq!(manager.shard_status(0), Some(ShardStatus::Disconnected));

        // The surviving session re-enters as a resume, exempt from the
        // still-open spacing window.
        manager.spawn(0).expect("spawn");
        assert_eq!(manager.shard_status(0), Some(ShardStatus::Connecting));

        // Without a session the same path is charged as a fresh connect and
        // waits out the window.
        Inner::handle_shard_event(
            &manager.inner,
            ShardEvent::Disconnected {
                id: 0,
                error: None,
                resumable: false,
            },
        );
        manager.spawn(0).expect("spawn");
        assert_eq!(manager.shard_status(0), Some(ShardStatus::Disconnected));
    }

    #[tokio::test]
    async fn test_events_taken_once() {
        let manager = ShardManager::new(test_config(), StubHandler::with_plan(Some(1), Some(1)));
        assert!(manager.events().is_some());
        assert!(manager.events().is_none());
    }
}
