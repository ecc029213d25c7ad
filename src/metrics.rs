use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Metrics for observability
///
/// Counters and gauges covering connection churn and heartbeat health.
/// Use `snapshot()` for a point-in-time view of everything, or the
/// individual getters for single values.
#[derive(Debug, Default)]
pub struct Metrics {
    connects_total: AtomicU64,
    resumes_total: AtomicU64,
    reconnects_total: AtomicU64,
    heartbeats_sent_total: AtomicU64,
    heartbeat_acks_total: AtomicU64,
    dispatches_total: AtomicU64,
    invalid_sessions_total: AtomicU64,
    errors_total: AtomicU64,

    /// Per-shard metrics
    shard_metrics: RwLock<Vec<ShardMetrics>>,
}

/// Metrics for a single shard
#[derive(Debug, Clone)]
pub struct ShardMetrics {
    /// Shard identifier
    pub shard_id: u16,
    /// Whether the shard currently holds a ready session
    pub is_ready: bool,
    /// Round-trip time of the last acknowledged heartbeat
    pub latency: Option<Duration>,
    /// Duration since the session was last established
    pub time_since_connected: Option<Duration>,
    /// Consecutive resume attempts for the current outage
    pub resume_attempt: u32,
    /// Consecutive fresh-connect attempts for the current outage
    pub reconnect_attempt: u32,
    /// Total time spent with an established session
    pub total_uptime: Duration,
    #[doc(hidden)]
    pub(crate) last_connected_at: Option<Instant>,
}

impl Default for ShardMetrics {
    fn default() -> Self {
        Self {
            shard_id: 0,
            is_ready: false,
            latency: None,
            time_since_connected: None,
            resume_attempt: 0,
            reconnect_attempt: 0,
            total_uptime: Duration::ZERO,
            last_connected_at: None,
        }
    }
}

impl ShardMetrics {
    fn snapshot(&self) -> ShardMetrics {
        ShardMetrics {
            time_since_connected: self.last_connected_at.map(|t| t.elapsed()),
            ..self.clone()
        }
    }
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Total sessions established (identify or resume)
    pub fn connects(&self) -> u64 {
        self.connects_total.load(Ordering::Relaxed)
    }

    /// Total successful resumes
    pub fn resumes(&self) -> u64 {
        self.resumes_total.load(Ordering::Relaxed)
    }

    /// Total reconnection attempts scheduled
    pub fn reconnects(&self) -> u64 {
        self.reconnects_total.load(Ordering::Relaxed)
    }

    /// Total heartbeats sent
    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent_total.load(Ordering::Relaxed)
    }

    /// Total heartbeat acknowledgments received
    pub fn heartbeat_acks(&self) -> u64 {
        self.heartbeat_acks_total.load(Ordering::Relaxed)
    }

    /// Total dispatch frames received
    pub fn dispatches(&self) -> u64 {
        self.dispatches_total.load(Ordering::Relaxed)
    }

    /// Total invalid-session signals received
    pub fn invalid_sessions(&self) -> u64 {
        self.invalid_sessions_total.load(Ordering::Relaxed)
    }

    /// Total transport/protocol errors
    pub fn errors(&self) -> u64 {
        self.errors_total.load(Ordering::Relaxed)
    }

    // ========== Recording methods (called internally) ==========

    pub(crate) fn record_connect(&self) {
        self.connects_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resume(&self) {
        self.resumes_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnect(&self) {
        self.reconnects_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_sent(&self) {
        self.heartbeats_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_ack(&self) {
        self.heartbeat_acks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dispatch(&self) {
        self.dispatches_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalid_session(&self) {
        self.invalid_sessions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Update metrics for a specific shard
    pub(crate) fn update_shard(&self, shard_id: u16, update_fn: impl FnOnce(&mut ShardMetrics)) {
        let mut shards = self.shard_metrics.write();

        while shards.len() <= shard_id as usize {
            let id = shards.len() as u16;
            shards.push(ShardMetrics {
                shard_id: id,
                ..Default::default()
            });
        }

        update_fn(&mut shards[shard_id as usize]);
    }

    /// Get a snapshot of all shard metrics with computed durations
    pub fn shard_metrics(&self) -> Vec<ShardMetrics> {
        self.shard_metrics.read().iter().map(|s| s.snapshot()).collect()
    }

    /// Latency of a single shard's last acknowledged heartbeat.
    pub fn shard_latency(&self, shard_id: u16) -> Option<Duration> {
        self.shard_metrics
            .read()
            .get(shard_id as usize)
            .and_then(|s| s.latency)
    }

    /// Number of shards currently holding a ready session
    pub fn ready_shards(&self) -> usize {
        self.shard_metrics
            .read()
            .iter()
            .filter(|s| s.is_ready)
            .count()
    }

    /// Get a point-in-time snapshot of all metrics for export
    pub fn snapshot(&self) -> MetricsSnapshot {
        let shards = self.shard_metrics.read();
        let shard_snapshots: Vec<ShardMetrics> = shards.iter().map(|s| s.snapshot()).collect();

        MetricsSnapshot {
            connects_total: self.connects_total.load(Ordering::Acquire),
            resumes_total: self.resumes_total.load(Ordering::Acquire),
            reconnects_total: self.reconnects_total.load(Ordering::Acquire),
            heartbeats_sent_total: self.heartbeats_sent_total.load(Ordering::Acquire),
            heartbeat_acks_total: self.heartbeat_acks_total.load(Ordering::Acquire),
            dispatches_total: self.dispatches_total.load(Ordering::Acquire),
            invalid_sessions_total: self.invalid_sessions_total.load(Ordering::Acquire),
            errors_total: self.errors_total.load(Ordering::Acquire),
            ready_shards: shard_snapshots.iter().filter(|s| s.is_ready).count(),
            shards: shard_snapshots,
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connects_total: u64,
    pub resumes_total: u64,
    pub reconnects_total: u64,
    pub heartbeats_sent_total: u64,
    pub heartbeat_acks_total: u64,
    pub dispatches_total: u64,
    pub invalid_sessions_total: u64,
    pub errors_total: u64,
    pub ready_shards: usize,
    pub shards: Vec<ShardMetrics>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_counters() {
        let metrics = Metrics::new();

        metrics.record_connect();
        metrics.record_connect();
        metrics.record_resume();

        assert_eq!(metrics.connects(), 2);
        assert_eq!(metrics.resumes(), 1);
    }

    #[test]
    fn test_shard_metrics() {
        let metrics = Metrics::new();

        metrics.update_shard(0, |s| s.is_ready = true);
        metrics.update_shard(2, |s| {
            s.is_ready = true;
            s.latency = Some(Duration::from_millis(42));
        });

        assert_eq!(metrics.ready_shards(), 2);
        assert_eq!(metrics.shard_latency(2), Some(Duration::from_millis(42)));
        assert_eq!(metrics.shard_latency(1), None);
        // Gap shard was materialized with its own id
        assert_eq!(metrics.shard_metrics()[1].shard_id, 1);
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = Metrics::new();

        metrics.record_connect();
        metrics.record_heartbeat_sent();
        metrics.record_heartbeat_ack();
        metrics.update_shard(0, |s| s.is_ready = true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connects_total, 1);
        assert_eq!(snapshot.heartbeats_sent_total, 1);
        assert_eq!(snapshot.heartbeat_acks_total, 1);
        assert_eq!(snapshot.ready_shards, 1);
        assert_eq!(snapshot.shards.len(), 1);
    }
}
