//! Identify rate-limit admission: the per-bucket last-connect table and the
//! FIFO of shards awaiting permission to open a connection.
//!
//! A shard id maps to bucket `id % concurrency`. A fresh identify must wait
//! until the configured spacing has elapsed since its bucket's last connect;
//! a resume is exempt from the spacing but, like a fresh connect, may not
//! start while another shard in the same bucket is mid-connect.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Distinguishes queue entries for rate-limit exemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectKind {
    /// Fresh identify, subject to bucket spacing
    Fresh,
    /// Session resume, exempt from bucket spacing
    Resume,
}

/// One shard awaiting connect permission.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QueueEntry {
    pub shard_id: u16,
    pub kind: ConnectKind,
}

/// FIFO connect queue plus the bucket last-connect table.
#[derive(Debug)]
pub(crate) struct ConnectQueue {
    concurrency: u16,
    spacing: Duration,
    buckets: HashMap<u16, Instant>,
    queue: VecDeque<QueueEntry>,
}

impl ConnectQueue {
    pub(crate) fn new(concurrency: u16, spacing: Duration) -> Self {
        Self {
            concurrency: concurrency.max(1),
            spacing,
            buckets: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    pub(crate) fn bucket_key(&self, shard_id: u16) -> u16 {
        shard_id % self.concurrency
    }

    /// Add a shard to the queue.
    ///
    /// A shard already queued keeps its position; its kind is updated so a
    /// later resume request is not charged fresh-connect spacing.
    pub(crate) fn enqueue(&mut self, shard_id: u16, kind: ConnectKind) {
        if let Some(entry) = self.queue.iter_mut().find(|e| e.shard_id == shard_id) {
            entry.kind = kind;
        } else {
            self.queue.push_back(QueueEntry { shard_id, kind });
        }
    }

    /// Drain admissible entries in FIFO order.
    ///
    /// `busy` reports whether any shard in the given bucket is currently
    /// mid-connect. Admitted shards have their bucket stamped immediately;
    /// entries skipped stay queued in order.
    pub(crate) fn drain(&mut self, busy: impl Fn(u16) -> bool) -> Vec<QueueEntry> {
        let now = Instant::now();
        let mut admitted = Vec::new();
        let mut admitted_keys: Vec<u16> = Vec::new();
        let mut remaining = VecDeque::with_capacity(self.queue.len());

        for entry in self.queue.drain(..) {
            let key = entry.shard_id % self.concurrency;

            let spaced_out = entry.kind == ConnectKind::Fresh
                && self
                    .buckets
                    .get(&key)
                    .is_some_and(|last| now.duration_since(*last) < self.spacing);
            let bucket_busy = admitted_keys.contains(&key) || busy(key);

            if spaced_out || bucket_busy {
                remaining.push_back(entry);
                continue;
            }

            self.buckets.insert(key, now);
            admitted_keys.push(key);
            admitted.push(entry);
        }

        self.queue = remaining;
        admitted
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn clear(&mut self) {
        self.queue.clear();
    }

    /// Time of the given bucket's last connect, if any.
    #[cfg(test)]
    pub(crate) fn last_connect(&self, key: u16) -> Option<Instant> {
        self.buckets.get(&key).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPACING: Duration = Duration::from_millis(5000);

    fn ids(entries: &[QueueEntry]) -> Vec<u16> {
        entries.iter().map(|e| e.shard_id).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_bucket_fresh_connects_are_spaced() {
        let mut queue = ConnectQueue::new(1, SPACING);
        queue.enqueue(0, ConnectKind::Fresh);
        queue.enqueue(1, ConnectKind::Fresh);

        assert_eq!(ids(&queue.drain(|_| false)), vec![0]);
        // Shard 0 finished connecting, but the bucket window has not elapsed.
        assert!(queue.drain(|_| false).is_empty());
        assert_eq!(queue.len(), 1);

        tokio::time::advance(SPACING).await;
        assert_eq!(ids(&queue.drain(|_| false)), vec![1]);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_bypasses_spacing() {
        let mut queue = ConnectQueue::new(1, SPACING);
        queue.enqueue(0, ConnectKind::Fresh);
        assert_eq!(ids(&queue.drain(|_| false)), vec![0]);

        // Immediately after a same-bucket connect, a resume is not delayed.
        queue.enqueue(1, ConnectKind::Resume);
        assert_eq!(ids(&queue.drain(|_| false)), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_bucket_blocks_resume_too() {
        let mut queue = ConnectQueue::new(1, SPACING);
        queue.enqueue(1, ConnectKind::Resume);

        assert!(queue.drain(|_| true).is_empty());
        assert_eq!(ids(&queue.drain(|_| false)), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buckets_are_independent() {
        let mut queue = ConnectQueue::new(2, SPACING);
        queue.enqueue(0, ConnectKind::Fresh);
        queue.enqueue(1, ConnectKind::Fresh);
        queue.enqueue(2, ConnectKind::Fresh); // same bucket as 0

        let admitted = queue.drain(|_| false);
        assert_eq!(ids(&admitted), vec![0, 1]);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_spacing_allows_back_to_back_connects() {
        let mut queue = ConnectQueue::new(1, Duration::ZERO);
        queue.enqueue(0, ConnectKind::Fresh);
        queue.enqueue(1, ConnectKind::Fresh);

        // Shard 1 still waits for shard 0 to leave the mid-connect state,
        // but not for any spacing window.
        assert_eq!(ids(&queue.drain(|_| false)), vec![0]);
        assert_eq!(ids(&queue.drain(|_| false)), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_connect_per_bucket_per_drain() {
        let mut queue = ConnectQueue::new(1, Duration::ZERO);
        queue.enqueue(0, ConnectKind::Resume);
        queue.enqueue(1, ConnectKind::Resume);

        // Even resumes do not overlap within one bucket.
        assert_eq!(ids(&queue.drain(|_| false)), vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_dedupes_and_upgrades_kind() {
        let mut queue = ConnectQueue::new(1, SPACING);
        queue.enqueue(0, ConnectKind::Fresh);
        queue.enqueue(0, ConnectKind::Resume);
        assert_eq!(queue.len(), 1);

        // Stamp the bucket, then verify the upgraded entry is spacing-exempt.
        queue.enqueue(9, ConnectKind::Fresh);
        let first = queue.drain(|_| false);
        assert_eq!(ids(&first), vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_stamps_bucket() {
        let mut queue = ConnectQueue::new(1, SPACING);
        assert!(queue.last_connect(0).is_none());
        queue.enqueue(0, ConnectKind::Fresh);
        let _ = queue.drain(|_| false);
        assert_eq!(queue.last_connect(0), Some(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_order_preserved_for_skipped_entries() {
        let mut queue = ConnectQueue::new(1, SPACING);
        queue.enqueue(0, ConnectKind::Fresh);
        let _ = queue.drain(|_| false);

        queue.enqueue(1, ConnectKind::Fresh);
        queue.enqueue(2, ConnectKind::Fresh);
        assert!(queue.drain(|_| false).is_empty());

        tokio::time::advance(SPACING).await;
        assert_eq!(ids(&queue.drain(|_| false)), vec![1]);
        tokio::time::advance(SPACING).await;
        assert_eq!(ids(&queue.drain(|_| false)), vec![2]);
    }
}
