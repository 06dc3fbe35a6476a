//! Counters for the NATS event bus.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct BusMetrics {
    pub messages_published: AtomicU64,
    pub publish_failures: AtomicU64,
    pub messages_received: AtomicU64,
    /// Received messages that did not decode as an event.
    pub decode_failures: AtomicU64,
    pub bytes_published: AtomicU64,
    pub connected: AtomicBool,
}

impl BusMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_publish(&self, bytes: u64) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
        self.bytes_published.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_receive(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_published: self.messages_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            bytes_published: self.bytes_published.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`BusMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_published: u64,
    pub publish_failures: u64,
    pub messages_received: u64,
    pub decode_failures: u64,
    pub bytes_published: u64,
    pub connected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = BusMetrics::new();
        metrics.record_publish(120);
        metrics.record_publish(30);
        metrics.record_publish_failure();
        metrics.set_connected(true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_published, 2);
        assert_eq!(snapshot.bytes_published, 150);
        assert_eq!(snapshot.publish_failures, 1);
        assert!(snapshot.connected);
    }
}
