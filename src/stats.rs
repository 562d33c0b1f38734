//! Per-consumer counters (SPEC_FULL.md ss4.8a).
//!
//! The human-facing stats *frontend* (dashboards, metrics exporters) is out
//! of scope per ss1's Non-goals; these are just the atomic counters the rest
//! of the core updates inline, plus an optional periodic logger.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Default)]
struct Counters {
    messages_received: AtomicU64,
    bytes_received: AtomicU64,
    acks_sent: AtomicU64,
    receive_failures: AtomicU64,
    ack_failures: AtomicU64,
}

/// A point-in-time snapshot of the cumulative counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub messages_received: u64,
    pub bytes_received: u64,
    pub acks_sent: u64,
    pub receive_failures: u64,
    pub ack_failures: u64,
}

pub struct Stats {
    counters: Arc<Counters>,
    reporter: std::sync::Mutex<Option<(JoinHandle<()>, Arc<Notify>)>>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            reporter: std::sync::Mutex::new(None),
        }
    }

    pub fn record_received(&self, bytes: usize) {
        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_acks_sent(&self, count: u64) {
        self.counters.acks_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_receive_failure(&self) {
        self.counters.receive_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ack_failure(&self) {
        self.counters.ack_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            acks_sent: self.counters.acks_sent.load(Ordering::Relaxed),
            receive_failures: self.counters.receive_failures.load(Ordering::Relaxed),
            ack_failures: self.counters.ack_failures.load(Ordering::Relaxed),
        }
    }

    /// Spawn a task that logs a snapshot every `interval` until `stop_reporter`
    /// is called. A zero interval (stats disabled) is rejected by the caller
    /// before this is invoked.
    pub fn start_reporter(&self, consumer_name: String, interval: Duration) {
        let counters = Arc::clone(&self.counters);
        let stop = Arc::new(Notify::new());
        let stop_clone = Arc::clone(&stop);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tracing::info!(
                            consumer = %consumer_name,
                            messages_received = counters.messages_received.load(Ordering::Relaxed),
                            bytes_received = counters.bytes_received.load(Ordering::Relaxed),
                            acks_sent = counters.acks_sent.load(Ordering::Relaxed),
                            receive_failures = counters.receive_failures.load(Ordering::Relaxed),
                            ack_failures = counters.ack_failures.load(Ordering::Relaxed),
                            "consumer stats",
                        );
                    }
                    _ = stop_clone.notified() => break,
                }
            }
        });

        *self.reporter.lock().unwrap() = Some((handle, stop));
    }

    pub fn stop_reporter(&self) {
        if let Some((handle, stop)) = self.reporter.lock().unwrap().take() {
            stop.notify_one();
            handle.abort();
        }
    }
}

impl Drop for Stats {
    fn drop(&mut self) {
        self.stop_reporter();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = Stats::new();
        stats.record_received(100);
        stats.record_received(50);
        stats.record_acks_sent(3);
        stats.record_receive_failure();
        stats.record_ack_failure();

        let snap = stats.snapshot();
        assert_eq!(snap.messages_received, 2);
        assert_eq!(snap.bytes_received, 150);
        assert_eq!(snap.acks_sent, 3);
        assert_eq!(snap.receive_failures, 1);
        assert_eq!(snap.ack_failures, 1);
    }

    #[tokio::test]
    async fn reporter_can_be_started_and_stopped() {
        let stats = Stats::new();
        stats.start_reporter("test-consumer".into(), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(20)).await;
        stats.stop_reporter();
    }
}
