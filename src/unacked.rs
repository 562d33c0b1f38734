//! Unacked message tracker (SPEC_FULL.md ss4.3a).
//!
//! Named as an external collaborator in the distilled core spec; implemented
//! here because nothing else in this repository owns it and the ack path and
//! `ConsumerCore` cannot be exercised without a concrete tracker.
//!
//! On ack timeout the tracker does not retry entries individually -- it
//! clears itself and invokes a single `on_timeout` callback, mirroring the
//! broker-redelivers-the-whole-backlog model `redeliver_unacked()` implements.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::message_id::MessageId;

struct Inner {
    entries: Mutex<BTreeMap<MessageId, Instant>>,
    shutdown: Notify,
}

/// Tracks delivered-but-unacked message ids and triggers redelivery on timeout.
pub struct UnackedMessageTracker {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UnackedMessageTracker {
    /// `ack_timeout` of zero disables the background timeout task entirely
    /// (the tracker still records deliveries, it just never redelivers on its
    /// own -- matching the common "ack timeout disabled" deployment mode).
    pub fn new<F>(ack_timeout: Duration, tick: Duration, on_timeout: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let inner = Arc::new(Inner {
            entries: Mutex::new(BTreeMap::new()),
            shutdown: Notify::new(),
        });

        let task = if ack_timeout.is_zero() {
            None
        } else {
            let inner = Arc::clone(&inner);
            Some(tokio::spawn(async move {
                let mut interval = tokio::time::interval(tick);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let expired = {
                                let entries = inner.entries.lock();
                                let now = Instant::now();
                                entries.values().any(|deadline| now >= *deadline)
                            };
                            if expired {
                                inner.entries.lock().clear();
                                on_timeout();
                            }
                        }
                        _ = inner.shutdown.notified() => break,
                    }
                }
            }))
        };

        Self {
            inner,
            task: Mutex::new(task),
        }
    }

    /// Record that `id` was just delivered and is due for redelivery after
    /// the configured ack timeout.
    pub fn add(&self, id: MessageId, deadline: Instant) {
        self.inner.entries.lock().insert(id, deadline);
    }

    /// Drop a single id. Returns whether it was present.
    pub fn remove(&self, id: MessageId) -> bool {
        self.inner.entries.lock().remove(&id).is_some()
    }

    /// Drop all entries with key <= `id`, returning the count removed.
    pub fn remove_messages_till(&self, id: MessageId) -> u32 {
        let mut entries = self.inner.entries.lock();
        let keys: Vec<MessageId> = entries.range(..=id).map(|(k, _)| *k).collect();
        for k in &keys {
            entries.remove(k);
        }
        keys.len() as u32
    }

    /// Drop every tracked id (subscribe completion, reconnect).
    pub fn clear(&self) {
        self.inner.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the background timeout task and clear all entries. Idempotent.
    pub fn close(&self) {
        self.clear();
        if let Some(task) = self.task.lock().take() {
            self.inner.shutdown.notify_one();
            task.abort();
        }
    }
}

impl Drop for UnackedMessageTracker {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn add_and_remove_round_trip() {
        let tracker = UnackedMessageTracker::new(Duration::ZERO, Duration::from_secs(1), || {});
        let id = MessageId::new(1, 1, 0);
        tracker.add(id, Instant::now());
        assert_eq!(tracker.len(), 1);
        assert!(tracker.remove(id));
        assert!(tracker.is_empty());
    }

    #[test]
    fn remove_messages_till_drops_lower_and_equal_keys() {
        let tracker = UnackedMessageTracker::new(Duration::ZERO, Duration::from_secs(1), || {});
        let now = Instant::now();
        tracker.add(MessageId::new(1, 1, 0), now);
        tracker.add(MessageId::new(1, 2, 0), now);
        tracker.add(MessageId::new(1, 3, 0), now);

        let removed = tracker.remove_messages_till(MessageId::new(1, 2, 0));

        assert_eq!(removed, 2);
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn expired_entries_trigger_callback_and_clear() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let tracker = UnackedMessageTracker::new(
            Duration::from_millis(20),
            Duration::from_millis(5),
            move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        tracker.add(MessageId::new(1, 1, 0), Instant::now());
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(fired.load(Ordering::SeqCst) >= 1);
        assert!(tracker.is_empty());
        tracker.close();
    }

    #[test]
    fn close_is_idempotent() {
        let tracker = UnackedMessageTracker::new(Duration::ZERO, Duration::from_secs(1), || {});
        tracker.close();
        tracker.close();
    }
}
