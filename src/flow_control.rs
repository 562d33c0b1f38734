//! Credit-based flow control (SPEC_FULL.md ss4.1).
//!
//! `FlowController` only decides *when* and *how many* permits to grant; it
//! never touches the connection itself. Callers get back an `Option<u32>`
//! (the permits to grant, if any) and are responsible for actually emitting
//! `Flow(consumer_id, permits)` on the current connection. This keeps the
//! CAS arithmetic unit-testable without a connection in the loop.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::config::ConsumerConfig;

/// Tracks granted-but-unconsumed credits and decides when to refill.
pub struct FlowController {
    /// Bound on in-flight buffered messages; 0 means rendezvous mode.
    receiver_queue_size: u32,
    /// Crossing this many processed-but-uncredited messages triggers a
    /// refill; sourced from `ConsumerConfig::refill_threshold` so there is
    /// exactly one place that derives it from `receiver_queue_size`.
    refill_threshold: u32,
    /// Processed-but-not-yet-credited count since the last refill.
    permits: AtomicU32,
}

impl FlowController {
    pub fn new(config: &ConsumerConfig) -> Self {
        Self {
            receiver_queue_size: config.receiver_queue_size,
            // A queue size of 1 (threshold 0) must still refill on every
            // processed message instead of never crossing the threshold.
            refill_threshold: config.refill_threshold().max(1),
            permits: AtomicU32::new(0),
        }
    }

    /// One unit of credit has been consumed (a message was processed or a
    /// corrupted message was discarded -- the broker already spent that
    /// credit either way). Returns `Some(permits)` to grant if the refill
    /// threshold was crossed by this call; `None` otherwise.
    ///
    /// Uses a CAS loop so two concurrent callers can never both observe the
    /// same post-threshold value and double-emit a `Flow` for the same
    /// tokens (SPEC_FULL.md ss4.1, ss9 "Permits CAS").
    fn credit_one(&self) -> Option<u32> {
        let threshold = self.refill_threshold;
        loop {
            let current = self.permits.load(Ordering::Acquire);
            let next = current + 1;
            if next >= threshold {
                // Crossed the threshold: try to claim and zero the counter.
                if self
                    .permits
                    .compare_exchange(current, 0, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Some(next);
                }
                // Lost the race; re-read and retry.
                continue;
            }
            if self
                .permits
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return None;
            }
        }
    }

    pub fn on_message_processed(&self) -> Option<u32> {
        self.credit_one()
    }

    pub fn on_corrupted_message_discarded(&self) -> Option<u32> {
        self.credit_one()
    }

    /// Reset credits to zero and, unless the queue is zero-sized, grant the
    /// whole configured queue size as a fresh initial credit.
    pub fn on_reconnect(&self) -> Option<u32> {
        self.permits.store(0, Ordering::Release);
        if self.receiver_queue_size == 0 {
            None
        } else {
            Some(self.receiver_queue_size)
        }
    }

    /// The single permit granted per blocking receive in rendezvous mode.
    pub const fn zero_queue_permit() -> u32 {
        1
    }

    #[cfg(test)]
    fn current_permits(&self) -> u32 {
        self.permits.load(Ordering::Acquire)
    }
}
