//! Batch acknowledgment tracker (SPEC_FULL.md ss4.2).
//!
//! Translates per-message acks -- some of which name a `batch_index` within an
//! enclosing entry -- into broker-visible acks that always address a whole
//! entry. Backed by a mutex-guarded `BTreeMap` so range deletion (prune
//! everything below a key) and "greatest key below" lookups are native
//! operations, per the ss9 design note ruling out a hash map here.

use std::collections::BTreeMap;

use fixedbitset::FixedBitSet;
use parking_lot::Mutex;

use crate::message_id::MessageId;

/// A single broker-addressable entry containing `batch_size` logical messages.
struct BatchEntry {
    outstanding: FixedBitSet,
}

impl BatchEntry {
    fn new(batch_size: u32) -> Self {
        let mut bits = FixedBitSet::with_capacity(batch_size as usize);
        bits.set_range(.., true);
        Self { outstanding: bits }
    }

    fn is_empty(&self) -> bool {
        self.outstanding.count_ones(..) == 0
    }
}

/// Outcome of an ack against the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckOutcome {
    /// Whether the broker should be told to ack `requested_key` (Individual
    /// acks address the entry itself; Cumulative acks may instead address a
    /// lower, already-complete entry -- see `lower_cumulative_ack`).
    pub broker_ackable: bool,
    /// If set, the broker-visible ack should be Cumulative at this key instead
    /// of at the key the caller asked to ack (ss4.2, ack(BatchMessageId, Cumulative)
    /// when the entry itself is not yet fully acked).
    pub lower_cumulative_ack: Option<MessageId>,
    /// Size of the batch entry that just became fully acked, if any -- lets
    /// the caller credit `acks_sent` stats by the whole entry rather than 1.
    pub completed_batch_size: Option<u32>,
}

impl AckOutcome {
    const NOT_ACKABLE: Self = AckOutcome {
        broker_ackable: false,
        lower_cumulative_ack: None,
        completed_batch_size: None,
    };
}

/// Per-subscription batch ack tracker.
pub struct BatchAckTracker {
    entries: Mutex<BTreeMap<MessageId, BatchEntry>>,
}

impl Default for BatchAckTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchAckTracker {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a freshly split batch entry. Per the ss9 open question, this
    /// is called even for a literal batch of size 1 when the batch flag was
    /// set on the wire -- the caller (`receive_path`) preserves that verbatim
    /// rather than special-casing it away.
    pub fn create_entry(&self, key: MessageId, batch_size: u32) {
        self.entries.lock().insert(key, BatchEntry::new(batch_size));
    }

    /// Fast probe: is `key` still tracked (not yet fully acked)?
    pub fn contains(&self, key: MessageId) -> bool {
        self.entries.lock().contains_key(&key)
    }

    /// `ack(BatchMessageId, Individual)`.
    pub fn ack_individual(&self, key: MessageId, batch_index: i32) -> AckOutcome {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&key) else {
            return AckOutcome::NOT_ACKABLE;
        };
        if (batch_index as usize) < entry.outstanding.len() {
            entry.outstanding.set(batch_index as usize, false);
        }
        if entry.is_empty() {
            let batch_size = entry.outstanding.len() as u32;
            entries.remove(&key);
            AckOutcome {
                broker_ackable: true,
                lower_cumulative_ack: None,
                completed_batch_size: Some(batch_size),
            }
        } else {
            AckOutcome::NOT_ACKABLE
        }
    }

    /// `ack(BatchMessageId, Cumulative)`.
    pub fn ack_cumulative_batch(&self, key: MessageId, batch_index: i32) -> AckOutcome {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&key) else {
            return AckOutcome::NOT_ACKABLE;
        };
        let upto = (batch_index as usize).min(entry.outstanding.len().saturating_sub(1));
        entry.outstanding.set_range(..=upto, false);

        if entry.is_empty() {
            let batch_size = entry.outstanding.len() as u32;
            // Fully complete: remove this entry and everything at-or-below it.
            let drop_keys: Vec<MessageId> = entries.range(..=key).map(|(k, _)| *k).collect();
            for k in drop_keys {
                entries.remove(&k);
            }
            return AckOutcome {
                broker_ackable: true,
                lower_cumulative_ack: None,
                completed_batch_size: Some(batch_size),
            };
        }

        // Still partially outstanding: flush everything strictly below `key`
        // and, if anything was there, report the greatest such key as the
        // broker-visible cumulative ack target.
        let lower_key = entries
            .range(..key)
            .next_back()
            .map(|(k, _)| *k);

        if let Some(lower) = lower_key {
            let drop_keys: Vec<MessageId> = entries.range(..=lower).map(|(k, _)| *k).collect();
            for k in drop_keys {
                entries.remove(&k);
            }
        }

        AckOutcome {
            broker_ackable: false,
            lower_cumulative_ack: lower_key,
            completed_batch_size: None,
        }
    }

    /// `ack(MessageId non-batch, Cumulative)`: drop all entries strictly below `key`.
    pub fn prune_below(&self, key: MessageId) {
        let mut entries = self.entries.lock();
        if entries.is_empty() {
            return;
        }
        let drop_keys: Vec<MessageId> = entries.range(..key).map(|(k, _)| *k).collect();
        for k in drop_keys {
            entries.remove(&k);
        }
    }

    /// Number of tracked entries (test/diagnostic use).
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all tracked entries (subscribe completion, close).
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mid(ledger: u64, entry: u64) -> MessageId {
        MessageId::new(ledger, entry, 0)
    }

    #[test]
    fn individual_ack_completes_entry_after_all_bits_cleared() {
        let tracker = BatchAckTracker::new();
        tracker.create_entry(mid(7, 3), 3);

        assert!(!tracker.ack_individual(mid(7, 3), 0).broker_ackable);
        assert!(!tracker.ack_individual(mid(7, 3), 2).broker_ackable);
        let last = tracker.ack_individual(mid(7, 3), 1);
        assert!(last.broker_ackable);
        assert!(!tracker.contains(mid(7, 3)));
    }

    #[test]
    fn cumulative_ack_at_non_batch_id_drops_strictly_lower_entries() {
        let tracker = BatchAckTracker::new();
        tracker.create_entry(mid(7, 3), 3);
        tracker.create_entry(mid(7, 5), 2);

        tracker.prune_below(mid(7, 4));

        assert!(!tracker.contains(mid(7, 3)));
        assert!(tracker.contains(mid(7, 5)));
    }

    #[test]
    fn cumulative_ack_within_incomplete_entry_flushes_lower_entry() {
        let tracker = BatchAckTracker::new();
        tracker.create_entry(mid(7, 3), 3);
        tracker.create_entry(mid(7, 5), 2);

        let outcome = tracker.ack_cumulative_batch(mid(7, 5), 0);

        assert!(!outcome.broker_ackable);
        assert_eq!(outcome.lower_cumulative_ack, Some(mid(7, 3)));
        assert!(!tracker.contains(mid(7, 3)));
        assert!(tracker.contains(mid(7, 5)));
    }

    #[test]
    fn cumulative_ack_completing_entry_removes_it_and_everything_below() {
        let tracker = BatchAckTracker::new();
        tracker.create_entry(mid(7, 3), 3);
        tracker.create_entry(mid(7, 5), 2);

        let outcome = tracker.ack_cumulative_batch(mid(7, 5), 1);

        assert!(outcome.broker_ackable);
        assert!(outcome.lower_cumulative_ack.is_none());
        assert!(!tracker.contains(mid(7, 3)));
        assert!(!tracker.contains(mid(7, 5)));
    }

    #[test]
    fn acking_already_removed_entry_is_a_no_op() {
        let tracker = BatchAckTracker::new();
        tracker.create_entry(mid(7, 3), 1);
        assert!(tracker.ack_individual(mid(7, 3), 0).broker_ackable);

        let outcome = tracker.ack_individual(mid(7, 3), 0);
        assert!(!outcome.broker_ackable);
    }

    #[test]
    fn batch_of_literal_size_one_is_satisfied_by_first_individual_ack() {
        let tracker = BatchAckTracker::new();
        tracker.create_entry(mid(7, 9), 1);
        let outcome = tracker.ack_individual(mid(7, 9), 0);
        assert!(outcome.broker_ackable);
    }

    #[test]
    fn clear_drops_all_entries() {
        let tracker = BatchAckTracker::new();
        tracker.create_entry(mid(7, 3), 2);
        tracker.create_entry(mid(7, 5), 2);
        tracker.clear();
        assert!(tracker.is_empty());
    }
}
