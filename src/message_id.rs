//! Totally ordered message identifiers.

use std::cmp::Ordering;
use std::fmt;

/// Identifies a broker-addressable entry: (ledger, entry, partition).
///
/// Total order is lexicographic on `(ledger_id, entry_id, partition)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId {
    pub ledger_id: u64,
    pub entry_id: u64,
    pub partition: i32,
}

impl MessageId {
    pub const fn new(ledger_id: u64, entry_id: u64, partition: i32) -> Self {
        Self {
            ledger_id,
            entry_id,
            partition,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.ledger_id, self.entry_id, self.partition)
    }
}

/// A single message within a batch entry.
///
/// Compares equal to its enclosing [`MessageId`] on `(ledger_id, entry_id,
/// partition)` alone -- `batch_index` is not part of the ordering key used by
/// the batch tracker, which keys purely on the non-batch form. It is, however,
/// compared as a tiebreaker so that two `BatchMessageId`s within the same
/// entry still sort by index (used only for intra-entry diagnostics, never by
/// the tracker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchMessageId {
    pub id: MessageId,
    pub batch_index: i32,
}

impl BatchMessageId {
    pub const fn new(id: MessageId, batch_index: i32) -> Self {
        Self { id, batch_index }
    }

    /// The non-batch key the tracker stores entries under.
    pub const fn entry_key(&self) -> MessageId {
        self.id
    }
}

impl PartialOrd for BatchMessageId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BatchMessageId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id).then(self.batch_index.cmp(&other.batch_index))
    }
}

impl fmt::Display for BatchMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.batch_index)
    }
}

/// Either a plain [`MessageId`] or a [`BatchMessageId`], as handed to
/// `acknowledge()` and the unacked tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnyMessageId {
    Single(MessageId),
    Batch(BatchMessageId),
}

impl AnyMessageId {
    /// The non-batch key used for ordering and tracker lookups.
    pub const fn key(&self) -> MessageId {
        match self {
            AnyMessageId::Single(id) => *id,
            AnyMessageId::Batch(bid) => bid.id,
        }
    }
}

impl From<MessageId> for AnyMessageId {
    fn from(id: MessageId) -> Self {
        AnyMessageId::Single(id)
    }
}

impl From<BatchMessageId> for AnyMessageId {
    fn from(id: BatchMessageId) -> Self {
        AnyMessageId::Batch(id)
    }
}

impl fmt::Display for AnyMessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnyMessageId::Single(id) => write!(f, "{id}"),
            AnyMessageId::Batch(bid) => write!(f, "{bid}"),
        }
    }
}
