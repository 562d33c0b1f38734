//! Frame validation, decompression, checksum verification, and batch
//! splitting (SPEC_FULL.md ss4.3).
//!
//! Pure transformation: this module never touches the connection, the
//! delivery queue, or the flow controller directly. It hands back either a
//! ready-to-enqueue [`Dispatch`] or a [`ReceiveFailure`] describing exactly
//! what the caller (the consumer core) must do about it -- send a
//! validation-error ack and restore one credit, or escalate to a protocol
//! failure. Keeping those side effects at the call site is what makes the
//! ss8 scenarios (checksum mismatch, oversized message, zero-queue batch)
//! independently testable here without a mock connection.

use bytes::Buf;
use xxhash_rust::xxh3::xxh3_64;

use crate::codec::CompressionCodecProvider;
use crate::message_id::{AnyMessageId, BatchMessageId, MessageId};
use crate::queue::Message;
use crate::wire::{MessageMetadata, SingleMessageMetadata, ValidationError};

/// An inbound message frame after outer transport framing has already been
/// stripped off (length prefixes and socket I/O are an external
/// collaborator's job, per `wire`'s module docs) but before metadata has been
/// parsed -- that parse is step 1 of `ReceivePath::process` and can fail.
pub struct IncomingFrame {
    pub message_id: MessageId,
    pub connection_identity: u64,
    /// Raw `MessageMetadata::encode()`-shaped bytes, not yet parsed.
    pub metadata_bytes: Vec<u8>,
    /// Possibly-compressed payload. For a batch this is the whole batch body,
    /// compressed once as a unit; splitting into per-message components
    /// happens after decompression.
    pub payload: Vec<u8>,
}

impl IncomingFrame {
    /// Convenience constructor that encodes `metadata` for the caller,
    /// mirroring what a real transport would have handed over as raw bytes.
    pub fn new(message_id: MessageId, connection_identity: u64, metadata: &MessageMetadata, payload: Vec<u8>) -> Self {
        Self {
            message_id,
            connection_identity,
            metadata_bytes: metadata.encode(),
            payload,
        }
    }
}

/// Why a frame was discarded instead of being dispatched. Never escapes this
/// crate as a [`crate::error::ConsumerError`] -- the caller turns it into an
/// `Ack(Individual, validationError)` plus one restored flow credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    ChecksumMismatch,
    UncompressedSizeCorruption,
    DecompressionError,
}

impl DiscardReason {
    pub fn as_validation_error(self) -> ValidationError {
        match self {
            DiscardReason::ChecksumMismatch => ValidationError::ChecksumMismatch,
            DiscardReason::UncompressedSizeCorruption => ValidationError::UncompressedSizeCorruption,
            DiscardReason::DecompressionError => ValidationError::DecompressionError,
        }
    }
}

/// A discarded frame, carrying the entry it would have addressed so the
/// caller can still emit a validation-error ack for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscardOutcome {
    pub entry: MessageId,
    pub reason: DiscardReason,
}

/// What went wrong processing a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveFailure {
    Discard(DiscardOutcome),
    /// A batch arrived while the consumer is configured for a zero-sized
    /// receiver queue (ss4.3 step 5, ss8 scenario 6). The caller must
    /// initiate close and fail pending async receives with `InvalidMessage`.
    ZeroQueueBatchUnsupported,
}

/// Messages ready to be handed to the delivery queue, plus whatever batch
/// bookkeeping the caller must register before enqueuing them.
pub enum Dispatch {
    Single(Message),
    /// `entry`/`batch_size` must be registered with the ack tracker
    /// (`BatchAckTracker::create_entry`) before these messages are enqueued.
    Batch {
        entry: MessageId,
        batch_size: u32,
        messages: Vec<Message>,
    },
}

impl Dispatch {
    pub fn len(&self) -> usize {
        match self {
            Dispatch::Single(_) => 1,
            Dispatch::Batch { messages, .. } => messages.len(),
        }
    }
}

/// Stateless transformation pipeline; takes its tunables per call so a
/// single instance can serve a consumer across reconnects and config reloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReceivePath;

impl ReceivePath {
    pub fn new() -> Self {
        Self
    }

    /// Run steps 1-5 of ss4.3 against one inbound frame.
    pub fn process(&self, frame: IncomingFrame, max_message_size: usize) -> Result<Dispatch, ReceiveFailure> {
        let entry = frame.message_id;

        let mut cursor = &frame.metadata_bytes[..];
        let metadata = MessageMetadata::decode(&mut cursor).map_err(|_| {
            ReceiveFailure::Discard(DiscardOutcome {
                entry,
                reason: DiscardReason::ChecksumMismatch,
            })
        })?;
        let metadata = &metadata;

        if metadata.uncompressed_size as usize > max_message_size {
            return Err(ReceiveFailure::Discard(DiscardOutcome {
                entry,
                reason: DiscardReason::UncompressedSizeCorruption,
            }));
        }

        let codec = CompressionCodecProvider::get(metadata.compression);
        let decompressed = codec
            .decode(&frame.payload, metadata.uncompressed_size)
            .map_err(|_| {
                ReceiveFailure::Discard(DiscardOutcome {
                    entry,
                    reason: DiscardReason::DecompressionError,
                })
            })?;

        if let Some(expected) = metadata.checksum {
            if xxh3_64(&decompressed) != expected {
                return Err(ReceiveFailure::Discard(DiscardOutcome {
                    entry,
                    reason: DiscardReason::ChecksumMismatch,
                }));
            }
        }

        // ss9 open question: a literal batch of size 1 with the flag set
        // still takes the batch branch -- only the flag's absence (or a
        // count of exactly 1 *with no flag at all*) takes the single path.
        match metadata.num_messages_in_batch {
            None => Ok(Dispatch::Single(Message {
                id: AnyMessageId::Single(entry),
                payload: decompressed.into(),
                connection_identity: frame.connection_identity,
            })),
            Some(batch_size) => {
                let components = split_batch(&decompressed, batch_size).map_err(|_| {
                    ReceiveFailure::Discard(DiscardOutcome {
                        entry,
                        reason: DiscardReason::ChecksumMismatch,
                    })
                })?;

                let messages = components
                    .into_iter()
                    .enumerate()
                    .map(|(i, (_meta, payload))| Message {
                        id: AnyMessageId::Batch(BatchMessageId::new(entry, i as i32)),
                        payload: payload.into(),
                        connection_identity: frame.connection_identity,
                    })
                    .collect();

                Ok(Dispatch::Batch {
                    entry,
                    batch_size,
                    messages,
                })
            }
        }
    }

    /// Apply the zero-queue-with-batch guard from ss4.3 step 5 after parsing.
    pub fn reject_batch_on_zero_queue(dispatch: &Dispatch, receiver_queue_size: u32) -> Option<ReceiveFailure> {
        if receiver_queue_size == 0 && matches!(dispatch, Dispatch::Batch { .. }) {
            Some(ReceiveFailure::ZeroQueueBatchUnsupported)
        } else {
            None
        }
    }
}

/// Split a decompressed batch body into its per-message components.
///
/// Each component is framed as `[u32 metadata_len][metadata bytes][u32
/// payload_len][payload bytes]`, consistent with the `bytes` length-prefix
/// convention used elsewhere in this crate's wire boundary. Single-message
/// metadata properties are not decoded here (no property is consulted by any
/// operation this crate implements); only the byte ranges are sliced out.
fn split_batch(body: &[u8], batch_size: u32) -> Result<Vec<(SingleMessageMetadata, Vec<u8>)>, ()> {
    let mut buf = body;
    let mut out = Vec::with_capacity(batch_size as usize);

    for _ in 0..batch_size {
        if buf.remaining() < 4 {
            return Err(());
        }
        let meta_len = buf.get_u32() as usize;
        if buf.remaining() < meta_len {
            return Err(());
        }
        buf.advance(meta_len);

        if buf.remaining() < 4 {
            return Err(());
        }
        let payload_len = buf.get_u32() as usize;
        if buf.remaining() < payload_len {
            return Err(());
        }
        let payload = buf[..payload_len].to_vec();
        buf.advance(payload_len);

        out.push((SingleMessageMetadata::default(), payload));
    }

    Ok(out)
}
