//! Wire-level types: the commands the core sends/receives and the metadata
//! carried by an inbound message frame.
//!
//! The outer socket framing (who reads N bytes off the stream and hands them
//! here) belongs to the underlying protocol/transport library, an external
//! collaborator (SPEC_FULL.md ss6). This module owns what's inside that
//! frame: `MessageMetadata::decode` turns the metadata bytes the transport
//! handed over into a typed `MessageMetadata`, fallibly, per SPEC_FULL.md
//! ss4.3 step 1.

use bytes::Buf;

use crate::message_id::MessageId;

/// Compression codec named by `MessageMetadata::compression`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionType {
    None,
    Lz4,
    Zlib,
    Zstd,
}

/// Metadata preceding a message (or batch) payload on the wire.
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    pub compression: CompressionType,
    pub uncompressed_size: u32,
    pub checksum: Option<u64>,
    pub num_messages_in_batch: Option<u32>,
}

/// Why raw metadata bytes failed to decode into a [`MessageMetadata`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataParseError {
    /// Fewer bytes were available than the fixed layout requires.
    Truncated,
    /// The leading compression tag byte didn't name a known codec.
    UnknownCompressionTag(u8),
}

impl MessageMetadata {
    /// Fixed layout: `[compression: u8][uncompressed_size: u32]
    /// [checksum_present: u8][checksum: u64 if present]
    /// [batch_count_present: u8][batch_count: u32 if present]`, all
    /// big-endian. Mirrors the length-prefix/tag-byte convention the rest of
    /// this crate's wire boundary uses (see `split_batch` in `receive_path.rs`).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(11);
        out.push(match self.compression {
            CompressionType::None => 0,
            CompressionType::Lz4 => 1,
            CompressionType::Zlib => 2,
            CompressionType::Zstd => 3,
        });
        out.extend_from_slice(&self.uncompressed_size.to_be_bytes());
        match self.checksum {
            Some(checksum) => {
                out.push(1);
                out.extend_from_slice(&checksum.to_be_bytes());
            }
            None => out.push(0),
        }
        match self.num_messages_in_batch {
            Some(count) => {
                out.push(1);
                out.extend_from_slice(&count.to_be_bytes());
            }
            None => out.push(0),
        }
        out
    }

    /// ss4.3 step 1: parse raw metadata bytes, failing on truncation or an
    /// unrecognized compression tag rather than panicking.
    pub fn decode(buf: &mut impl Buf) -> Result<Self, MetadataParseError> {
        if buf.remaining() < 1 {
            return Err(MetadataParseError::Truncated);
        }
        let compression = match buf.get_u8() {
            0 => CompressionType::None,
            1 => CompressionType::Lz4,
            2 => CompressionType::Zlib,
            3 => CompressionType::Zstd,
            other => return Err(MetadataParseError::UnknownCompressionTag(other)),
        };

        if buf.remaining() < 4 {
            return Err(MetadataParseError::Truncated);
        }
        let uncompressed_size = buf.get_u32();

        if buf.remaining() < 1 {
            return Err(MetadataParseError::Truncated);
        }
        let checksum = if buf.get_u8() != 0 {
            if buf.remaining() < 8 {
                return Err(MetadataParseError::Truncated);
            }
            Some(buf.get_u64())
        } else {
            None
        };

        if buf.remaining() < 1 {
            return Err(MetadataParseError::Truncated);
        }
        let num_messages_in_batch = if buf.get_u8() != 0 {
            if buf.remaining() < 4 {
                return Err(MetadataParseError::Truncated);
            }
            Some(buf.get_u32())
        } else {
            None
        };

        Ok(Self {
            compression,
            uncompressed_size,
            checksum,
            num_messages_in_batch,
        })
    }
}

/// Metadata for one message within a batch, decoded from the batch payload.
#[derive(Debug, Clone, Default)]
pub struct SingleMessageMetadata {
    pub properties: Vec<(String, String)>,
}

/// An inbound frame as delivered by the transport, before any parsing.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub message_id: MessageId,
    pub payload: Vec<u8>,
}

/// Ack semantics requested by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckType {
    /// Acknowledges exactly one message.
    Individual,
    /// Acknowledges the target and everything with a strictly lower id.
    Cumulative,
}

/// Reason a message was discarded instead of being acked normally; carried on
/// the wire as the `validationError` field of an `Ack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationError {
    ChecksumMismatch,
    UncompressedSizeCorruption,
    DecompressionError,
}

/// Commands the consumer core sends to the broker, or the broker sends to the
/// consumer (`RedeliverUnacknowledgedMessages` is outbound only; subscribe
/// replies are modeled separately in `connection::SubscribeOutcome`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Subscribe {
        topic: String,
        subscription: String,
        consumer_id: u64,
        request_id: u64,
        sub_type: SubTypeWire,
        consumer_name: Option<String>,
    },
    Unsubscribe {
        consumer_id: u64,
        request_id: u64,
    },
    CloseConsumer {
        consumer_id: u64,
        request_id: u64,
    },
    Flow {
        consumer_id: u64,
        permits: u32,
    },
    Ack {
        consumer_id: u64,
        ledger_id: u64,
        entry_id: u64,
        ack_type: AckType,
        validation_error: Option<ValidationError>,
    },
    RedeliverUnacknowledgedMessages {
        consumer_id: u64,
    },
}

/// Wire representation of [`crate::config::SubscriptionType`], kept separate
/// so the config type has no wire-format dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubTypeWire {
    Exclusive,
    Shared,
    Failover,
}

impl From<crate::config::SubscriptionType> for SubTypeWire {
    fn from(value: crate::config::SubscriptionType) -> Self {
        use crate::config::SubscriptionType as S;
        match value {
            S::Exclusive => SubTypeWire::Exclusive,
            S::Shared => SubTypeWire::Shared,
            S::Failover => SubTypeWire::Failover,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_roundtrips_through_encode_decode() {
        let metadata = MessageMetadata {
            compression: CompressionType::Zstd,
            uncompressed_size: 4096,
            checksum: Some(0xdead_beef_0bad_f00d),
            num_messages_in_batch: Some(7),
        };
        let encoded = metadata.encode();
        let mut cursor = &encoded[..];
        let decoded = MessageMetadata::decode(&mut cursor).unwrap();
        assert_eq!(decoded.compression, metadata.compression);
        assert_eq!(decoded.uncompressed_size, metadata.uncompressed_size);
        assert_eq!(decoded.checksum, metadata.checksum);
        assert_eq!(decoded.num_messages_in_batch, metadata.num_messages_in_batch);
    }

    #[test]
    fn metadata_with_no_checksum_or_batch_count_roundtrips() {
        let metadata = MessageMetadata {
            compression: CompressionType::None,
            uncompressed_size: 5,
            checksum: None,
            num_messages_in_batch: None,
        };
        let encoded = metadata.encode();
        let mut cursor = &encoded[..];
        let decoded = MessageMetadata::decode(&mut cursor).unwrap();
        assert_eq!(decoded.checksum, None);
        assert_eq!(decoded.num_messages_in_batch, None);
    }

    #[test]
    fn truncated_metadata_fails_to_decode() {
        let mut cursor = &[0u8, 0, 0][..]; // compression tag + 2 of the 4 size bytes
        assert_eq!(
            MessageMetadata::decode(&mut cursor),
            Err(MetadataParseError::Truncated)
        );
    }

    #[test]
    fn unknown_compression_tag_fails_to_decode() {
        let mut cursor = &[9u8, 0, 0, 0, 0, 0, 0][..];
        assert_eq!(
            MessageMetadata::decode(&mut cursor),
            Err(MetadataParseError::UnknownCompressionTag(9))
        );
    }
}
