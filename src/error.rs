//! Caller-visible error type for the consumer core.
//!
//! Internal recoveries (frame parse/decompress/checksum failures, stale-connection
//! discards, retriable subscribe failures) are *not* represented here -- they are
//! handled inline by the receive path and the state machine and never escape as
//! a [`ConsumerError`]. See `DiscardReason` in `receive_path` for the internal side.

use thiserror::Error;

/// Errors returned by the public operations of the consumer core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// Operation attempted after the consumer was closed.
    #[error("consumer already closed")]
    AlreadyClosed,

    /// Operation attempted while no underlying connection is available.
    #[error("consumer not connected")]
    NotConnected,

    /// Ack attempted while the consumer is not in a state that accepts acks.
    #[error("consumer not ready")]
    NotReady,

    /// A batch was received while the receiver queue size is configured to 0.
    #[error("invalid message: batched delivery is not supported with a zero-sized receiver queue")]
    InvalidMessage,

    /// A blocking receive was interrupted before a message arrived.
    #[error("receive interrupted")]
    Interrupted,

    /// The subscribe deadline elapsed before the subscription completed.
    #[error("timed out waiting for subscribe to complete")]
    Timeout,

    /// A transport-level failure, surfaced verbatim from the connection.
    #[error("connection error: {0}")]
    Connection(String),

    /// The supplied configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, ConsumerError>;
