//! Core consumer for a partitioned, broker-mediated publish/subscribe
//! messaging system: credit-based flow control, batch acknowledgment
//! tracking, and the subscribe/reconnect/close state machine.
//!
//! See `SPEC_FULL.md` for the full design; `DESIGN.md` for the grounding
//! ledger. The broker side, partition fan-out, topic lookup/auth, and
//! cross-restart persistence of message ids are out of scope -- this crate
//! is the per-partition / per-subscription consumer core plus the
//! collaborators (`UnackedMessageTracker`, `Stats`, codecs, backoff) that
//! make it independently testable.

pub mod ack_tracker;
pub mod backoff;
pub mod codec;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod flow_control;
pub mod message_id;
pub mod queue;
pub mod receive_path;
pub mod stats;
pub mod unacked;
pub mod wire;

#[cfg(test)]
pub(crate) mod mock;

pub use config::{ConsumerConfig, SubscriptionType};
pub use consumer::{ConsumerCore, ConsumerState, MessageListener};
pub use error::{ConsumerError, Result};
pub use message_id::{AnyMessageId, BatchMessageId, MessageId};
pub use queue::Message;
pub use wire::AckType;
