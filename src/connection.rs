//! Collaborator interfaces for the shared connection and the owning client
//! context (SPEC_FULL.md ss6). Both are external in the real system; this
//! crate only defines the traits `ConsumerCore` is written against.

use async_trait::async_trait;

use crate::error::Result;
use crate::wire::Command;

/// Outcome of a `Subscribe` round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Ok,
    /// Carries whether the failure is worth retrying before the subscribe
    /// deadline (vs. fatal).
    Err { retriable: bool, message: String },
}

/// The shared, possibly-swapped-under-us connection a consumer is registered on.
///
/// Not owned by the consumer -- see SPEC_FULL.md ss3 and ss9 "Shared connection".
/// Whatever owns the concrete connection (reconnecting it, noticing it has
/// dropped) is expected to call `ConsumerCore::connection_lost` with this
/// connection's `identity()` once it detects the drop, symmetric to calling
/// `connection_opened` once a replacement is ready.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send a request that expects a correlated reply (e.g. `Subscribe`).
    async fn send_request_with_id(&self, command: Command, request_id: u64) -> Result<SubscribeOutcome>;

    /// Send a fire-and-forget command (`Flow`, `Ack`, `RedeliverUnacknowledgedMessages`)
    /// and resolve once the write has flushed.
    async fn write_and_flush(&self, command: Command) -> Result<()>;

    fn register_consumer(&self, consumer_id: u64);
    fn remove_consumer(&self, consumer_id: u64);

    /// Protocol version of the remote peer; gates `redeliver_unacked` (ss4.7).
    fn remote_endpoint_protocol_version(&self) -> u32;

    /// Force-close the underlying channel, e.g. to trigger a reconnect.
    fn close_channel(&self);

    /// Stable identity used to detect a stale (retired) connection in
    /// rendezvous mode (ss4.4 `fetch_single`).
    fn identity(&self) -> u64;
}

/// Owning client context (SPEC_FULL.md ss6 "Client context").
pub trait ClientContext: Send + Sync {
    fn new_consumer_id(&self) -> u64;
    fn new_request_id(&self) -> u64;
    fn operation_timeout_ms(&self) -> u64;
    fn stats_interval_seconds(&self) -> u32;
    fn cleanup_consumer(&self, consumer_id: u64);

    /// `grab_connection` (SPEC_FULL.md ss4.6): ask the owning client to
    /// (re)acquire a connection for `consumer_id` and invoke
    /// `ConsumerCore::connection_opened` on it once one is available. Called
    /// on first subscribe and, after a retriable failure, again from the
    /// backoff-delayed retry (ss4.6 "Connecting -> Connecting" transition).
    fn request_new_connection(&self, consumer_id: u64);
}
