//! The consumer state machine and the integration point for every other
//! module in this crate (SPEC_FULL.md ss4.6).

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex as PLMutex, RwLock as PLRwLock};
use tokio::sync::oneshot;

use crate::ack_tracker::BatchAckTracker;
use crate::backoff::Backoff;
use crate::config::ConsumerConfig;
use crate::connection::{ClientContext, Connection, SubscribeOutcome};
use crate::error::{ConsumerError, Result};
use crate::flow_control::FlowController;
use crate::message_id::{AnyMessageId, MessageId};
use crate::queue::{DeliveryQueue, EnqueueOutcome, Message};
use crate::receive_path::{Dispatch, IncomingFrame, ReceiveFailure, ReceivePath};
use crate::stats::Stats;
use crate::unacked::UnackedMessageTracker;
use crate::wire::{AckType, Command, SubTypeWire};

/// Where the consumer sits in the ss4.6 state table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConsumerState {
    Uninitialized = 0,
    Connecting = 1,
    Ready = 2,
    Closing = 3,
    Closed = 4,
    Failed = 5,
}

impl ConsumerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConsumerState::Uninitialized,
            1 => ConsumerState::Connecting,
            2 => ConsumerState::Ready,
            3 => ConsumerState::Closing,
            4 => ConsumerState::Closed,
            _ => ConsumerState::Failed,
        }
    }
}

struct StateCell(AtomicU8);

impl StateCell {
    fn new(initial: ConsumerState) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    fn get(&self) -> ConsumerState {
        ConsumerState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: ConsumerState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Transition iff currently `from`. Returns whether it happened.
    fn compare_and_set(&self, from: ConsumerState, to: ConsumerState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Function invoked (on a spawned task) for every message dispatched while a
/// listener is registered, re-pulling it through the same receive primitive
/// the application uses so permits/unacked bookkeeping stays correct (ss9
/// "Listener pump").
pub type MessageListener = Arc<dyn Fn(Arc<ConsumerCore>) + Send + Sync>;

/// The per-partition / per-subscription consumer core.
pub struct ConsumerCore {
    config: ConsumerConfig,
    consumer_id: u64,
    partition_index: i32,
    client: Arc<dyn ClientContext>,

    state: StateCell,
    connection: PLRwLock<Option<Arc<dyn Connection>>>,
    subscribe_deadline: PLMutex<Option<Instant>>,
    subscribe_waiter: PLMutex<Option<oneshot::Sender<Result<()>>>>,
    reconnect_guard: PLMutex<()>,
    stats_started: AtomicBool,
    /// Whether a subscribe has ever completed successfully. Gates the
    /// initial-credit grant in `on_subscribe_succeeded` (ss4.6 step 4): a
    /// partitioned consumer's *first* subscribe does not self-grant, because
    /// the owning multi-topic consumer grants credit on its behalf.
    first_subscribe_done: AtomicBool,

    ack_tracker: BatchAckTracker,
    unacked: UnackedMessageTracker,
    flow: FlowController,
    stats: Stats,
    queue: DeliveryQueue,
    backoff: PLMutex<Backoff>,
    receive_path: ReceivePath,

    listener: Option<MessageListener>,
    self_weak: PLMutex<Weak<ConsumerCore>>,
}

impl ConsumerCore {
    pub fn new(
        config: ConsumerConfig,
        consumer_id: u64,
        partition_index: i32,
        client: Arc<dyn ClientContext>,
        listener: Option<MessageListener>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let ack_timeout = config.ack_timeout;
        let flow = FlowController::new(&config);

        let core = Arc::new_cyclic(|weak: &Weak<ConsumerCore>| {
            let weak_for_timeout = weak.clone();
            ConsumerCore {
                config: config.clone(),
                consumer_id,
                partition_index,
                client,
                state: StateCell::new(ConsumerState::Uninitialized),
                connection: PLRwLock::new(None),
                subscribe_deadline: PLMutex::new(None),
                subscribe_waiter: PLMutex::new(None),
                reconnect_guard: PLMutex::new(()),
                stats_started: AtomicBool::new(false),
                first_subscribe_done: AtomicBool::new(false),
                ack_tracker: BatchAckTracker::new(),
                unacked: UnackedMessageTracker::new(ack_timeout, Duration::from_secs(1), move || {
                    if let Some(core) = weak_for_timeout.upgrade() {
                        let core2 = Arc::clone(&core);
                        tokio::spawn(async move { core2.redeliver_unacked().await });
                    }
                }),
                flow,
                stats: Stats::new(),
                queue: DeliveryQueue::new(),
                backoff: PLMutex::new(Backoff::default()),
                receive_path: ReceivePath::new(),
                listener,
                self_weak: PLMutex::new(weak.clone()),
            }
        });

        Ok(core)
    }

    pub fn state(&self) -> ConsumerState {
        self.state.get()
    }

    pub fn stats(&self) -> crate::stats::StatsSnapshot {
        self.stats.snapshot()
    }

    /// Begin subscribing: arms the deadline, moves Uninitialized ->
    /// Connecting, and asks the client for a connection (ss4.6
    /// `Uninitialized -> Connecting`, action "request connection from
    /// client"). `connection_opened` must be called (by the owning client,
    /// once a connection is available) to actually progress to `Ready`.
    pub fn start(&self) {
        *self.subscribe_deadline.lock() = Some(Instant::now() + self.config.operation_timeout);
        self.state.set(ConsumerState::Connecting);
        self.client.request_new_connection(self.consumer_id);
    }

    /// Register a future that resolves when the first subscribe completes
    /// (successfully or with `Failed`).
    pub fn subscribe_future(&self) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        *self.subscribe_waiter.lock() = Some(tx);
        rx
    }

    /// ss4.6 `connection_opened`: called whenever a (re)connection becomes
    /// available. Drives Connecting -> Ready on a successful subscribe reply,
    /// or schedules/gives up on reconnection per the backoff/deadline policy.
    pub async fn connection_opened(self: &Arc<Self>, connection: Arc<dyn Connection>) -> Result<()> {
        let _guard = self.reconnect_guard.lock();

        connection.register_consumer(self.consumer_id);

        let request_id = self.client.new_request_id();
        let command = Command::Subscribe {
            topic: self.config.topic.clone(),
            subscription: self.config.subscription_name.clone(),
            consumer_id: self.consumer_id,
            request_id,
            sub_type: SubTypeWire::from(self.config.subscription_type),
            consumer_name: self.config.consumer_name.clone(),
        };

        let outcome = connection.send_request_with_id(command, request_id).await;

        match outcome {
            Ok(SubscribeOutcome::Ok) => self.on_subscribe_succeeded(connection).await,
            Ok(SubscribeOutcome::Err { retriable, message }) => {
                self.on_subscribe_failed(connection, retriable, message)
            }
            Err(err) => self.on_subscribe_failed(connection, true, err.to_string()),
        }
    }

    /// ss4.6 `Ready -> Connecting` ("connection_lost"): invoked (by whatever
    /// owns the shared `Connection`, symmetric to `connection_opened`) once it
    /// detects the connection has dropped. Mirrors `on_subscribe_failed`'s
    /// reconnect-request logic: grab a new connection, no backoff on the
    /// first attempt since this isn't a retry of a failed RPC.
    pub fn connection_lost(self: &Arc<Self>, lost_connection_identity: u64) {
        let still_current = self
            .connection
            .read()
            .as_ref()
            .map(|c| c.identity() == lost_connection_identity)
            .unwrap_or(false);
        if !still_current {
            // Already superseded by a newer connection; nothing to do.
            return;
        }

        if !self.state.compare_and_set(ConsumerState::Ready, ConsumerState::Connecting) {
            return;
        }

        *self.connection.write() = None;
        *self.subscribe_deadline.lock() = Some(Instant::now() + self.config.operation_timeout);

        tracing::warn!(consumer_id = self.consumer_id, "connection lost, reconnecting");
        self.client.request_new_connection(self.consumer_id);
    }

    async fn on_subscribe_succeeded(self: &Arc<Self>, connection: Arc<dyn Connection>) -> Result<()> {
        self.queue.drain();
        self.ack_tracker.clear();
        self.unacked.clear();

        if !self.state.compare_and_set(ConsumerState::Connecting, ConsumerState::Ready) {
            // Closed (or closing) while we were awaiting the subscribe reply.
            self.state.set(ConsumerState::Closed);
            connection.remove_consumer(self.consumer_id);
            connection.close_channel();
            self.client.cleanup_consumer(self.consumer_id);
            return Err(ConsumerError::AlreadyClosed);
        }

        self.backoff.lock().reset();
        *self.connection.write() = Some(Arc::clone(&connection));

        // ss4.6 step 4: reset permits on every Ready transition, but only
        // self-grant the initial credit unless this is a partitioned
        // consumer's very first subscribe (its owning multi-topic consumer
        // grants credit on its behalf in that one case).
        let already_subscribed_once = self.first_subscribe_done.swap(true, Ordering::AcqRel);
        let skip_initial_grant = !already_subscribed_once && self.partition_index != -1;

        if let Some(permits) = self.flow.on_reconnect() {
            if !skip_initial_grant {
                let _ = connection
                    .write_and_flush(Command::Flow {
                        consumer_id: self.consumer_id,
                        permits,
                    })
                    .await;
            }
        }

        if self.config.stats_interval_seconds != 0
            && !self.stats_started.swap(true, Ordering::AcqRel)
        {
            self.stats.start_reporter(
                self.config.consumer_name.clone().unwrap_or_default(),
                Duration::from_secs(self.config.stats_interval_seconds as u64),
            );
        }

        if let Some(waiter) = self.subscribe_waiter.lock().take() {
            let _ = waiter.send(Ok(()));
        }

        tracing::info!(
            consumer_id = self.consumer_id,
            topic = %self.config.topic,
            "consumer subscribed"
        );

        Ok(())
    }

    fn on_subscribe_failed(
        self: &Arc<Self>,
        connection: Arc<dyn Connection>,
        retriable: bool,
        message: String,
    ) -> Result<()> {
        let deadline = *self.subscribe_deadline.lock();
        let past_deadline = deadline.map(|d| Instant::now() >= d).unwrap_or(true);

        if !retriable || past_deadline {
            self.state.set(ConsumerState::Failed);
            connection.remove_consumer(self.consumer_id);
            self.client.cleanup_consumer(self.consumer_id);
            let err = if past_deadline {
                ConsumerError::Timeout
            } else {
                ConsumerError::Connection(message.clone())
            };
            if let Some(waiter) = self.subscribe_waiter.lock().take() {
                let _ = waiter.send(Err(err.clone()));
            }
            tracing::error!(consumer_id = self.consumer_id, %message, "subscribe failed fatally");
            return Err(err);
        }

        let delay = self.backoff.lock().next_delay();
        tracing::warn!(
            consumer_id = self.consumer_id,
            %message,
            delay_ms = delay.as_millis() as u64,
            "subscribe failed, will retry"
        );

        // ss4.6 "Connecting -> Connecting": schedule the delayed reconnect
        // attempt off a weak handle so a consumer dropped mid-backoff doesn't
        // get kept alive (or re-subscribed) just to service this retry.
        let weak = self.self_weak.lock().clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(core) = weak.upgrade() else { return };
            if !matches!(core.state.get(), ConsumerState::Connecting) {
                return;
            }
            core.client.request_new_connection(core.consumer_id);
        });

        Ok(())
    }

    /// ss4.7 redeliver.
    pub async fn redeliver_unacked(&self) {
        let connection = self.connection.read().clone();
        let Some(connection) = connection else {
            tracing::debug!(consumer_id = self.consumer_id, "redeliver skipped: not connected");
            return;
        };

        if matches!(self.state.get(), ConsumerState::Connecting) {
            tracing::debug!(consumer_id = self.consumer_id, "redeliver skipped: reconnecting");
            return;
        }

        if connection.remote_endpoint_protocol_version() >= 2 {
            self.unacked.clear();
            let _ = connection
                .write_and_flush(Command::RedeliverUnacknowledgedMessages {
                    consumer_id: self.consumer_id,
                })
                .await;
        } else {
            connection.close_channel();
        }
    }

    /// ss4.5 ack path.
    #[tracing::instrument(skip(self), fields(consumer_id = self.consumer_id))]
    pub async fn acknowledge(&self, id: AnyMessageId, ack_type: AckType) -> Result<()> {
        if !matches!(self.state.get(), ConsumerState::Ready | ConsumerState::Connecting) {
            self.stats.record_ack_failure();
            return Err(ConsumerError::NotReady);
        }

        let target = match id {
            AnyMessageId::Batch(bid) => {
                let outcome = match ack_type {
                    AckType::Individual => self.ack_tracker.ack_individual(bid.entry_key(), bid.batch_index),
                    AckType::Cumulative => self.ack_tracker.ack_cumulative_batch(bid.entry_key(), bid.batch_index),
                };

                if let Some(lower) = outcome.lower_cumulative_ack {
                    Some((lower, AckType::Cumulative, None))
                } else if outcome.broker_ackable {
                    Some((bid.entry_key(), ack_type, outcome.completed_batch_size))
                } else {
                    None
                }
            }
            AnyMessageId::Single(key) => {
                if ack_type == AckType::Cumulative {
                    self.ack_tracker.prune_below(key);
                }
                Some((key, ack_type, None))
            }
        };

        let Some((key, ack_type, completed_batch_size)) = target else {
            // Deferred: batch entry still has outstanding members.
            return Ok(());
        };

        let connection = self.connection.read().clone();
        let Some(connection) = connection else {
            self.stats.record_ack_failure();
            return Err(ConsumerError::NotConnected);
        };

        let result = connection
            .write_and_flush(Command::Ack {
                consumer_id: self.consumer_id,
                ledger_id: key.ledger_id,
                entry_id: key.entry_id,
                ack_type,
                validation_error: None,
            })
            .await;

        match result {
            Ok(()) => {
                match ack_type {
                    AckType::Individual => {
                        self.unacked.remove(key);
                        self.stats.record_acks_sent(completed_batch_size.unwrap_or(1) as u64);
                    }
                    AckType::Cumulative => {
                        let removed = self.unacked.remove_messages_till(key);
                        self.stats.record_acks_sent(removed as u64);
                    }
                }
                Ok(())
            }
            Err(err) => {
                self.stats.record_ack_failure();
                Err(err)
            }
        }
    }

    /// Emit a validation-error ack and restore one flow credit for a frame
    /// discarded by the receive path.
    async fn ack_discard(&self, entry: MessageId, reason: crate::receive_path::DiscardReason) {
        self.stats.record_receive_failure();
        if let Some(permits) = self.flow.on_corrupted_message_discarded() {
            if let Some(connection) = self.connection.read().clone() {
                let _ = connection
                    .write_and_flush(Command::Flow {
                        consumer_id: self.consumer_id,
                        permits,
                    })
                    .await;
            }
        }
        if let Some(connection) = self.connection.read().clone() {
            let _ = connection
                .write_and_flush(Command::Ack {
                    consumer_id: self.consumer_id,
                    ledger_id: entry.ledger_id,
                    entry_id: entry.entry_id,
                    ack_type: AckType::Individual,
                    validation_error: Some(reason.as_validation_error()),
                })
                .await;
        }
        tracing::warn!(?entry, ?reason, "discarded corrupted frame");
    }

    /// ss4.3/ss4.4: handle one inbound frame all the way to enqueued messages.
    pub async fn on_message_frame(self: &Arc<Self>, frame: IncomingFrame) {
        let connection_identity = frame.connection_identity;
        let bytes_len = frame.payload.len();

        match self.receive_path.process(frame, self.config.max_message_size) {
            Err(ReceiveFailure::Discard(outcome)) => {
                self.ack_discard(outcome.entry, outcome.reason).await;
            }
            Err(ReceiveFailure::ZeroQueueBatchUnsupported) => unreachable!(
                "ReceivePath::process never returns this variant; the zero-queue guard runs after parsing"
            ),
            Ok(dispatch) => {
                if ReceivePath::reject_batch_on_zero_queue(&dispatch, self.config.receiver_queue_size).is_some() {
                    tracing::error!(
                        consumer_id = self.consumer_id,
                        "batch received with a zero-sized receiver queue; closing"
                    );
                    self.queue.fail_pending_async(ConsumerError::InvalidMessage);
                    let _ = self.close().await;
                    return;
                }
                self.stats.record_received(bytes_len);
                self.enqueue_dispatch(dispatch, connection_identity).await;
            }
        }
    }

    async fn enqueue_dispatch(self: &Arc<Self>, dispatch: Dispatch, _connection_identity: u64) {
        if let Dispatch::Batch { entry, batch_size, .. } = &dispatch {
            self.ack_tracker.create_entry(*entry, *batch_size);
        }

        let receiver_queue_size = self.config.receiver_queue_size;
        let messages = match dispatch {
            Dispatch::Single(msg) => vec![msg],
            Dispatch::Batch { messages, .. } => messages,
        };

        for message in messages {
            let key = message.id.key();
            let outcome = self.queue.enqueue(message, receiver_queue_size);
            if let EnqueueOutcome::DispatchedToWaiter { eager_processed } = outcome {
                if eager_processed {
                    // The oneshot resolves the waiting `receive_async` caller directly;
                    // do the bookkeeping here so it isn't repeated on the receiving side.
                    self.record_delivery(key);
                }
            }
            if let Some(listener) = &self.listener {
                let listener = Arc::clone(listener);
                let core = Arc::clone(self);
                tokio::spawn(async move { listener(core) });
            }
        }
    }

    fn on_delivered(&self) {
        if let Some(permits) = self.flow.on_message_processed() {
            if let Some(connection) = self.connection.read().clone() {
                let consumer_id = self.consumer_id;
                tokio::spawn(async move {
                    let _ = connection
                        .write_and_flush(Command::Flow { consumer_id, permits })
                        .await;
                });
            }
        }
    }

    fn record_delivery(&self, key: MessageId) {
        self.unacked.add(key, Instant::now() + self.config.ack_timeout);
        self.on_delivered();
    }

    /// ss4.4 `receive_blocking`.
    pub fn receive_blocking(&self) -> Result<Message> {
        if self.config.receiver_queue_size == 0 {
            return self.fetch_single();
        }
        let message = self.queue.take_blocking();
        self.record_delivery(message.id.key());
        Ok(message)
    }

    /// ss4.4 `receive_with_timeout`.
    pub fn receive_with_timeout(&self, timeout: Duration) -> Result<Option<Message>> {
        match self.queue.take_with_timeout(timeout) {
            Some(message) => {
                self.record_delivery(message.id.key());
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    /// ss4.4 `receive_async`.
    pub async fn receive_async(&self) -> Result<Message> {
        match self.queue.take_async() {
            crate::queue::TakeAsync::Ready(message) => {
                self.record_delivery(message.id.key());
                Ok(message)
            }
            crate::queue::TakeAsync::Pending(rx) => {
                let message = rx.await.map_err(|_| ConsumerError::Interrupted)??;
                // Bookkeeping already ran in `enqueue_dispatch`'s eager-dispatch
                // branch: this oneshot is only ever resolved from there.
                Ok(message)
            }
        }
    }

    /// ss4.4 `fetch_single`, rendezvous receive for a zero-sized queue.
    fn fetch_single(&self) -> Result<Message> {
        self.queue.set_waiting_on_zero_queue(true);

        if let Some(connection) = self.connection.read().clone() {
            let consumer_id = self.consumer_id;
            tokio::spawn(async move {
                let _ = connection
                    .write_and_flush(Command::Flow {
                        consumer_id,
                        permits: FlowController::zero_queue_permit(),
                    })
                    .await;
            });
        }

        let current_identity = self.connection.read().as_ref().map(|c| c.identity());

        let result = loop {
            let message = self.queue.take_blocking();
            if current_identity.is_none() || Some(message.connection_identity) == current_identity {
                break message;
            }
            // Stale delivery from a retired connection: discard and keep waiting.
        };

        self.queue.set_waiting_on_zero_queue(false);
        self.queue.drain();

        Ok(result)
    }

    /// ss4.6 close, reachable from any state.
    pub async fn close(self: &Arc<Self>) -> Result<()> {
        let current = self.state.get();
        if matches!(current, ConsumerState::Closing | ConsumerState::Closed) {
            self.unacked.close();
            return Ok(());
        }

        self.state.set(ConsumerState::Closing);

        if let Some(connection) = self.connection.read().clone() {
            let request_id = self.client.new_request_id();
            let _ = connection
                .write_and_flush(Command::CloseConsumer {
                    consumer_id: self.consumer_id,
                    request_id,
                })
                .await;
            connection.remove_consumer(self.consumer_id);
        }

        self.unacked.close();
        self.stats.stop_reporter();
        self.ack_tracker.clear();

        self.queue.fail_pending_async(ConsumerError::AlreadyClosed);

        self.state.set(ConsumerState::Closed);
        self.client.cleanup_consumer(self.consumer_id);

        tracing::info!(consumer_id = self.consumer_id, "consumer closed");
        Ok(())
    }

    /// ss4.6 unsubscribe: same `Closing -> Closed` shape as `close`, but with
    /// `Unsubscribe` instead of `CloseConsumer` on the wire.
    pub async fn unsubscribe(self: &Arc<Self>) -> Result<()> {
        if !matches!(self.state.get(), ConsumerState::Ready | ConsumerState::Connecting) {
            return Err(ConsumerError::NotReady);
        }
        self.state.set(ConsumerState::Closing);

        if let Some(connection) = self.connection.read().clone() {
            let request_id = self.client.new_request_id();
            let _ = connection
                .write_and_flush(Command::Unsubscribe {
                    consumer_id: self.consumer_id,
                    request_id,
                })
                .await;
        }

        self.close().await
    }

    pub fn partition_index(&self) -> i32 {
        self.partition_index
    }
}
