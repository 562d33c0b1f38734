//! Delivery queue, pending async receives, and the receive flavors built on
//! top of them (SPEC_FULL.md ss4.4).
//!
//! ss9 notes that the read/write lock split between "enqueue" and
//! "receive_async's check-then-register" is a correctness necessity, not a
//! perf choice, but explicitly allows collapsing it into a single mutex as
//! long as the check-then-register stays atomic. This implementation takes
//! that option: `QueueState` is guarded by one `std::sync::Mutex` (paired
//! with a `Condvar` for the truly blocking receive flavor), so every
//! operation below already observes the combined incoming/pending-async
//! state atomically.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::ConsumerError;
use crate::message_id::AnyMessageId;

/// A message ready for delivery to the application.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: AnyMessageId,
    pub payload: Bytes,
    /// Identity of the connection this message arrived on, used by
    /// `fetch_single` to discard messages from a retired connection.
    pub connection_identity: u64,
}

/// What happened when a freshly-received message was handed to the queue.
#[derive(Debug)]
pub enum EnqueueOutcome {
    /// Handed directly to a waiting async receive. `eager_processed` tells
    /// the caller whether to invoke `on_message_processed` / unacked-tracker
    /// bookkeeping right away (true unless the queue is zero-sized).
    DispatchedToWaiter { eager_processed: bool },
    /// Pushed onto the incoming queue for a later receive call to pick up.
    Buffered,
    /// Zero-queue mode with no outstanding waiter: the message is discarded.
    Dropped,
}

struct QueueState {
    incoming: VecDeque<Message>,
    pending_async: VecDeque<oneshot::Sender<Result<Message, ConsumerError>>>,
}

pub struct DeliveryQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    waiting_on_zero_queue: std::sync::atomic::AtomicBool,
}

impl Default for DeliveryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                incoming: VecDeque::new(),
                pending_async: VecDeque::new(),
            }),
            not_empty: Condvar::new(),
            waiting_on_zero_queue: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Enqueue a freshly received message per the ss4.4 policy.
    pub fn enqueue(&self, message: Message, receiver_queue_size: u32) -> EnqueueOutcome {
        let mut state = self.state.lock().unwrap();

        if let Some(waiter) = state.pending_async.pop_front() {
            let eager_processed = receiver_queue_size != 0;
            if waiter.send(Ok(message.clone())).is_err() {
                // Receiver dropped the future; fall through to normal buffering.
                state.incoming.push_back(message);
                self.not_empty.notify_one();
                return EnqueueOutcome::Buffered;
            }
            return EnqueueOutcome::DispatchedToWaiter { eager_processed };
        }

        let zero_queue_waiting = self.waiting_on_zero_queue.load(std::sync::atomic::Ordering::Acquire);
        if receiver_queue_size != 0 || zero_queue_waiting {
            state.incoming.push_back(message);
            self.not_empty.notify_one();
            return EnqueueOutcome::Buffered;
        }

        EnqueueOutcome::Dropped
    }

    /// Non-blocking pop from the incoming queue.
    pub fn try_take(&self) -> Option<Message> {
        self.state.lock().unwrap().incoming.pop_front()
    }

    /// Block the calling thread until a message is available.
    pub fn take_blocking(&self) -> Message {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(msg) = state.incoming.pop_front() {
                return msg;
            }
            state = self.not_empty.wait(state).unwrap();
        }
    }

    /// Block with a deadline; `None` on timeout.
    pub fn take_with_timeout(&self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(msg) = state.incoming.pop_front() {
                return Some(msg);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, timeout_result) = self.not_empty.wait_timeout(state, remaining).unwrap();
            state = guard;
            if timeout_result.timed_out() && state.incoming.is_empty() {
                return None;
            }
        }
    }

    /// Non-blocking poll; if empty, registers a waiter and returns a future
    /// that resolves when a message is (eventually) enqueued for it.
    pub fn take_async(&self) -> TakeAsync {
        let mut state = self.state.lock().unwrap();
        if let Some(msg) = state.incoming.pop_front() {
            return TakeAsync::Ready(msg);
        }
        let (tx, rx) = oneshot::channel();
        state.pending_async.push_back(tx);
        TakeAsync::Pending(rx)
    }

    /// Synchronously complete `n_or_all` pending waiters (or all of them when
    /// `None`) with `err`, used on close and on the zero-queue-batch protocol
    /// violation (ss4.3 step 5, ss7 `InvalidMessage`).
    pub fn fail_pending_async(&self, err: ConsumerError) -> u32 {
        let mut state = self.state.lock().unwrap();
        let waiters: Vec<_> = state.pending_async.drain(..).collect();
        let count = waiters.len() as u32;
        for waiter in waiters {
            let _ = waiter.send(Err(err.clone()));
        }
        count
    }

    pub fn set_waiting_on_zero_queue(&self, waiting: bool) {
        self.waiting_on_zero_queue
            .store(waiting, std::sync::atomic::Ordering::Release);
    }

    /// Drain the incoming queue, discarding everything in it (used on entry
    /// to and exit from `fetch_single`, and on subscribe completion).
    pub fn drain(&self) {
        self.state.lock().unwrap().incoming.clear();
    }

    pub fn incoming_len(&self) -> usize {
        self.state.lock().unwrap().incoming.len()
    }

    pub fn is_empty(&self) -> bool {
        self.incoming_len() == 0
    }
}

/// Result of a non-blocking-then-maybe-pending poll of the queue.
pub enum TakeAsync {
    Ready(Message),
    Pending(oneshot::Receiver<Result<Message, ConsumerError>>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(ledger: u64, entry: u64, conn: u64) -> Message {
        use crate::message_id::MessageId;
        Message {
            id: AnyMessageId::Single(MessageId::new(ledger, entry, 0)),
            payload: Bytes::from_static(b"payload"),
            connection_identity: conn,
        }
    }

    #[test]
    fn buffers_when_no_waiter_and_nonzero_queue() {
        let q = DeliveryQueue::new();
        let outcome = q.enqueue(msg(1, 1, 0), 10);
        assert!(matches!(outcome, EnqueueOutcome::Buffered));
        assert_eq!(q.incoming_len(), 1);
    }

    #[test]
    fn drops_when_zero_queue_and_no_waiter() {
        let q = DeliveryQueue::new();
        let outcome = q.enqueue(msg(1, 1, 0), 0);
        assert!(matches!(outcome, EnqueueOutcome::Dropped));
        assert_eq!(q.incoming_len(), 0);
    }

    #[test]
    fn buffers_when_zero_queue_but_blocking_receive_waiting() {
        let q = DeliveryQueue::new();
        q.set_waiting_on_zero_queue(true);
        let outcome = q.enqueue(msg(1, 1, 0), 0);
        assert!(matches!(outcome, EnqueueOutcome::Buffered));
    }

    #[test]
    fn take_blocking_returns_enqueued_message() {
        let q = std::sync::Arc::new(DeliveryQueue::new());
        let q2 = std::sync::Arc::clone(&q);
        let handle = std::thread::spawn(move || q2.take_blocking());

        std::thread::sleep(Duration::from_millis(20));
        q.enqueue(msg(1, 1, 0), 10);

        let received = handle.join().unwrap();
        assert_eq!(received.connection_identity, 0);
    }

    #[test]
    fn take_with_timeout_returns_none_when_empty() {
        let q = DeliveryQueue::new();
        assert!(q.take_with_timeout(Duration::from_millis(10)).is_none());
    }

    #[tokio::test]
    async fn take_async_completes_immediately_when_buffered() {
        let q = DeliveryQueue::new();
        q.enqueue(msg(1, 1, 0), 10);
        match q.take_async() {
            TakeAsync::Ready(_) => {}
            TakeAsync::Pending(_) => panic!("expected immediate message"),
        }
    }

    #[tokio::test]
    async fn take_async_registers_waiter_when_empty_then_dispatches() {
        let q = std::sync::Arc::new(DeliveryQueue::new());
        let rx = match q.take_async() {
            TakeAsync::Pending(rx) => rx,
            TakeAsync::Ready(_) => panic!("expected pending"),
        };

        let q2 = std::sync::Arc::clone(&q);
        tokio::spawn(async move {
            q2.enqueue(msg(7, 7, 0), 10);
        });

        let received = rx.await.unwrap().unwrap();
        assert_eq!(received.id, AnyMessageId::Single(crate::message_id::MessageId::new(7, 7, 0)));
    }

    #[tokio::test]
    async fn fail_pending_async_completes_waiters_with_the_given_error() {
        let q = DeliveryQueue::new();
        let rx = match q.take_async() {
            TakeAsync::Pending(rx) => rx,
            TakeAsync::Ready(_) => panic!("expected pending"),
        };

        let failed = q.fail_pending_async(ConsumerError::InvalidMessage);
        assert_eq!(failed, 1);
        assert_eq!(rx.await.unwrap().unwrap_err(), ConsumerError::InvalidMessage);
    }
}
