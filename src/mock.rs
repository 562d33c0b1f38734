//! Test-only fakes for the `Connection`/`ClientContext` collaborators.
//!
//! `MockConnection` records every frame it is asked to send so assertions
//! can inspect the exact `Flow`/`Ack` sequence a scenario emits, mirroring
//! the literal end-to-end scenarios in SPEC_FULL.md ss8.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::connection::{ClientContext, Connection, SubscribeOutcome};
use crate::error::Result;
use crate::wire::{AckType, Command, ValidationError};

/// Initialize logging for a test, mirroring the `try_init().ok()` idiom used
/// throughout this codebase family's e2e tests -- safe to call from every
/// test in this binary since only the first call actually installs a subscriber.
pub fn init_test_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("partition_consumer_core=debug")
        .with_test_writer()
        .try_init()
        .ok();
}

#[derive(Default)]
pub struct MockConnection {
    identity: u64,
    subscribe_ok: bool,
    subscribe_failure: Option<(bool, String)>,
    protocol_version: u32,
    sent: Mutex<Vec<Command>>,
}

impl MockConnection {
    pub fn new(identity: u64, subscribe_ok: bool) -> Self {
        Self {
            identity,
            subscribe_ok,
            subscribe_failure: None,
            protocol_version: 2,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn with_subscribe_failure(identity: u64, retriable: bool, message: String) -> Self {
        Self {
            identity,
            subscribe_ok: false,
            subscribe_failure: Some((retriable, message)),
            protocol_version: 2,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub fn sent_flows(&self) -> Vec<u32> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                Command::Flow { permits, .. } => Some(*permits),
                _ => None,
            })
            .collect()
    }

    pub fn sent_acks(&self) -> Vec<(u64, u64, Option<ValidationError>)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                Command::Ack {
                    ledger_id,
                    entry_id,
                    validation_error,
                    ..
                } => Some((*ledger_id, *entry_id, *validation_error)),
                _ => None,
            })
            .collect()
    }

    pub fn sent_cumulative_acks(&self) -> Vec<(u64, u64)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                Command::Ack {
                    ledger_id,
                    entry_id,
                    ack_type: AckType::Cumulative,
                    ..
                } => Some((*ledger_id, *entry_id)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn send_request_with_id(&self, command: Command, _request_id: u64) -> Result<SubscribeOutcome> {
        self.sent.lock().unwrap().push(command);
        if self.subscribe_ok {
            return Ok(SubscribeOutcome::Ok);
        }
        if let Some((retriable, message)) = &self.subscribe_failure {
            return Ok(SubscribeOutcome::Err {
                retriable: *retriable,
                message: message.clone(),
            });
        }
        Ok(SubscribeOutcome::Ok)
    }

    async fn write_and_flush(&self, command: Command) -> Result<()> {
        self.sent.lock().unwrap().push(command);
        Ok(())
    }

    fn register_consumer(&self, _consumer_id: u64) {}

    fn remove_consumer(&self, _consumer_id: u64) {}

    fn remote_endpoint_protocol_version(&self) -> u32 {
        self.protocol_version
    }

    fn close_channel(&self) {}

    fn identity(&self) -> u64 {
        self.identity
    }
}

pub struct MockClientContext {
    next_consumer_id: AtomicU64,
    next_request_id: AtomicU64,
    reconnect_requests: AtomicU64,
}

impl Default for MockClientContext {
    fn default() -> Self {
        Self {
            next_consumer_id: AtomicU64::new(1),
            next_request_id: AtomicU64::new(1),
            reconnect_requests: AtomicU64::new(0),
        }
    }
}

impl MockClientContext {
    pub fn reconnect_request_count(&self) -> u64 {
        self.reconnect_requests.load(Ordering::Relaxed)
    }
}

impl ClientContext for MockClientContext {
    fn new_consumer_id(&self) -> u64 {
        self.next_consumer_id.fetch_add(1, Ordering::Relaxed)
    }

    fn new_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn operation_timeout_ms(&self) -> u64 {
        30_000
    }

    fn stats_interval_seconds(&self) -> u32 {
        0
    }

    fn cleanup_consumer(&self, _consumer_id: u64) {}

    fn request_new_connection(&self, _consumer_id: u64) {
        self.reconnect_requests.fetch_add(1, Ordering::Relaxed);
    }
}
