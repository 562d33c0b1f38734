//! Consumer configuration.
//!
//! This crate has no CLI surface of its own (the CLI is an external collaborator,
//! per the Non-goals) so, unlike the CLI-facing configs elsewhere in this
//! codebase family, `ConsumerConfig` is a plain struct rather than a `clap::Parser`.

use std::time::Duration;

use crate::error::{ConsumerError, Result};

/// Subscription type requested at `Subscribe` time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionType {
    /// Exactly one consumer may be attached to the subscription.
    Exclusive,
    /// Messages are shared round-robin across all consumers on the subscription.
    Shared,
    /// One consumer is active; the rest stand by in priority order.
    Failover,
}

impl Default for SubscriptionType {
    fn default() -> Self {
        SubscriptionType::Shared
    }
}

/// Configuration recognized by the consumer core.
///
/// `receiver_queue_size == 0` puts the consumer in rendezvous mode: every
/// receive pulls exactly one permit from the broker and no messages are
/// buffered ahead of the application (see `FlowController` and `DeliveryQueue`).
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Topic to subscribe to.
    pub topic: String,
    /// Subscription name.
    pub subscription_name: String,
    /// Subscription type.
    pub subscription_type: SubscriptionType,
    /// Consumer name advertised to the broker (purely informational).
    pub consumer_name: Option<String>,
    /// Bound on in-flight buffered messages; 0 means rendezvous.
    pub receiver_queue_size: u32,
    /// How often the stats task logs a snapshot; 0 disables it.
    pub stats_interval_seconds: u32,
    /// Wall-clock bound on how long `subscribe()` may retry before failing.
    pub operation_timeout: Duration,
    /// Protocol constant: uncompressed payloads larger than this are corruption.
    pub max_message_size: usize,
    /// How long a delivered-but-unacked message waits before the unacked
    /// tracker triggers `redeliver_unacked()`. Zero disables the feature.
    pub ack_timeout: Duration,
}

/// Default protocol constant for maximum uncompressed message size (5 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 5 * 1024 * 1024;

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            topic: String::new(),
            subscription_name: String::new(),
            subscription_type: SubscriptionType::default(),
            consumer_name: None,
            receiver_queue_size: 1000,
            stats_interval_seconds: 60,
            operation_timeout: Duration::from_secs(30),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            ack_timeout: Duration::ZERO,
        }
    }
}

impl ConsumerConfig {
    /// Half of `receiver_queue_size`, rounded so that a queue size of 1 still
    /// refills on every processed message (threshold 0) rather than never.
    pub fn refill_threshold(&self) -> u32 {
        self.receiver_queue_size / 2
    }

    /// Reject configurations that cannot be subscribed with.
    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(ConsumerError::InvalidConfig("topic must not be empty".into()));
        }
        if self.subscription_name.trim().is_empty() {
            return Err(ConsumerError::InvalidConfig(
                "subscription_name must not be empty".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refill_threshold_is_half_queue_size() {
        let cfg = ConsumerConfig {
            receiver_queue_size: 10,
            ..Default::default()
        };
        assert_eq!(cfg.refill_threshold(), 5);
    }

    #[test]
    fn refill_threshold_of_one_is_zero() {
        let cfg = ConsumerConfig {
            receiver_queue_size: 1,
            ..Default::default()
        };
        assert_eq!(cfg.refill_threshold(), 0);
    }

    #[test]
    fn validate_rejects_empty_topic() {
        let cfg = ConsumerConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_populated_config() {
        let cfg = ConsumerConfig {
            topic: "persistent://tenant/ns/topic".into(),
            subscription_name: "sub".into(),
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }
}
