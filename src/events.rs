//! Domain events published by the engine.
//!
//! Consumers (audit logging, cache invalidation) subscribe to an
//! [`EventBus`] and receive a copy of every event published after they
//! subscribed. Publishing never blocks and never fails the caller.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::enforcement::RateLimitViolation;
use crate::quota::QuotaConfig;
use crate::ratelimit::RateLimitRule;

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Something that happened inside the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WardenEvent {
    RuleCreated { rule: RateLimitRule },
    RuleUpdated { rule: RateLimitRule },
    RuleDeleted { rule_id: String },
    ViolationRecorded { violation: RateLimitViolation },
    KeyBlocked {
        key: String,
        until: DateTime<Utc>,
        reason: String,
    },
    KeyUnblocked { key: String },
    QuotaCreated { quota: QuotaConfig },
    QuotaUpdated { quota: QuotaConfig },
    QuotaDeleted { quota_id: String },
    QuotaExceeded {
        quota_id: String,
        endpoint: String,
        used: u64,
        limit: u64,
    },
    StateReset { key: String },
}

impl WardenEvent {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            WardenEvent::RuleCreated { .. } => "rule_created",
            WardenEvent::RuleUpdated { .. } => "rule_updated",
            WardenEvent::RuleDeleted { .. } => "rule_deleted",
            WardenEvent::ViolationRecorded { .. } => "violation_recorded",
            WardenEvent::KeyBlocked { .. } => "key_blocked",
            WardenEvent::KeyUnblocked { .. } => "key_unblocked",
            WardenEvent::QuotaCreated { .. } => "quota_created",
            WardenEvent::QuotaUpdated { .. } => "quota_updated",
            WardenEvent::QuotaDeleted { .. } => "quota_deleted",
            WardenEvent::QuotaExceeded { .. } => "quota_exceeded",
            WardenEvent::StateReset { .. } => "state_reset",
        }
    }
}

/// Fan-out channel for [`WardenEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WardenEvent>,
}

impl EventBus {
    /// Create a bus that buffers up to `capacity` events per slow subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: WardenEvent) {
        let name = event.name();
        // No subscribers is not an error.
        match self.tx.send(event) {
            Ok(receivers) => trace!(event = name, receivers, "Event published"),
            Err(_) => trace!(event = name, "Event dropped, no subscribers"),
        }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<WardenEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}
