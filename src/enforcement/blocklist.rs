//! Explicit temporary blocking of state keys.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::clock::{duration_ms, plus_ms, Clock};
use crate::events::{EventBus, WardenEvent};
use crate::ratelimit::{RateLimitState, StateStore};

/// A key that is currently blocked.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockedKey {
    pub key: String,
    pub blocked_until: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Blocks keys independently of any rule's counters.
///
/// Blocks are stored on the same per-key state the limiter uses, so a
/// blocked key is denied by every rule that evaluates it.
pub struct BlockListManager {
    store: Arc<StateStore>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl BlockListManager {
    pub fn new(store: Arc<StateStore>, clock: Arc<dyn Clock>, events: EventBus) -> Self {
        Self {
            store,
            clock,
            events,
        }
    }

    /// Block `key` for `duration`. Returns when the block ends.
    pub fn block_key(&self, key: &str, duration: Duration, reason: &str) -> DateTime<Utc> {
        let now = self.clock.now();
        let until = plus_ms(now, duration_ms(duration));
        self.store
            .states
            .entry(key.to_string())
            .or_insert_with(|| RateLimitState::new(now))
            .block(until, reason);

        info!(key = %key, until = %until, reason = %reason, "Key blocked");
        self.events.publish(WardenEvent::KeyBlocked {
            key: key.to_string(),
            until,
            reason: reason.to_string(),
        });
        until
    }

    /// Whether `key` is blocked now. An expired block is cleared as a side effect.
    pub fn is_blocked(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.store
            .states
            .get_mut(key)
            .map_or(false, |mut state| state.active_block(now).is_some())
    }

    /// Lift a block. Returns whether the key was blocked.
    pub fn unblock_key(&self, key: &str) -> bool {
        let was_blocked = self
            .store
            .states
            .get_mut(key)
            .map_or(false, |mut state| state.unblock());

        if was_blocked {
            info!(key = %key, "Key unblocked");
            self.events.publish(WardenEvent::KeyUnblocked {
                key: key.to_string(),
            });
        }
        was_blocked
    }

    /// Keys under an active block, soonest expiry first.
    pub fn blocked_keys(&self) -> Vec<BlockedKey> {
        let now = self.clock.now();
        let mut blocked: Vec<BlockedKey> = self
            .store
            .states
            .iter_mut()
            .filter_map(|mut entry| {
                let until = entry.active_block(now)?;
                Some(BlockedKey {
                    key: entry.key().clone(),
                    blocked_until: until,
                    reason: entry.block_reason.clone(),
                })
            })
            .collect();
        blocked.sort_by(|a, b| a.blocked_until.cmp(&b.blocked_until).then_with(|| a.key.cmp(&b.key)));
        blocked
    }

    pub fn blocked_count(&self) -> usize {
        self.blocked_keys().len()
    }
}
