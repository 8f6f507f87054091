//! Per-key limiter state.
//!
//! Counters live in sharded concurrent maps. Every evaluation mutates its
//! key's entry while holding that entry's shard guard, so check-then-update
//! is atomic per key.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::clock::elapsed_ms;

/// Counter state for fixed window, sliding window and leaky bucket rules.
///
/// Also carries block status for the key, whatever the rule's strategy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitState {
    /// Requests counted in the current (or decayed) window
    pub request_count: u64,
    /// Leaky bucket water level
    pub level: f64,
    pub window_start: DateTime<Utc>,
    pub last_request: DateTime<Utc>,
    pub is_blocked: bool,
    pub blocked_until: Option<DateTime<Utc>>,
    pub block_reason: Option<String>,
    /// Denials recorded against this key
    pub violations: u64,
    /// When the counter would be back at rest with no further requests
    pub settles_at: DateTime<Utc>,
}

impl RateLimitState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            request_count: 0,
            level: 0.0,
            window_start: now,
            last_request: now,
            is_blocked: false,
            blocked_until: None,
            block_reason: None,
            violations: 0,
            settles_at: now,
        }
    }

    pub fn block(&mut self, until: DateTime<Utc>, reason: impl Into<String>) {
        self.is_blocked = true;
        self.blocked_until = Some(until);
        self.block_reason = Some(reason.into());
    }

    /// Clear any block. Returns whether the key was blocked.
    pub fn unblock(&mut self) -> bool {
        let was_blocked = self.is_blocked;
        self.is_blocked = false;
        self.blocked_until = None;
        self.block_reason = None;
        was_blocked
    }

    /// Expiry of the block in force at `now`, clearing a block that has lapsed.
    pub fn active_block(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.is_blocked {
            return None;
        }
        match self.blocked_until {
            Some(until) if now < until => Some(until),
            _ => {
                self.unblock();
                None
            }
        }
    }
}

/// Token bucket state, kept separately from [`RateLimitState`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenBucketState {
    /// Always within `0..=max_tokens`
    pub tokens: f64,
    pub last_refill: DateTime<Utc>,
    pub max_tokens: f64,
    /// Tokens added per second
    pub refill_rate: f64,
    /// When the bucket is full again with no further requests
    pub settles_at: DateTime<Utc>,
}

impl TokenBucketState {
    /// A full bucket.
    pub fn new(max_tokens: f64, refill_rate: f64, now: DateTime<Utc>) -> Self {
        Self {
            tokens: max_tokens,
            last_refill: now,
            max_tokens,
            refill_rate,
            settles_at: now,
        }
    }

    /// Adopt a (possibly changed) rule configuration, clamping held tokens.
    pub fn reconfigure(&mut self, max_tokens: f64, refill_rate: f64) {
        self.max_tokens = max_tokens;
        self.refill_rate = refill_rate;
        self.tokens = self.tokens.clamp(0.0, max_tokens);
    }

    /// Add tokens for the time elapsed since the last refill.
    pub fn refill(&mut self, now: DateTime<Utc>) {
        let elapsed_secs = elapsed_ms(self.last_refill, now) as f64 / 1000.0;
        self.tokens = (self.tokens + elapsed_secs * self.refill_rate).min(self.max_tokens);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }
}

/// Owner of all per-key limiter state.
#[derive(Debug, Default)]
pub struct StateStore {
    pub(crate) states: DashMap<String, RateLimitState>,
    pub(crate) buckets: DashMap<String, TokenBucketState>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, key: &str) -> Option<RateLimitState> {
        self.states.get(key).map(|s| s.clone())
    }

    pub fn bucket(&self, key: &str) -> Option<TokenBucketState> {
        self.buckets.get(key).map(|b| b.clone())
    }

    /// Remove all state for one key. Returns whether anything existed.
    pub fn clear(&self, key: &str) -> bool {
        let had_state = self.states.remove(key).is_some();
        let had_bucket = self.buckets.remove(key).is_some();
        had_state || had_bucket
    }

    /// Remove every key. Returns how many keys were tracked.
    pub fn clear_all(&self) -> usize {
        let count = self.key_count();
        self.states.clear();
        self.buckets.clear();
        count
    }

    /// Number of distinct keys with state in either map.
    pub fn key_count(&self) -> usize {
        let bucket_only = self
            .buckets
            .iter()
            .filter(|b| !self.states.contains_key(b.key()))
            .count();
        self.states.len() + bucket_only
    }

    /// Drop state untouched since `cutoff` that has also settled by `now`.
    /// Keys under an active block are kept.
    pub fn evict_idle(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> usize {
        let before = self.states.len() + self.buckets.len();
        self.states.retain(|_, state| {
            state.last_request >= cutoff
                || now < state.settles_at
                || state.active_block(now).is_some()
        });
        self.buckets
            .retain(|_, bucket| bucket.last_refill >= cutoff || now < bucket.settles_at);
        before - (self.states.len() + self.buckets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_block_expires_lazily() {
        let now = Utc::now();
        let mut state = RateLimitState::new(now);
        state.block(now + Duration::seconds(1), "abuse");

        assert_eq!(state.active_block(now), Some(now + Duration::seconds(1)));
        assert!(state.is_blocked);

        assert_eq!(state.active_block(now + Duration::seconds(1)), None);
        assert!(!state.is_blocked);
        assert!(state.block_reason.is_none());
    }

    #[test]
    fn test_bucket_refill_caps_at_max() {
        let now = Utc::now();
        let mut bucket = TokenBucketState::new(5.0, 1.0, now);
        bucket.tokens = 0.0;

        bucket.refill(now + Duration::seconds(2));
        assert_eq!(bucket.tokens, 2.0);

        bucket.refill(now + Duration::seconds(60));
        assert_eq!(bucket.tokens, 5.0);
    }

    #[test]
    fn test_reconfigure_clamps_tokens() {
        let mut bucket = TokenBucketState::new(10.0, 1.0, Utc::now());
        bucket.reconfigure(4.0, 2.0);
        assert_eq!(bucket.tokens, 4.0);
        assert_eq!(bucket.refill_rate, 2.0);
    }

    #[test]
    fn test_evict_idle_keeps_recent_and_blocked() {
        let store = StateStore::new();
        let now = Utc::now();
        let old = now - Duration::hours(2);

        store.states.insert("stale".to_string(), RateLimitState::new(old));
        store.states.insert("fresh".to_string(), RateLimitState::new(now));
        let mut blocked = RateLimitState::new(old);
        blocked.block(now + Duration::minutes(5), "manual");
        store.states.insert("blocked".to_string(), blocked);
        store
            .buckets
            .insert("old-bucket".to_string(), TokenBucketState::new(1.0, 1.0, old));

        let removed = store.evict_idle(now - Duration::hours(1), now);
        assert_eq!(removed, 2);
        assert!(store.state("fresh").is_some());
        assert!(store.state("blocked").is_some());
        assert!(store.state("stale").is_none());
        assert!(store.bucket("old-bucket").is_none());
    }

    #[test]
    fn test_evict_idle_keeps_unsettled_windows() {
        let store = StateStore::new();
        let now = Utc::now();
        let old = now - Duration::hours(2);

        let mut running = RateLimitState::new(old);
        running.settles_at = old + Duration::hours(24);
        store.states.insert("running".to_string(), running);
        let mut refilling = TokenBucketState::new(10.0, 0.001, old);
        refilling.settles_at = now + Duration::minutes(30);
        store.buckets.insert("refilling".to_string(), refilling);

        assert_eq!(store.evict_idle(now - Duration::hours(1), now), 0);

        let later = old + Duration::hours(25);
        assert_eq!(store.evict_idle(later - Duration::hours(1), later), 2);
    }

    #[test]
    fn test_key_count_deduplicates_maps() {
        let store = StateStore::new();
        let now = Utc::now();
        store.states.insert("a".to_string(), RateLimitState::new(now));
        store.buckets.insert("a".to_string(), TokenBucketState::new(1.0, 1.0, now));
        store.buckets.insert("b".to_string(), TokenBucketState::new(1.0, 1.0, now));
        assert_eq!(store.key_count(), 2);
        assert_eq!(store.clear_all(), 2);
        assert_eq!(store.key_count(), 0);
    }
}
