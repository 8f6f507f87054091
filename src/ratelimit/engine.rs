//! Core limiter: evaluates one rule against one key.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, trace};

use super::key::StateKey;
use super::rule::{RateLimitRule, Strategy};
use super::state::{RateLimitState, StateStore, TokenBucketState};
use crate::clock::{elapsed_ms, plus_ms, Clock};

/// Slack for float comparisons of bucket levels.
const LEVEL_EPSILON: f64 = 1e-9;

/// Result of evaluating one rule for one key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    pub allowed: bool,
    pub remaining: u64,
    pub limit: u64,
    pub reset_at: DateTime<Utc>,
    /// Seconds the caller should wait, set on denial
    pub retry_after: Option<u64>,
    /// Count (or level) observed by this evaluation, including the request itself
    pub observed: u64,
    /// Denied because the key is explicitly blocked
    pub blocked: bool,
}

type CounterStrategy = fn(&RateLimitRule, &mut RateLimitState, DateTime<Utc>) -> Outcome;

/// Applies the four limiting strategies to per-key state.
///
/// Thread-safe; every evaluation holds the key's shard guard for its whole
/// read-modify-write so concurrent requests for one key cannot over-admit.
pub struct LimiterEngine {
    store: Arc<StateStore>,
    clock: Arc<dyn Clock>,
}

impl LimiterEngine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_store(Arc::new(StateStore::new()), clock)
    }

    pub fn with_store(store: Arc<StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// The state this engine owns, shared with the block list.
    pub fn state_store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Count one request against `key` under `rule`.
    pub fn evaluate(&self, rule: &RateLimitRule, key: &StateKey) -> Outcome {
        let now = self.clock.now();

        trace!(
            key = %key,
            rule_id = %rule.id,
            strategy = %rule.strategy,
            "Evaluating rate limit"
        );

        let outcome = match rule.strategy {
            Strategy::FixedWindow => self.evaluate_counter(rule, key, now, fixed_window),
            Strategy::SlidingWindow => self.evaluate_counter(rule, key, now, sliding_window),
            Strategy::LeakyBucket => self.evaluate_counter(rule, key, now, leaky_bucket),
            Strategy::TokenBucket => self.evaluate_token_bucket(rule, key, now),
        };

        if !outcome.allowed {
            debug!(
                key = %key,
                rule_id = %rule.id,
                observed = outcome.observed,
                limit = outcome.limit,
                blocked = outcome.blocked,
                "Rate limit exceeded"
            );
        }
        outcome
    }

    fn evaluate_counter(
        &self,
        rule: &RateLimitRule,
        key: &StateKey,
        now: DateTime<Utc>,
        strategy: CounterStrategy,
    ) -> Outcome {
        let mut entry = self
            .store
            .states
            .entry(key.to_string())
            .or_insert_with(|| RateLimitState::new(now));
        let state = entry.value_mut();

        if let Some(until) = state.active_block(now) {
            state.violations += 1;
            state.last_request = now;
            return blocked_outcome(rule, until, now);
        }

        let outcome = strategy(rule, state, now);
        state.last_request = now;
        state.settles_at = outcome.reset_at;
        if !outcome.allowed {
            note_denial(rule, state, now);
        }
        outcome
    }

    fn evaluate_token_bucket(
        &self,
        rule: &RateLimitRule,
        key: &StateKey,
        now: DateTime<Utc>,
    ) -> Outcome {
        // Lock order: states before buckets, never both at once.
        if let Some(mut state) = self.store.states.get_mut(key.as_str()) {
            if let Some(until) = state.active_block(now) {
                state.violations += 1;
                state.last_request = now;
                return blocked_outcome(rule, until, now);
            }
        }

        let capacity = rule.capacity() as f64;
        let rate = rule.rate_per_sec();
        let outcome = {
            let mut bucket = self
                .store
                .buckets
                .entry(key.to_string())
                .or_insert_with(|| TokenBucketState::new(capacity, rate, now));
            bucket.reconfigure(capacity, rate);
            bucket.refill(now);
            let outcome = token_bucket(rule, bucket.value_mut(), now);
            bucket.settles_at = outcome.reset_at;
            outcome
        };

        if !outcome.allowed {
            let mut state = self
                .store
                .states
                .entry(key.to_string())
                .or_insert_with(|| RateLimitState::new(now));
            state.last_request = now;
            note_denial(rule, state.value_mut(), now);
        }
        outcome
    }

    pub fn state(&self, key: &str) -> Option<RateLimitState> {
        self.store.state(key)
    }

    pub fn bucket(&self, key: &str) -> Option<TokenBucketState> {
        self.store.bucket(key)
    }

    /// Forget all counters for one key.
    pub fn clear_state(&self, key: &str) -> bool {
        self.store.clear(key)
    }

    /// Forget every counter. Returns the number of keys dropped.
    pub fn clear_all(&self) -> usize {
        self.store.clear_all()
    }

    /// Number of keys with live state.
    pub fn key_count(&self) -> usize {
        self.store.key_count()
    }

    /// Drop state idle for at least `idle_ms`.
    pub fn evict_idle(&self, idle_ms: i64) -> usize {
        let now = self.clock.now();
        self.store.evict_idle(plus_ms(now, -idle_ms), now)
    }
}

fn note_denial(rule: &RateLimitRule, state: &mut RateLimitState, now: DateTime<Utc>) {
    state.violations += 1;
    if let Some(block_ms) = rule.block_duration_ms {
        state.block(
            plus_ms(now, block_ms as i64),
            format!("rule '{}' exceeded", rule.name),
        );
    }
}

/// Whole seconds to wait, rounded up and never zero.
fn retry_secs(ms: f64) -> u64 {
    ((ms / 1000.0).ceil() as u64).max(1)
}

fn reported_limit(rule: &RateLimitRule) -> u64 {
    match rule.strategy {
        Strategy::TokenBucket | Strategy::LeakyBucket => rule.capacity(),
        Strategy::FixedWindow | Strategy::SlidingWindow => rule.limit,
    }
}

fn blocked_outcome(rule: &RateLimitRule, until: DateTime<Utc>, now: DateTime<Utc>) -> Outcome {
    Outcome {
        allowed: false,
        remaining: 0,
        limit: reported_limit(rule),
        reset_at: until,
        retry_after: Some(retry_secs(elapsed_ms(now, until) as f64)),
        observed: 0,
        blocked: true,
    }
}

fn counted_outcome(
    rule: &RateLimitRule,
    count: u64,
    reset_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Outcome {
    let allowed = count <= rule.limit;
    Outcome {
        allowed,
        remaining: rule.limit.saturating_sub(count),
        limit: rule.limit,
        reset_at,
        retry_after: (!allowed).then(|| retry_secs(elapsed_ms(now, reset_at) as f64)),
        observed: count,
        blocked: false,
    }
}

/// Counter resets wholesale once the window has fully elapsed.
fn fixed_window(rule: &RateLimitRule, state: &mut RateLimitState, now: DateTime<Utc>) -> Outcome {
    if elapsed_ms(state.window_start, now) >= rule.window_ms as i64 {
        state.request_count = 0;
        state.window_start = now;
    }
    state.request_count += 1;

    let reset_at = plus_ms(state.window_start, rule.window_ms as i64);
    counted_outcome(rule, state.request_count, reset_at, now)
}

/// Linear decay of the previous count instead of a timestamp log.
fn sliding_window(rule: &RateLimitRule, state: &mut RateLimitState, now: DateTime<Utc>) -> Outcome {
    let elapsed = elapsed_ms(state.window_start, now) as f64;
    let ratio = (elapsed / rule.window_ms as f64).min(1.0);
    state.request_count = (state.request_count as f64 * (1.0 - ratio)).floor() as u64 + 1;
    state.window_start = now;

    let reset_at = plus_ms(now, rule.window_ms as i64);
    counted_outcome(rule, state.request_count, reset_at, now)
}

/// The level drains at `limit / window` per second; a denied request never enters the bucket.
fn leaky_bucket(rule: &RateLimitRule, state: &mut RateLimitState, now: DateTime<Utc>) -> Outcome {
    let leak_rate = rule.rate_per_sec();
    let capacity = rule.capacity() as f64;

    let elapsed_secs = elapsed_ms(state.window_start, now) as f64 / 1000.0;
    let drained = (state.level - elapsed_secs * leak_rate).max(0.0);
    let candidate = drained + 1.0;
    let allowed = candidate <= capacity + LEVEL_EPSILON;

    state.level = if allowed { candidate } else { drained };
    state.window_start = now;
    state.request_count = state.level.ceil() as u64;

    let drain_ms = (state.level / leak_rate * 1000.0).ceil() as i64;
    let reset_at = plus_ms(now, drain_ms);
    Outcome {
        allowed,
        remaining: (capacity - state.level + LEVEL_EPSILON).floor().max(0.0) as u64,
        limit: rule.capacity(),
        reset_at,
        retry_after: (!allowed).then(|| retry_secs(drain_ms as f64)),
        observed: candidate.ceil() as u64,
        blocked: false,
    }
}

/// Expects the bucket to be refilled for `now` already.
fn token_bucket(rule: &RateLimitRule, bucket: &mut TokenBucketState, now: DateTime<Utc>) -> Outcome {
    let allowed = bucket.tokens >= 1.0;
    if allowed {
        bucket.tokens -= 1.0;
    }

    let until_full_ms = ((bucket.max_tokens - bucket.tokens) / bucket.refill_rate * 1000.0).ceil();
    let consumed = (bucket.max_tokens - bucket.tokens).ceil() as u64;
    Outcome {
        allowed,
        remaining: (bucket.tokens + LEVEL_EPSILON).floor() as u64,
        limit: rule.capacity(),
        reset_at: plus_ms(now, until_full_ms as i64),
        retry_after: (!allowed)
            .then(|| retry_secs((1.0 - bucket.tokens) / bucket.refill_rate * 1000.0)),
        observed: if allowed { consumed } else { consumed + 1 },
        blocked: false,
    }
}
