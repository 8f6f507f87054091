//! Rate limit rule definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, WardenError};

/// Default priority for rules that do not set one.
pub const DEFAULT_PRIORITY: i32 = 100;

/// Longest accepted `window_ms` or `block_duration_ms`: one leap year.
pub const MAX_DURATION_MS: u64 = 366 * 86_400_000;

/// The dimension a rule's counters are partitioned by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Scope {
    /// One shared counter for all callers
    Global,
    /// One counter per user id
    User,
    /// One counter per tenant id
    Tenant,
    /// One counter per endpoint
    Endpoint,
    /// One counter per client IP address
    Ip,
}

impl Scope {
    /// Prefix used when building state keys.
    pub fn key_prefix(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::User => "user",
            Scope::Tenant => "tenant",
            Scope::Endpoint => "endpoint",
            Scope::Ip => "ip",
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key_prefix())
    }
}

/// Limiting algorithm applied by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
    LeakyBucket,
}

impl Strategy {
    /// Every supported strategy.
    pub const ALL: [Strategy; 4] = [
        Strategy::FixedWindow,
        Strategy::SlidingWindow,
        Strategy::TokenBucket,
        Strategy::LeakyBucket,
    ];

    /// Human readable description of the algorithm.
    pub fn description(&self) -> &'static str {
        match self {
            Strategy::FixedWindow => "Count requests in fixed time windows",
            Strategy::SlidingWindow => {
                "Approximate a rolling window by linearly decaying the previous count"
            }
            Strategy::TokenBucket => "Allow bursts up to bucket capacity, refilled at a steady rate",
            Strategy::LeakyBucket => "Admit requests into a bucket that drains at a constant rate",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Strategy::FixedWindow => "FIXED_WINDOW",
            Strategy::SlidingWindow => "SLIDING_WINDOW",
            Strategy::TokenBucket => "TOKEN_BUCKET",
            Strategy::LeakyBucket => "LEAKY_BUCKET",
        };
        f.write_str(name)
    }
}

/// How the caller wants a denied request handled.
///
/// The engine only decides allow/deny; delaying or queueing is up to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThrottleAction {
    #[default]
    Reject,
    Delay,
    Queue,
}

/// A rate limit rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub scope: Scope,
    pub strategy: Strategy,
    /// Requests allowed per `window_ms`
    pub limit: u64,
    pub window_ms: u64,
    /// Bucket capacity for token/leaky bucket rules, defaults to `limit`
    #[serde(default)]
    pub burst_limit: Option<u64>,
    #[serde(default)]
    pub throttle_action: ThrottleAction,
    /// Glob patterns this rule is restricted to; empty means every endpoint
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Glob patterns this rule never applies to
    #[serde(default)]
    pub excluded_endpoints: Vec<String>,
    /// Lower values are evaluated first
    pub priority: i32,
    pub is_enabled: bool,
    /// Block the key for this long after a denial
    #[serde(default)]
    pub block_duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RateLimitRule {
    /// Capacity of the bucket for token and leaky bucket strategies.
    pub fn capacity(&self) -> u64 {
        self.burst_limit.unwrap_or(self.limit)
    }

    /// Steady-state rate in requests per second.
    pub fn rate_per_sec(&self) -> f64 {
        self.limit as f64 / (self.window_ms as f64 / 1000.0)
    }

    /// Check the invariants every stored rule must satisfy.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(invalid("rule name must not be empty"));
        }
        if self.limit == 0 {
            return Err(invalid(format!("rule '{}': limit must be positive", self.name)));
        }
        if self.window_ms == 0 {
            return Err(invalid(format!(
                "rule '{}': window_ms must be positive",
                self.name
            )));
        }
        if self.window_ms > MAX_DURATION_MS {
            return Err(invalid(format!(
                "rule '{}': window_ms must not exceed {}",
                self.name, MAX_DURATION_MS
            )));
        }
        if self.burst_limit == Some(0) {
            return Err(invalid(format!(
                "rule '{}': burst_limit must be positive",
                self.name
            )));
        }
        if self.block_duration_ms == Some(0) {
            return Err(invalid(format!(
                "rule '{}': block_duration_ms must be positive",
                self.name
            )));
        }
        if self.block_duration_ms.is_some_and(|ms| ms > MAX_DURATION_MS) {
            return Err(invalid(format!(
                "rule '{}': block_duration_ms must not exceed {}",
                self.name, MAX_DURATION_MS
            )));
        }
        for pattern in self.endpoints.iter().chain(&self.excluded_endpoints) {
            if pattern.trim().is_empty() {
                return Err(invalid(format!(
                    "rule '{}': endpoint patterns must not be blank",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> WardenError {
    WardenError::InvalidConfiguration(msg.into())
}

fn default_enabled() -> bool {
    true
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

/// Input for creating a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRule {
    /// Fixed id for rules declared in configuration; generated when absent
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub scope: Scope,
    pub strategy: Strategy,
    pub limit: u64,
    pub window_ms: u64,
    #[serde(default)]
    pub burst_limit: Option<u64>,
    #[serde(default)]
    pub throttle_action: ThrottleAction,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub excluded_endpoints: Vec<String>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
    #[serde(default)]
    pub block_duration_ms: Option<u64>,
}

impl NewRule {
    /// A minimal enabled rule with default priority and no endpoint filters.
    pub fn new(
        name: impl Into<String>,
        scope: Scope,
        strategy: Strategy,
        limit: u64,
        window_ms: u64,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: None,
            scope,
            strategy,
            limit,
            window_ms,
            burst_limit: None,
            throttle_action: ThrottleAction::default(),
            endpoints: Vec::new(),
            excluded_endpoints: Vec::new(),
            priority: DEFAULT_PRIORITY,
            is_enabled: true,
            block_duration_ms: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_burst(mut self, burst_limit: u64) -> Self {
        self.burst_limit = Some(burst_limit);
        self
    }

    pub fn with_endpoints<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoints = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn excluding<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_endpoints = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_block_duration(mut self, block_duration_ms: u64) -> Self {
        self.block_duration_ms = Some(block_duration_ms);
        self
    }

    pub fn with_throttle_action(mut self, action: ThrottleAction) -> Self {
        self.throttle_action = action;
        self
    }

    pub(crate) fn into_rule(self, id: String, now: DateTime<Utc>) -> RateLimitRule {
        RateLimitRule {
            id,
            name: self.name,
            description: self.description,
            scope: self.scope,
            strategy: self.strategy,
            limit: self.limit,
            window_ms: self.window_ms,
            burst_limit: self.burst_limit,
            throttle_action: self.throttle_action,
            endpoints: self.endpoints,
            excluded_endpoints: self.excluded_endpoints,
            priority: self.priority,
            is_enabled: self.is_enabled,
            block_duration_ms: self.block_duration_ms,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A partial update to an existing rule. Unset fields are left unchanged.
///
/// The optional rule fields take `Some(None)` (or `null` when deserialized)
/// to clear the current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleUpdate {
    pub name: Option<String>,
    #[serde(deserialize_with = "clearable", skip_serializing_if = "Option::is_none")]
    pub description: Option<Option<String>>,
    pub scope: Option<Scope>,
    pub strategy: Option<Strategy>,
    pub limit: Option<u64>,
    pub window_ms: Option<u64>,
    #[serde(deserialize_with = "clearable", skip_serializing_if = "Option::is_none")]
    pub burst_limit: Option<Option<u64>>,
    pub throttle_action: Option<ThrottleAction>,
    pub endpoints: Option<Vec<String>>,
    pub excluded_endpoints: Option<Vec<String>>,
    pub priority: Option<i32>,
    pub is_enabled: Option<bool>,
    #[serde(deserialize_with = "clearable", skip_serializing_if = "Option::is_none")]
    pub block_duration_ms: Option<Option<u64>>,
}

/// A present field becomes `Some`, even when it is `null`.
fn clearable<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl RuleUpdate {
    /// An update that only toggles `is_enabled`.
    pub fn enabled(is_enabled: bool) -> Self {
        Self {
            is_enabled: Some(is_enabled),
            ..Self::default()
        }
    }

    pub(crate) fn apply_to(self, rule: &mut RateLimitRule) {
        if let Some(name) = self.name {
            rule.name = name;
        }
        if let Some(description) = self.description {
            rule.description = description;
        }
        if let Some(scope) = self.scope {
            rule.scope = scope;
        }
        if let Some(strategy) = self.strategy {
            rule.strategy = strategy;
        }
        if let Some(limit) = self.limit {
            rule.limit = limit;
        }
        if let Some(window_ms) = self.window_ms {
            rule.window_ms = window_ms;
        }
        if let Some(burst_limit) = self.burst_limit {
            rule.burst_limit = burst_limit;
        }
        if let Some(action) = self.throttle_action {
            rule.throttle_action = action;
        }
        if let Some(endpoints) = self.endpoints {
            rule.endpoints = endpoints;
        }
        if let Some(excluded) = self.excluded_endpoints {
            rule.excluded_endpoints = excluded;
        }
        if let Some(priority) = self.priority {
            rule.priority = priority;
        }
        if let Some(is_enabled) = self.is_enabled {
            rule.is_enabled = is_enabled;
        }
        if let Some(block_duration_ms) = self.block_duration_ms {
            rule.block_duration_ms = block_duration_ms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(limit: u64, window_ms: u64) -> RateLimitRule {
        NewRule::new("test", Scope::User, Strategy::FixedWindow, limit, window_ms)
            .into_rule("r1".to_string(), Utc::now())
    }

    #[test]
    fn test_validate_accepts_sane_rule() {
        assert!(rule(10, 1000).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_limit_and_window() {
        assert!(matches!(
            rule(0, 1000).validate(),
            Err(WardenError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            rule(10, 0).validate(),
            Err(WardenError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_validate_bounds_durations() {
        assert!(rule(10, MAX_DURATION_MS).validate().is_ok());
        assert!(rule(10, 10_000_000_000_000_000).validate().is_err());

        let mut r = rule(10, 1000);
        r.block_duration_ms = Some(u64::MAX);
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_blank_pattern() {
        let mut r = rule(10, 1000);
        r.excluded_endpoints = vec!["  ".to_string()];
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_capacity_defaults_to_limit() {
        let mut r = rule(10, 1000);
        assert_eq!(r.capacity(), 10);
        r.burst_limit = Some(25);
        assert_eq!(r.capacity(), 25);
    }

    #[test]
    fn test_rate_per_sec() {
        assert_eq!(rule(120, 60_000).rate_per_sec(), 2.0);
    }

    #[test]
    fn test_update_applies_only_set_fields() {
        let mut r = rule(10, 1000);
        RuleUpdate {
            limit: Some(20),
            ..RuleUpdate::default()
        }
        .apply_to(&mut r);
        assert_eq!(r.limit, 20);
        assert_eq!(r.window_ms, 1000);
        assert_eq!(r.name, "test");
    }

    #[test]
    fn test_update_clears_optional_fields() {
        let mut r = rule(10, 1000);
        r.burst_limit = Some(25);
        r.block_duration_ms = Some(5000);
        r.description = Some("login".to_string());

        RuleUpdate {
            burst_limit: Some(None),
            description: Some(None),
            ..RuleUpdate::default()
        }
        .apply_to(&mut r);
        assert_eq!(r.burst_limit, None);
        assert_eq!(r.description, None);
        assert_eq!(r.block_duration_ms, Some(5000));
    }

    #[test]
    fn test_update_null_clears_and_missing_keeps() {
        let update: RuleUpdate =
            serde_json::from_str(r#"{"block_duration_ms": null, "limit": 3}"#).unwrap();
        assert_eq!(update.block_duration_ms, Some(None));
        assert_eq!(update.burst_limit, None);

        let mut r = rule(10, 1000);
        r.block_duration_ms = Some(5000);
        r.burst_limit = Some(20);
        update.apply_to(&mut r);
        assert_eq!(r.block_duration_ms, None);
        assert_eq!(r.burst_limit, Some(20));
        assert_eq!(r.limit, 3);
    }

    #[test]
    fn test_strategy_serde_names() {
        let json = serde_json::to_string(&Strategy::LeakyBucket).unwrap();
        assert_eq!(json, "\"LEAKY_BUCKET\"");
        let scope: Scope = serde_json::from_str("\"IP\"").unwrap();
        assert_eq!(scope, Scope::Ip);
    }
}
