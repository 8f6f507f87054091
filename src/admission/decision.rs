//! Admission decisions and the response headers derived from them.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ratelimit::{Outcome, ThrottleAction};

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Standard rate limit response headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitHeaders {
    #[serde(rename = "X-RateLimit-Limit")]
    pub limit: u64,
    #[serde(rename = "X-RateLimit-Remaining")]
    pub remaining: u64,
    /// Unix seconds at which the limit resets
    #[serde(rename = "X-RateLimit-Reset")]
    pub reset: i64,
    #[serde(rename = "Retry-After", skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl RateLimitHeaders {
    pub fn new(limit: u64, remaining: u64, reset_at: DateTime<Utc>, retry_after: Option<u64>) -> Self {
        Self {
            limit,
            remaining,
            reset: reset_at.timestamp(),
            retry_after,
        }
    }

    /// Header name/value pairs, `Retry-After` only when set.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_RESET, self.reset.to_string()),
        ];
        if let Some(retry_after) = self.retry_after {
            pairs.push((HEADER_RETRY_AFTER, retry_after.to_string()));
        }
        pairs
    }
}

/// The answer to "may this request proceed?".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u64,
    pub limit: u64,
    pub reset_at: DateTime<Utc>,
    pub retry_after: Option<u64>,
    /// Rule that produced the decision; `None` when no rule applied
    pub rule_id: Option<String>,
    pub rule_name: String,
    /// What the caller should do with a denied request
    pub throttle_action: ThrottleAction,
    pub headers: RateLimitHeaders,
}

impl Decision {
    pub(crate) fn from_outcome(
        outcome: &Outcome,
        rule_id: &str,
        rule_name: &str,
        throttle_action: ThrottleAction,
    ) -> Self {
        Self {
            allowed: outcome.allowed,
            remaining: outcome.remaining,
            limit: outcome.limit,
            reset_at: outcome.reset_at,
            retry_after: outcome.retry_after,
            rule_id: Some(rule_id.to_string()),
            rule_name: rule_name.to_string(),
            throttle_action,
            headers: RateLimitHeaders::new(
                outcome.limit,
                outcome.remaining,
                outcome.reset_at,
                outcome.retry_after,
            ),
        }
    }

    /// Decision made without any applicable rule.
    pub(crate) fn without_rule(
        allowed: bool,
        limit: u64,
        reset_at: DateTime<Utc>,
        retry_after: Option<u64>,
        rule_name: &str,
    ) -> Self {
        let remaining = if allowed { limit } else { 0 };
        Self {
            allowed,
            remaining,
            limit,
            reset_at,
            retry_after,
            rule_id: None,
            rule_name: rule_name.to_string(),
            throttle_action: ThrottleAction::Reject,
            headers: RateLimitHeaders::new(limit, remaining, reset_at, retry_after),
        }
    }
}
