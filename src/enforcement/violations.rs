//! Bounded log of rate limit denials.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

use crate::events::{EventBus, WardenEvent};
use crate::ratelimit::Scope;

/// Default number of violations kept before trimming.
pub const DEFAULT_VIOLATION_CAPACITY: usize = 10_000;

/// One denied request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitViolation {
    pub id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub key: String,
    pub scope: Scope,
    pub endpoint: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    /// Count or level that triggered the denial
    pub observed: u64,
    pub limit: u64,
    pub timestamp: DateTime<Utc>,
}

/// Query over recorded violations. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ViolationFilter {
    pub rule_id: Option<String>,
    pub scope: Option<Scope>,
    pub key: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub offset: usize,
    /// Page size; `None` returns everything after `offset`
    pub limit: Option<usize>,
}

impl ViolationFilter {
    fn matches(&self, v: &RateLimitViolation) -> bool {
        self.rule_id.as_deref().map_or(true, |id| v.rule_id == id)
            && self.scope.map_or(true, |scope| v.scope == scope)
            && self.key.as_deref().map_or(true, |key| v.key == key)
            && self.from.map_or(true, |from| v.timestamp >= from)
            && self.to.map_or(true, |to| v.timestamp <= to)
    }
}

/// A page of violations, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct ViolationPage {
    pub items: Vec<RateLimitViolation>,
    /// Matches before pagination
    pub total: usize,
}

/// Aggregate denials for one key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopViolator {
    pub key: String,
    pub count: u64,
    pub last_seen: DateTime<Utc>,
}

/// Ring buffer of recent violations.
///
/// When the buffer exceeds its capacity the oldest entries are dropped until
/// half the capacity remains, so trimming happens rarely.
pub struct ViolationRecorder {
    buffer: Mutex<VecDeque<RateLimitViolation>>,
    capacity: usize,
    events: EventBus,
}

impl ViolationRecorder {
    pub fn new(capacity: usize, events: EventBus) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            events,
        }
    }

    /// Append a violation. Never fails; overflow evicts the oldest entries.
    pub fn record(&self, violation: RateLimitViolation) {
        {
            let mut buffer = self.buffer.lock();
            buffer.push_back(violation.clone());
            if buffer.len() > self.capacity {
                let keep = self.capacity / 2;
                let evicted = buffer.len() - keep;
                buffer.drain(..evicted);
                warn!(evicted, kept = keep, "Violation buffer full, trimmed oldest entries");
            }
        }

        debug!(
            rule_id = %violation.rule_id,
            key = %violation.key,
            endpoint = %violation.endpoint,
            "Violation recorded"
        );
        self.events.publish(WardenEvent::ViolationRecorded { violation });
    }

    /// Matching violations, newest first, paginated.
    pub fn query(&self, filter: &ViolationFilter) -> ViolationPage {
        let buffer = self.buffer.lock();
        let matching: Vec<&RateLimitViolation> =
            buffer.iter().rev().filter(|v| filter.matches(v)).collect();
        let total = matching.len();
        let items = matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        ViolationPage { items, total }
    }

    /// Keys with the most recorded denials, most first.
    pub fn top_violators(&self, n: usize) -> Vec<TopViolator> {
        let mut by_key: HashMap<String, TopViolator> = HashMap::new();
        {
            let buffer = self.buffer.lock();
            for v in buffer.iter() {
                let entry = by_key.entry(v.key.clone()).or_insert_with(|| TopViolator {
                    key: v.key.clone(),
                    count: 0,
                    last_seen: v.timestamp,
                });
                entry.count += 1;
                entry.last_seen = entry.last_seen.max(v.timestamp);
            }
        }

        let mut top: Vec<TopViolator> = by_key.into_values().collect();
        top.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
        top.truncate(n);
        top
    }

    /// Drop violations older than `cutoff`. Returns how many were removed.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut buffer = self.buffer.lock();
        let before = buffer.len();
        buffer.retain(|v| v.timestamp >= cutoff);
        before - buffer.len()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
