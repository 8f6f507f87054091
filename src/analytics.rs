//! Request analytics: per-day aggregates and per-rule statistics.
//!
//! Days are UTC calendar dates. Every update is a handful of map increments
//! under one shard guard.

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::clock::Clock;

/// Number of rules listed in [`StatisticsSummary::top_denied_rules`].
const TOP_RULES: usize = 5;

/// Denial count for one key on one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViolatorCount {
    pub key: String,
    pub count: u64,
}

/// Aggregate traffic for one day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitAnalytics {
    pub date: NaiveDate,
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub denied_requests: u64,
    pub by_endpoint: BTreeMap<String, u64>,
    /// Requests per UTC hour of day, index 0 to 23
    pub by_hour: Vec<u64>,
    pub top_violators: Vec<ViolatorCount>,
}

impl RateLimitAnalytics {
    fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            total_requests: 0,
            allowed_requests: 0,
            denied_requests: 0,
            by_endpoint: BTreeMap::new(),
            by_hour: vec![0; 24],
            top_violators: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct DayBucket {
    total: u64,
    allowed: u64,
    denied: u64,
    by_endpoint: HashMap<String, u64>,
    by_hour: [u64; 24],
    denials_by_key: HashMap<String, u64>,
}

/// Running counters for one rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleStatistics {
    pub rule_id: String,
    pub rule_name: String,
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub denied_requests: u64,
    /// Percentage of evaluations denied
    pub block_rate: f64,
    pub last_updated: DateTime<Utc>,
}

/// Totals across all rules.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatisticsSummary {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub denied_requests: u64,
    pub overall_block_rate: f64,
    pub top_denied_rules: Vec<RuleStatistics>,
}

pub struct AnalyticsAggregator {
    days: DashMap<NaiveDate, DayBucket>,
    rules: DashMap<String, RuleStatistics>,
    clock: Arc<dyn Clock>,
    top_violators: usize,
}

impl AnalyticsAggregator {
    pub fn new(clock: Arc<dyn Clock>, top_violators: usize) -> Self {
        Self {
            days: DashMap::new(),
            rules: DashMap::new(),
            clock,
            top_violators,
        }
    }

    /// Count one admission decision.
    pub fn record(&self, endpoint: &str, allowed: bool, denied_key: Option<&str>) {
        let now = self.clock.now();
        let mut day = self.days.entry(now.date_naive()).or_default();

        day.total += 1;
        if allowed {
            day.allowed += 1;
        } else {
            day.denied += 1;
            if let Some(key) = denied_key {
                *day.denials_by_key.entry(key.to_string()).or_insert(0) += 1;
            }
        }
        *day.by_endpoint.entry(endpoint.to_string()).or_insert(0) += 1;
        day.by_hour[now.hour() as usize] += 1;
    }

    /// Count one evaluation of a rule.
    pub fn record_rule(&self, rule_id: &str, rule_name: &str, allowed: bool) {
        let now = self.clock.now();
        let mut stats = self
            .rules
            .entry(rule_id.to_string())
            .or_insert_with(|| RuleStatistics {
                rule_id: rule_id.to_string(),
                rule_name: rule_name.to_string(),
                total_requests: 0,
                allowed_requests: 0,
                denied_requests: 0,
                block_rate: 0.0,
                last_updated: now,
            });

        stats.total_requests += 1;
        if allowed {
            stats.allowed_requests += 1;
        } else {
            stats.denied_requests += 1;
        }
        stats.block_rate = stats.denied_requests as f64 / stats.total_requests as f64 * 100.0;
        stats.rule_name = rule_name.to_string();
        stats.last_updated = now;
    }

    /// Analytics for `date` (today when `None`). Unknown dates yield zeros.
    pub fn get_analytics(&self, date: Option<NaiveDate>) -> RateLimitAnalytics {
        let date = date.unwrap_or_else(|| self.clock.now().date_naive());
        let Some(day) = self.days.get(&date) else {
            return RateLimitAnalytics::empty(date);
        };

        let mut top: Vec<ViolatorCount> = day
            .denials_by_key
            .iter()
            .map(|(key, count)| ViolatorCount {
                key: key.clone(),
                count: *count,
            })
            .collect();
        top.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
        top.truncate(self.top_violators);

        RateLimitAnalytics {
            date,
            total_requests: day.total,
            allowed_requests: day.allowed,
            denied_requests: day.denied,
            by_endpoint: day.by_endpoint.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            by_hour: day.by_hour.to_vec(),
            top_violators: top,
        }
    }

    /// Days with recorded traffic, oldest first.
    pub fn days(&self) -> Vec<NaiveDate> {
        let mut days: Vec<NaiveDate> = self.days.iter().map(|d| *d.key()).collect();
        days.sort();
        days
    }

    /// Drop day records before `date`. Returns how many were removed.
    pub fn prune_before(&self, date: NaiveDate) -> usize {
        let before = self.days.len();
        self.days.retain(|day, _| *day >= date);
        before - self.days.len()
    }

    pub fn rule_statistics(&self, rule_id: &str) -> Option<RuleStatistics> {
        self.rules.get(rule_id).map(|s| s.clone())
    }

    pub fn all_rule_statistics(&self) -> Vec<RuleStatistics> {
        let mut all: Vec<RuleStatistics> = self.rules.iter().map(|s| s.clone()).collect();
        all.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));
        all
    }

    /// Forget statistics of a deleted rule.
    pub fn forget_rule(&self, rule_id: &str) {
        self.rules.remove(rule_id);
    }

    pub fn summary(&self) -> StatisticsSummary {
        let mut all = self.all_rule_statistics();
        let total_requests: u64 = all.iter().map(|s| s.total_requests).sum();
        let allowed_requests: u64 = all.iter().map(|s| s.allowed_requests).sum();
        let denied_requests: u64 = all.iter().map(|s| s.denied_requests).sum();

        all.sort_by(|a, b| b.denied_requests.cmp(&a.denied_requests));
        all.truncate(TOP_RULES);

        StatisticsSummary {
            total_requests,
            allowed_requests,
            denied_requests,
            overall_block_rate: if total_requests > 0 {
                denied_requests as f64 / total_requests as f64 * 100.0
            } else {
                0.0
            },
            top_denied_rules: all,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn setup() -> (Arc<ManualClock>, AnalyticsAggregator) {
        let start = DateTime::parse_from_rfc3339("2024-03-10T09:15:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let clock = Arc::new(ManualClock::new(start));
        let analytics = AnalyticsAggregator::new(clock.clone(), 10);
        (clock, analytics)
    }

    #[test]
    fn test_unknown_date_is_all_zero() {
        let (_clock, analytics) = setup();
        let date = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let report = analytics.get_analytics(Some(date));
        assert_eq!(report.date, date);
        assert_eq!(report.total_requests, 0);
        assert_eq!(report.by_hour, vec![0; 24]);
        assert!(report.top_violators.is_empty());
    }

    #[test]
    fn test_record_tallies_endpoint_hour_and_denials() {
        let (clock, analytics) = setup();
        analytics.record("/api/a", true, None);
        analytics.record("/api/a", false, Some("user:u1:r1"));
        clock.advance(Duration::from_secs(3600));
        analytics.record("/api/b", false, Some("user:u1:r1"));
        analytics.record("/api/b", false, Some("user:u2:r1"));

        let report = analytics.get_analytics(None);
        assert_eq!(report.date, NaiveDate::from_ymd_opt(2024, 3, 10).unwrap());
        assert_eq!(report.total_requests, 4);
        assert_eq!(report.allowed_requests, 1);
        assert_eq!(report.denied_requests, 3);
        assert_eq!(report.by_endpoint["/api/a"], 2);
        assert_eq!(report.by_hour[9], 2);
        assert_eq!(report.by_hour[10], 2);
        assert_eq!(
            report.top_violators[0],
            ViolatorCount {
                key: "user:u1:r1".to_string(),
                count: 2
            }
        );
    }

    #[test]
    fn test_days_are_separate_and_prunable() {
        let (clock, analytics) = setup();
        analytics.record("/a", true, None);
        clock.advance(Duration::from_secs(86_400));
        analytics.record("/a", true, None);

        assert_eq!(analytics.days().len(), 2);
        assert_eq!(analytics.get_analytics(None).total_requests, 1);

        let today = clock.now().date_naive();
        assert_eq!(analytics.prune_before(today), 1);
        assert_eq!(analytics.days(), vec![today]);
    }

    #[test]
    fn test_rule_statistics_and_summary() {
        let (_clock, analytics) = setup();
        for allowed in [true, true, true, false] {
            analytics.record_rule("r1", "login", allowed);
        }
        analytics.record_rule("r2", "api", false);

        let stats = analytics.rule_statistics("r1").unwrap();
        assert_eq!(stats.total_requests, 4);
        assert_eq!(stats.block_rate, 25.0);

        let summary = analytics.summary();
        assert_eq!(summary.total_requests, 5);
        assert_eq!(summary.denied_requests, 2);
        assert_eq!(summary.overall_block_rate, 40.0);
        assert_eq!(summary.top_denied_rules.len(), 2);

        analytics.forget_rule("r2");
        assert!(analytics.rule_statistics("r2").is_none());
    }
}
