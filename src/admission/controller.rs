//! The admission controller: one entry point over rules, limiter state,
//! quotas, blocks, violations and analytics.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::decision::Decision;
use crate::analytics::{AnalyticsAggregator, RateLimitAnalytics, RuleStatistics, StatisticsSummary};
use crate::clock::{duration_ms, plus_ms, Clock, SystemClock};
use crate::config::{EngineConfig, NoMatchPolicy, RetentionConfig, WardenConfig};
use crate::enforcement::{
    BlockListManager, BlockedKey, RateLimitViolation, TopViolator, ViolationFilter, ViolationPage,
    ViolationRecorder,
};
use crate::error::Result;
use crate::events::{EventBus, WardenEvent};
use crate::quota::{NewQuota, QuotaConfig, QuotaEntityType, QuotaManager, QuotaUpdate, QuotaUsage};
use crate::ratelimit::{
    KeyResolver, LimiterEngine, NewRule, Outcome, RateLimitRule, RateLimitState, RequestContext,
    RuleSet, RuleStore, RuleUpdate, Scope, StateKey, Strategy, TokenBucketState,
};

const DEFAULT_RULE_NAME: &str = "default";
const NO_MATCH_RULE_NAME: &str = "no_matching_rule";

/// Async seam over admission decisions.
///
/// Request pipelines hold an `Arc<dyn AdmissionBackend>` so a local
/// controller and a shared-state implementation are interchangeable.
#[async_trait]
pub trait AdmissionBackend: Send + Sync {
    /// Decide whether a request may proceed.
    async fn check(&self, ctx: &RequestContext) -> Decision;

    /// Count one use against the entity's quota.
    async fn consume_quota(
        &self,
        entity_type: QuotaEntityType,
        entity_id: &str,
        endpoint: &str,
    ) -> bool;
}

/// Point-in-time counters for the whole engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub total_rules: usize,
    pub enabled_rules: usize,
    pub total_quotas: usize,
    pub total_violations: usize,
    pub blocked_keys: usize,
    pub active_states: usize,
    pub strategy_usage: BTreeMap<Strategy, usize>,
}

/// What one maintenance pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub evicted_states: usize,
    pub pruned_violations: usize,
    pub pruned_days: usize,
}

impl MaintenanceReport {
    pub fn total(&self) -> usize {
        self.evicted_states + self.pruned_violations + self.pruned_days
    }
}

pub struct AdmissionController {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    events: EventBus,
    rules: Arc<RuleStore>,
    resolver: KeyResolver,
    engine: LimiterEngine,
    quotas: QuotaManager,
    violations: ViolationRecorder,
    blocks: BlockListManager,
    analytics: AnalyticsAggregator,
}

impl AdmissionController {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build a controller on an explicit time source.
    pub fn with_clock(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let events = EventBus::new(config.event_buffer);
        let rules = Arc::new(RuleStore::new(clock.clone(), events.clone()));
        let engine = LimiterEngine::new(clock.clone());
        let blocks = BlockListManager::new(engine.state_store().clone(), clock.clone(), events.clone());

        Self {
            resolver: KeyResolver::new(rules.clone()),
            quotas: QuotaManager::new(clock.clone(), events.clone()),
            violations: ViolationRecorder::new(config.violation_capacity, events.clone()),
            analytics: AnalyticsAggregator::new(clock.clone(), config.top_violators),
            rules,
            engine,
            blocks,
            events,
            clock,
            config,
        }
    }

    /// Build a controller from full configuration, seeding the rule file
    /// and any inline rules and quotas.
    pub fn from_config(config: &WardenConfig) -> Result<Self> {
        let controller = Self::new(config.engine.clone());

        if let Some(path) = &config.rules_path {
            let set = RuleSet::from_file(path)?;
            controller.load_rule_set(set)?;
        }
        controller.load_rule_set(RuleSet {
            rules: config.rules.clone(),
            quotas: config.quotas.clone(),
        })?;
        Ok(controller)
    }

    /// Create every rule and quota in `set`. Returns how many were created.
    pub fn load_rule_set(&self, set: RuleSet) -> Result<usize> {
        let mut created = 0;
        for new_rule in set.rules {
            self.rules.create(new_rule)?;
            created += 1;
        }
        for new_quota in set.quotas {
            self.quotas.create_quota(new_quota)?;
            created += 1;
        }
        if created > 0 {
            info!(created, "Rule set loaded");
        }
        Ok(created)
    }

    /// Decide whether a request may proceed.
    ///
    /// Applicable rules are evaluated in priority order and the first denial
    /// wins. When every rule allows, the decision reports the rule with the
    /// least remaining headroom. Never fails.
    pub fn evaluate(&self, ctx: &RequestContext) -> Decision {
        let resolved = self.resolver.resolve(ctx);
        if resolved.is_empty() {
            let decision = self.no_match_decision();
            self.analytics.record(&ctx.endpoint, decision.allowed, None);
            return decision;
        }

        let mut tightest: Option<Decision> = None;
        for (compiled, key) in resolved {
            let rule = &compiled.rule;
            let outcome = self.engine.evaluate(rule, &key);
            self.analytics.record_rule(&rule.id, &rule.name, outcome.allowed);

            if !outcome.allowed {
                self.on_denied(ctx, rule, &key, &outcome);
                self.analytics.record(&ctx.endpoint, false, Some(key.as_str()));
                return Decision::from_outcome(&outcome, &rule.id, &rule.name, rule.throttle_action);
            }

            if tightest.as_ref().map_or(true, |d| outcome.remaining < d.remaining) {
                tightest = Some(Decision::from_outcome(
                    &outcome,
                    &rule.id,
                    &rule.name,
                    rule.throttle_action,
                ));
            }
        }

        self.analytics.record(&ctx.endpoint, true, None);
        tightest.unwrap_or_else(|| self.no_match_decision())
    }

    fn no_match_decision(&self) -> Decision {
        let window_ms = self.config.default_window_ms;
        let reset_at = plus_ms(self.clock.now(), duration_ms(Duration::from_millis(window_ms)));
        match self.config.no_match_policy {
            NoMatchPolicy::FailOpen => Decision::without_rule(
                true,
                self.config.default_limit,
                reset_at,
                None,
                DEFAULT_RULE_NAME,
            ),
            NoMatchPolicy::FailClosed => {
                let retry_after = window_ms.div_ceil(1000).max(1);
                Decision::without_rule(
                    false,
                    self.config.default_limit,
                    reset_at,
                    Some(retry_after),
                    NO_MATCH_RULE_NAME,
                )
            }
        }
    }

    fn on_denied(&self, ctx: &RequestContext, rule: &RateLimitRule, key: &StateKey, outcome: &Outcome) {
        if outcome.blocked {
            debug!(key = %key, rule_id = %rule.id, "Request denied, key is blocked");
            return;
        }

        let now = self.clock.now();
        self.violations.record(RateLimitViolation {
            id: uuid::Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            key: key.to_string(),
            scope: rule.scope,
            endpoint: ctx.endpoint.clone(),
            user_id: ctx.user_id.clone(),
            tenant_id: ctx.tenant_id.clone(),
            ip_address: ctx.ip_address.clone(),
            observed: outcome.observed,
            limit: outcome.limit,
            timestamp: now,
        });

        if let Some(block_ms) = rule.block_duration_ms {
            let until = plus_ms(now, block_ms as i64);
            warn!(key = %key, rule_id = %rule.id, until = %until, "Key blocked after exceeding rate limit");
            self.events.publish(WardenEvent::KeyBlocked {
                key: key.to_string(),
                until,
                reason: format!("rule '{}' exceeded", rule.name),
            });
        }
    }

    // Rules

    pub fn create_rule(&self, new_rule: NewRule) -> Result<RateLimitRule> {
        self.rules.create(new_rule)
    }

    pub fn get_rule(&self, id: &str) -> Option<RateLimitRule> {
        self.rules.get(id)
    }

    pub fn list_rules(&self) -> Vec<RateLimitRule> {
        self.rules.list()
    }

    pub fn get_rules_by_scope(&self, scope: Scope) -> Vec<RateLimitRule> {
        self.rules.by_scope(scope)
    }

    pub fn update_rule(&self, id: &str, update: RuleUpdate) -> Result<RateLimitRule> {
        self.rules.update(id, update)
    }

    pub fn delete_rule(&self, id: &str) -> Result<()> {
        self.rules.delete(id)?;
        self.analytics.forget_rule(id);
        Ok(())
    }

    pub fn enable_rule(&self, id: &str) -> Result<RateLimitRule> {
        self.rules.enable(id)
    }

    pub fn disable_rule(&self, id: &str) -> Result<RateLimitRule> {
        self.rules.disable(id)
    }

    // Quotas

    pub fn create_quota(&self, new_quota: NewQuota) -> Result<QuotaConfig> {
        self.quotas.create_quota(new_quota)
    }

    pub fn get_quota(&self, id: &str) -> Option<QuotaConfig> {
        self.quotas.get_quota(id)
    }

    pub fn get_quota_by_entity(&self, entity_type: QuotaEntityType, entity_id: &str) -> Option<QuotaConfig> {
        self.quotas.get_quota_by_entity(entity_type, entity_id)
    }

    pub fn list_quotas(&self) -> Vec<QuotaConfig> {
        self.quotas.list_quotas()
    }

    pub fn check_quota(
        &self,
        entity_type: QuotaEntityType,
        entity_id: &str,
        endpoint: &str,
    ) -> Option<QuotaUsage> {
        self.quotas.check_quota(entity_type, entity_id, endpoint)
    }

    pub fn increment_quota(&self, entity_type: QuotaEntityType, entity_id: &str, endpoint: &str) -> bool {
        self.quotas.increment_quota(entity_type, entity_id, endpoint)
    }

    pub fn update_quota(&self, id: &str, update: QuotaUpdate) -> Result<QuotaConfig> {
        self.quotas.update_quota(id, update)
    }

    pub fn reset_quota(&self, id: &str) -> Result<QuotaConfig> {
        self.quotas.reset_quota(id)
    }

    pub fn delete_quota(&self, id: &str) -> Result<()> {
        self.quotas.delete_quota(id)
    }

    // Blocks

    pub fn block_key(&self, key: &str, duration: Duration, reason: &str) -> DateTime<Utc> {
        self.blocks.block_key(key, duration, reason)
    }

    pub fn unblock_key(&self, key: &str) -> bool {
        self.blocks.unblock_key(key)
    }

    pub fn is_blocked(&self, key: &str) -> bool {
        self.blocks.is_blocked(key)
    }

    pub fn blocked_keys(&self) -> Vec<BlockedKey> {
        self.blocks.blocked_keys()
    }

    // Limiter state

    pub fn get_state(&self, key: &str) -> Option<RateLimitState> {
        self.engine.state(key)
    }

    pub fn get_bucket(&self, key: &str) -> Option<TokenBucketState> {
        self.engine.bucket(key)
    }

    /// Forget all counters for `key`, including any block on it.
    pub fn clear_state(&self, key: &str) -> bool {
        let cleared = self.engine.clear_state(key);
        if cleared {
            info!(key = %key, "Rate limit state cleared");
            self.events.publish(WardenEvent::StateReset {
                key: key.to_string(),
            });
        }
        cleared
    }

    pub fn reset_all_states(&self) -> usize {
        let cleared = self.engine.clear_all();
        info!(cleared, "All rate limit state cleared");
        cleared
    }

    // Observability

    pub fn get_violations(&self, filter: &ViolationFilter) -> ViolationPage {
        self.violations.query(filter)
    }

    pub fn get_top_violators(&self, n: usize) -> Vec<TopViolator> {
        self.violations.top_violators(n)
    }

    pub fn get_analytics(&self, date: Option<NaiveDate>) -> RateLimitAnalytics {
        self.analytics.get_analytics(date)
    }

    pub fn rule_statistics(&self, rule_id: &str) -> Option<RuleStatistics> {
        self.analytics.rule_statistics(rule_id)
    }

    pub fn all_rule_statistics(&self) -> Vec<RuleStatistics> {
        self.analytics.all_rule_statistics()
    }

    pub fn statistics_summary(&self) -> StatisticsSummary {
        self.analytics.summary()
    }

    pub fn get_stats(&self) -> EngineStats {
        EngineStats {
            total_rules: self.rules.len(),
            enabled_rules: self.rules.enabled_count(),
            total_quotas: self.quotas.len(),
            total_violations: self.violations.len(),
            blocked_keys: self.blocks.blocked_count(),
            active_states: self.engine.key_count(),
            strategy_usage: self.rules.strategy_histogram(),
        }
    }

    /// The event channel; subscribe to observe mutations.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Drop idle state, old violations and old analytics.
    pub fn run_maintenance(&self, retention: &RetentionConfig) -> MaintenanceReport {
        let now = self.clock.now();
        let violation_ttl = duration_ms(Duration::from_secs(retention.violation_retention_secs));
        let violation_cutoff = plus_ms(now, -violation_ttl);
        let oldest_day = now.date_naive() - chrono::Days::new(retention.analytics_retention_days as u64);

        let report = MaintenanceReport {
            evicted_states: self
                .engine
                .evict_idle(duration_ms(Duration::from_secs(retention.state_idle_ttl_secs))),
            pruned_violations: self.violations.prune_older_than(violation_cutoff),
            pruned_days: self.analytics.prune_before(oldest_day),
        };
        if report.total() > 0 {
            debug!(
                evicted_states = report.evicted_states,
                pruned_violations = report.pruned_violations,
                pruned_days = report.pruned_days,
                "Maintenance pass complete"
            );
        }
        report
    }
}

#[async_trait]
impl AdmissionBackend for AdmissionController {
    async fn check(&self, ctx: &RequestContext) -> Decision {
        self.evaluate(ctx)
    }

    async fn consume_quota(
        &self,
        entity_type: QuotaEntityType,
        entity_id: &str,
        endpoint: &str,
    ) -> bool {
        self.increment_quota(entity_type, entity_id, endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::WardenError;
    use crate::quota::{NewQuotaLimit, QuotaPeriod};
    use crate::ratelimit::ThrottleAction;
    use tokio_test::{assert_err, assert_ok};

    fn setup() -> (Arc<ManualClock>, AdmissionController) {
        setup_with(EngineConfig::default())
    }

    fn setup_with(config: EngineConfig) -> (Arc<ManualClock>, AdmissionController) {
        let clock = Arc::new(ManualClock::starting_now());
        let controller = AdmissionController::with_clock(config, clock.clone());
        (clock, controller)
    }

    fn rule_with_id(id: &str, rule: NewRule) -> NewRule {
        NewRule {
            id: Some(id.to_string()),
            ..rule
        }
    }

    fn user(id: &str) -> RequestContext {
        RequestContext::new("/api/orders").with_user(id)
    }

    #[test]
    fn test_fixed_window_scenario() {
        let (_clock, controller) = setup();
        assert_ok!(controller.create_rule(NewRule::new(
            "per-user",
            Scope::User,
            Strategy::FixedWindow,
            5,
            60_000
        )));

        let ctx = user("u1");
        let remaining: Vec<u64> = (0..5)
            .map(|_| {
                let decision = controller.evaluate(&ctx);
                assert!(decision.allowed);
                decision.remaining
            })
            .collect();
        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

        let denied = controller.evaluate(&ctx);
        assert!(!denied.allowed);
        assert!(denied.retry_after.unwrap() > 0);
        assert_eq!(denied.rule_name, "per-user");
        assert_eq!(denied.headers.limit, 5);
        assert_eq!(denied.headers.remaining, 0);
        assert_eq!(denied.headers.reset, denied.reset_at.timestamp());
        assert_eq!(denied.headers.retry_after, denied.retry_after);

        let violations = controller.get_violations(&ViolationFilter::default());
        assert_eq!(violations.total, 1);
        assert_eq!(violations.items[0].user_id.as_deref(), Some("u1"));
        assert_eq!(violations.items[0].observed, 6);

        let analytics = controller.get_analytics(None);
        assert_eq!(analytics.total_requests, 6);
        assert_eq!(analytics.denied_requests, 1);
        assert_eq!(analytics.by_endpoint["/api/orders"], 6);
    }

    #[test]
    fn test_users_do_not_share_counters() {
        let (_clock, controller) = setup();
        assert_ok!(controller.create_rule(NewRule::new("u", Scope::User, Strategy::FixedWindow, 1, 60_000)));

        assert!(controller.evaluate(&user("a")).allowed);
        assert!(!controller.evaluate(&user("a")).allowed);
        assert!(controller.evaluate(&user("b")).allowed);
    }

    #[test]
    fn test_strictest_rule_denies_first() {
        let (_clock, controller) = setup();
        assert_ok!(controller.create_rule(
            NewRule::new("tight", Scope::User, Strategy::FixedWindow, 5, 60_000).with_priority(1)
        ));
        assert_ok!(controller.create_rule(
            NewRule::new("loose", Scope::User, Strategy::FixedWindow, 100, 60_000).with_priority(2)
        ));

        let ctx = user("u1");
        for _ in 0..5 {
            let decision = controller.evaluate(&ctx);
            assert!(decision.allowed);
            assert_eq!(decision.rule_name, "tight");
        }
        let denied = controller.evaluate(&ctx);
        assert!(!denied.allowed);
        assert_eq!(denied.rule_name, "tight");
        assert_eq!(denied.limit, 5);
    }

    #[test]
    fn test_allowed_decision_reports_least_headroom() {
        let (_clock, controller) = setup();
        assert_ok!(controller.create_rule(
            NewRule::new("loose", Scope::User, Strategy::FixedWindow, 100, 60_000).with_priority(1)
        ));
        assert_ok!(controller.create_rule(
            NewRule::new("tight", Scope::Global, Strategy::FixedWindow, 10, 60_000).with_priority(2)
        ));

        let decision = controller.evaluate(&user("u1"));
        assert_eq!(decision.rule_name, "tight");
        assert_eq!(decision.remaining, 9);
    }

    #[test]
    fn test_excluded_endpoint_always_allowed() {
        let (_clock, controller) = setup();
        assert_ok!(controller.create_rule(
            NewRule::new("api", Scope::Global, Strategy::FixedWindow, 1, 60_000)
                .with_endpoints(["/api/*"])
                .excluding(["/api/health"])
        ));

        for _ in 0..10 {
            assert!(controller.evaluate(&RequestContext::new("/api/health")).allowed);
        }
        assert!(controller.evaluate(&RequestContext::new("/api/orders")).allowed);
        assert!(!controller.evaluate(&RequestContext::new("/api/orders")).allowed);
    }

    #[test]
    fn test_disabled_rule_is_skipped() {
        let (_clock, controller) = setup();
        let rule = assert_ok!(controller.create_rule(NewRule::new(
            "r",
            Scope::Global,
            Strategy::FixedWindow,
            1,
            60_000
        )));
        assert_ok!(controller.disable_rule(&rule.id));

        for _ in 0..3 {
            assert_eq!(controller.evaluate(&user("u1")).rule_name, "default");
        }
        assert_ok!(controller.enable_rule(&rule.id));
        assert!(controller.evaluate(&user("u1")).allowed);
        assert!(!controller.evaluate(&user("u1")).allowed);
    }

    #[test]
    fn test_no_rules_fail_open() {
        let (_clock, controller) = setup();
        let decision = controller.evaluate(&user("u1"));
        assert!(decision.allowed);
        assert_eq!(decision.rule_id, None);
        assert_eq!(decision.limit, 1000);
        assert_eq!(decision.remaining, 1000);
        assert_eq!(decision.retry_after, None);
    }

    #[test]
    fn test_no_rules_fail_closed() {
        let (_clock, controller) = setup_with(EngineConfig {
            no_match_policy: NoMatchPolicy::FailClosed,
            ..EngineConfig::default()
        });
        let decision = controller.evaluate(&user("u1"));
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.retry_after, Some(60));
        assert_eq!(decision.rule_name, "no_matching_rule");
    }

    #[test]
    fn test_blocked_key_is_denied_until_expiry() {
        let (clock, controller) = setup();
        assert_ok!(controller.create_rule(rule_with_id(
            "r1",
            NewRule::new("per-user", Scope::User, Strategy::FixedWindow, 100, 60_000)
        )));

        controller.block_key("user:u1:r1", Duration::from_millis(1000), "manual");
        assert!(controller.is_blocked("user:u1:r1"));

        let denied = controller.evaluate(&user("u1"));
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(1));
        assert!(controller.evaluate(&user("u2")).allowed);

        // Blocked denials are not rate limit violations.
        assert_eq!(controller.get_violations(&ViolationFilter::default()).total, 0);

        clock.advance(Duration::from_millis(1000));
        assert!(!controller.is_blocked("user:u1:r1"));
        assert!(controller.evaluate(&user("u1")).allowed);
    }

    #[test]
    fn test_auto_block_publishes_event() {
        let (clock, controller) = setup();
        assert_ok!(controller.create_rule(rule_with_id(
            "login",
            NewRule::new("login", Scope::Ip, Strategy::FixedWindow, 1, 1000)
                .with_block_duration(10_000)
                .with_throttle_action(ThrottleAction::Delay)
        )));
        let mut rx = controller.events().subscribe();
        let ctx = RequestContext::new("/auth/login").with_ip("10.0.0.1");

        assert!(controller.evaluate(&ctx).allowed);
        let denied = controller.evaluate(&ctx);
        assert!(!denied.allowed);
        assert_eq!(denied.throttle_action, ThrottleAction::Delay);

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        assert_eq!(names, vec!["violation_recorded", "key_blocked"]);

        assert_eq!(controller.blocked_keys()[0].key, "ip:10.0.0.1:login");
        clock.advance(Duration::from_secs(5));
        let blocked = controller.evaluate(&ctx);
        assert!(!blocked.allowed);
        assert_eq!(blocked.retry_after, Some(5));
    }

    #[test]
    fn test_clear_state_resets_counter() {
        let (_clock, controller) = setup();
        assert_ok!(controller.create_rule(rule_with_id(
            "r1",
            NewRule::new("r", Scope::User, Strategy::FixedWindow, 1, 60_000)
        )));
        let mut rx = controller.events().subscribe();

        assert!(controller.evaluate(&user("u1")).allowed);
        assert!(!controller.evaluate(&user("u1")).allowed);
        assert_eq!(controller.get_state("user:u1:r1").unwrap().request_count, 2);

        assert!(controller.clear_state("user:u1:r1"));
        assert!(controller.evaluate(&user("u1")).allowed);

        let mut saw_reset = false;
        while let Ok(event) = rx.try_recv() {
            saw_reset |= matches!(event, WardenEvent::StateReset { ref key } if key == "user:u1:r1");
        }
        assert!(saw_reset);
        assert!(!controller.clear_state("user:nobody:r1"));
        assert_eq!(controller.reset_all_states(), 1);
    }

    #[test]
    fn test_token_bucket_state_is_visible() {
        let (_clock, controller) = setup();
        assert_ok!(controller.create_rule(rule_with_id(
            "tb",
            NewRule::new("tb", Scope::Tenant, Strategy::TokenBucket, 10, 1000).with_burst(20)
        )));

        let ctx = RequestContext::new("/x").with_tenant("acme");
        let decision = controller.evaluate(&ctx);
        assert_eq!(decision.limit, 20);
        assert_eq!(decision.remaining, 19);

        let bucket = controller.get_bucket("tenant:acme:tb").unwrap();
        assert_eq!(bucket.max_tokens, 20.0);
    }

    #[test]
    fn test_unknown_rule_is_client_error() {
        let (_clock, controller) = setup();
        let err = assert_err!(controller.update_rule("missing", RuleUpdate::enabled(false)));
        assert!(matches!(err, WardenError::NotFound { kind: "rule", .. }));
        assert!(err.is_client_error());
        assert_err!(controller.delete_rule("missing"));
    }

    #[test]
    fn test_invalid_rule_rejected() {
        let (_clock, controller) = setup();
        let err = assert_err!(controller.create_rule(NewRule::new(
            "zero",
            Scope::User,
            Strategy::FixedWindow,
            0,
            1000
        )));
        assert!(matches!(err, WardenError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_quota_passthrough() {
        let (_clock, controller) = setup();
        let quota = assert_ok!(controller.create_quota(NewQuota {
            entity_type: QuotaEntityType::User,
            entity_id: "u1".to_string(),
            limits: vec![NewQuotaLimit::new("/api/*", QuotaPeriod::Day, 2)],
            overage_allowed: false,
        }));

        assert!(controller.increment_quota(QuotaEntityType::User, "u1", "/api/x"));
        assert!(controller.increment_quota(QuotaEntityType::User, "u1", "/api/x"));
        assert!(!controller.increment_quota(QuotaEntityType::User, "u1", "/api/x"));

        let usage = controller
            .check_quota(QuotaEntityType::User, "u1", "/api/x")
            .unwrap();
        assert_eq!(usage.used, 2);
        assert_eq!(usage.remaining, 0);

        assert_ok!(controller.reset_quota(&quota.id));
        assert!(controller.increment_quota(QuotaEntityType::User, "u1", "/api/x"));
        assert!(controller.get_quota_by_entity(QuotaEntityType::User, "u1").is_some());
        assert_ok!(controller.delete_quota(&quota.id));
        assert!(controller.get_quota(&quota.id).is_none());
    }

    #[test]
    fn test_stats_and_rule_statistics() {
        let (_clock, controller) = setup();
        let rule = assert_ok!(controller.create_rule(NewRule::new(
            "r",
            Scope::User,
            Strategy::SlidingWindow,
            3,
            60_000
        )));
        assert_ok!(controller.create_rule(NewRule::new(
            "t",
            Scope::Ip,
            Strategy::TokenBucket,
            100,
            60_000
        )));

        for _ in 0..4 {
            controller.evaluate(&user("u1"));
        }

        let stats = controller.get_stats();
        assert_eq!(stats.total_rules, 2);
        assert_eq!(stats.enabled_rules, 2);
        assert_eq!(stats.total_violations, 1);
        assert_eq!(stats.strategy_usage[&Strategy::SlidingWindow], 1);
        assert_eq!(stats.strategy_usage[&Strategy::TokenBucket], 1);

        let rule_stats = controller.rule_statistics(&rule.id).unwrap();
        assert_eq!(rule_stats.total_requests, 4);
        assert_eq!(rule_stats.denied_requests, 1);
        assert_eq!(rule_stats.block_rate, 25.0);
        assert_eq!(controller.statistics_summary().top_denied_rules[0].rule_id, rule.id);

        assert_eq!(controller.get_top_violators(1)[0].count, 1);
    }

    #[test]
    fn test_maintenance_evicts_idle_state_and_old_records() {
        let (clock, controller) = setup();
        assert_ok!(controller.create_rule(NewRule::new("r", Scope::User, Strategy::FixedWindow, 1, 1000)));
        controller.evaluate(&user("u1"));
        controller.evaluate(&user("u1"));

        let retention = RetentionConfig {
            state_idle_ttl_secs: 60,
            violation_retention_secs: 3600,
            analytics_retention_days: 1,
            ..RetentionConfig::default()
        };
        assert_eq!(controller.run_maintenance(&retention), MaintenanceReport::default());

        clock.advance(Duration::from_secs(3 * 86_400));
        let report = controller.run_maintenance(&retention);
        assert_eq!(report.evicted_states, 1);
        assert_eq!(report.pruned_violations, 1);
        assert_eq!(report.pruned_days, 1);
        assert_eq!(controller.get_stats().active_states, 0);
    }

    #[test]
    fn test_maintenance_keeps_running_long_window() {
        let (clock, controller) = setup();
        assert_ok!(controller.create_rule(NewRule::new(
            "daily",
            Scope::User,
            Strategy::FixedWindow,
            1,
            86_400_000
        )));
        assert!(controller.evaluate(&user("u1")).allowed);
        assert!(!controller.evaluate(&user("u1")).allowed);

        clock.advance(Duration::from_secs(2 * 3600));
        let report = controller.run_maintenance(&RetentionConfig::default());
        assert_eq!(report.evicted_states, 0);
        assert!(!controller.evaluate(&user("u1")).allowed);

        clock.advance(Duration::from_secs(22 * 3600));
        assert!(controller.evaluate(&user("u1")).allowed);
    }

    #[test]
    fn test_maintenance_with_unbounded_retention() {
        let (_clock, controller) = setup();
        assert_ok!(controller.create_rule(NewRule::new("r", Scope::User, Strategy::FixedWindow, 1, 1000)));
        controller.evaluate(&user("u1"));

        let retention = RetentionConfig {
            state_idle_ttl_secs: u64::MAX,
            violation_retention_secs: u64::MAX,
            ..RetentionConfig::default()
        };
        assert_eq!(controller.run_maintenance(&retention).evicted_states, 0);
    }

    #[test]
    fn test_rejects_out_of_range_window() {
        let (_clock, controller) = setup();
        let err = assert_err!(controller.create_rule(NewRule::new(
            "huge",
            Scope::User,
            Strategy::FixedWindow,
            1,
            10_000_000_000_000_000
        )));
        assert!(matches!(err, WardenError::InvalidConfiguration(_)));
        assert!(controller.list_rules().is_empty());
    }

    #[test]
    fn test_load_rule_set() {
        let (_clock, controller) = setup();
        let set = RuleSet::from_yaml(
            r#"
rules:
  - id: r1
    name: one
    scope: GLOBAL
    strategy: LEAKY_BUCKET
    limit: 10
    window_ms: 1000
quotas:
  - entity_type: TENANT
    entity_id: acme
    limits:
      - period: HOUR
        limit: 10
"#,
        )
        .unwrap();

        assert_eq!(assert_ok!(controller.load_rule_set(set)), 2);
        assert_eq!(controller.get_rule("r1").unwrap().strategy, Strategy::LeakyBucket);
        assert_eq!(controller.list_quotas().len(), 1);
        assert_eq!(controller.get_rules_by_scope(Scope::Global).len(), 1);
    }

    #[tokio::test]
    async fn test_backend_trait_object() {
        let (_clock, controller) = setup();
        assert_ok!(controller.create_rule(NewRule::new("r", Scope::User, Strategy::FixedWindow, 1, 60_000)));
        let backend: Arc<dyn AdmissionBackend> = Arc::new(controller);

        assert!(backend.check(&user("u1")).await.allowed);
        assert!(!backend.check(&user("u1")).await.allowed);
        assert!(backend.consume_quota(QuotaEntityType::ApiKey, "k", "/x").await);
    }

    #[tokio::test]
    async fn test_concurrent_evaluations_never_over_admit() {
        let (_clock, controller) = setup();
        assert_ok!(controller.create_rule(NewRule::new(
            "shared",
            Scope::User,
            Strategy::TokenBucket,
            25,
            60_000
        )));
        let controller = Arc::new(controller);

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let controller = controller.clone();
                tokio::spawn(async move { controller.evaluate(&user("u1")).allowed })
            })
            .collect();

        let results = futures::future::join_all(tasks).await;
        let admitted = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(admitted, 25);
        assert_eq!(controller.get_analytics(None).denied_requests, 75);
    }
}
