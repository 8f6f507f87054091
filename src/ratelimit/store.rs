//! Rule storage and lookup.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use super::pattern::EndpointFilter;
use super::rule::{NewRule, RateLimitRule, RuleUpdate, Scope, Strategy};
use crate::clock::Clock;
use crate::error::{Result, WardenError};
use crate::events::{EventBus, WardenEvent};

/// A stored rule together with its compiled endpoint filter.
#[derive(Debug)]
pub struct CompiledRule {
    pub rule: RateLimitRule,
    filter: EndpointFilter,
}

impl CompiledRule {
    fn compile(rule: RateLimitRule) -> Result<Self> {
        rule.validate()?;
        let filter = EndpointFilter::new(&rule.endpoints, &rule.excluded_endpoints)?;
        Ok(Self { rule, filter })
    }

    /// Whether this rule is enabled and its filters admit the endpoint.
    pub fn applies_to(&self, endpoint: &str) -> bool {
        self.rule.is_enabled && self.filter.applies_to(endpoint)
    }
}

/// In-memory store of rate limit rules.
///
/// Reads vastly outnumber writes, so the map sits behind a single `RwLock`
/// and evaluation works on `Arc` snapshots of the compiled rules.
pub struct RuleStore {
    rules: RwLock<HashMap<String, Arc<CompiledRule>>>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl RuleStore {
    pub fn new(clock: Arc<dyn Clock>, events: EventBus) -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
            clock,
            events,
        }
    }

    /// Create a rule, assigning an id and timestamps.
    pub fn create(&self, new_rule: NewRule) -> Result<RateLimitRule> {
        let now = self.clock.now();
        let id = match &new_rule.id {
            Some(id) if id.trim().is_empty() => {
                return Err(WardenError::InvalidConfiguration(
                    "rule id must not be blank".to_string(),
                ))
            }
            Some(id) => id.clone(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        let compiled = CompiledRule::compile(new_rule.into_rule(id.clone(), now))?;
        let rule = compiled.rule.clone();

        {
            let mut rules = self.rules.write();
            if rules.contains_key(&id) {
                return Err(WardenError::InvalidConfiguration(format!(
                    "rule id '{}' already exists",
                    id
                )));
            }
            rules.insert(id, Arc::new(compiled));
        }

        info!(
            rule_id = %rule.id,
            name = %rule.name,
            scope = %rule.scope,
            strategy = %rule.strategy,
            limit = rule.limit,
            window_ms = rule.window_ms,
            "Rate limit rule created"
        );
        self.events.publish(WardenEvent::RuleCreated { rule: rule.clone() });
        Ok(rule)
    }

    pub fn get(&self, id: &str) -> Option<RateLimitRule> {
        self.rules.read().get(id).map(|c| c.rule.clone())
    }

    /// All rules, lowest priority value first.
    pub fn list(&self) -> Vec<RateLimitRule> {
        let mut rules: Vec<RateLimitRule> =
            self.rules.read().values().map(|c| c.rule.clone()).collect();
        rules.sort_by(rule_order);
        rules
    }

    /// Enabled rules of the given scope, in priority order.
    pub fn by_scope(&self, scope: Scope) -> Vec<RateLimitRule> {
        self.list()
            .into_iter()
            .filter(|r| r.scope == scope && r.is_enabled)
            .collect()
    }

    /// Apply a partial update. The merged rule is validated before it replaces the old one.
    pub fn update(&self, id: &str, update: RuleUpdate) -> Result<RateLimitRule> {
        let rule = {
            let mut rules = self.rules.write();
            let existing = rules.get(id).ok_or_else(|| WardenError::rule_not_found(id))?;

            let mut rule = existing.rule.clone();
            update.apply_to(&mut rule);
            rule.updated_at = self.clock.now();

            let compiled = CompiledRule::compile(rule)?;
            let rule = compiled.rule.clone();
            rules.insert(id.to_string(), Arc::new(compiled));
            rule
        };

        info!(rule_id = %id, enabled = rule.is_enabled, "Rate limit rule updated");
        self.events.publish(WardenEvent::RuleUpdated { rule: rule.clone() });
        Ok(rule)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.rules
            .write()
            .remove(id)
            .ok_or_else(|| WardenError::rule_not_found(id))?;

        info!(rule_id = %id, "Rate limit rule deleted");
        self.events.publish(WardenEvent::RuleDeleted {
            rule_id: id.to_string(),
        });
        Ok(())
    }

    pub fn enable(&self, id: &str) -> Result<RateLimitRule> {
        self.update(id, RuleUpdate::enabled(true))
    }

    pub fn disable(&self, id: &str) -> Result<RateLimitRule> {
        self.update(id, RuleUpdate::enabled(false))
    }

    /// Enabled rules whose endpoint filters admit `endpoint`, in priority order.
    pub fn applicable(&self, endpoint: &str) -> Vec<Arc<CompiledRule>> {
        let mut matching: Vec<Arc<CompiledRule>> = self
            .rules
            .read()
            .values()
            .filter(|c| c.applies_to(endpoint))
            .cloned()
            .collect();
        matching.sort_by(|a, b| rule_order(&a.rule, &b.rule));

        debug!(endpoint = %endpoint, matched = matching.len(), "Resolved applicable rules");
        matching
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn enabled_count(&self) -> usize {
        self.rules.read().values().filter(|c| c.rule.is_enabled).count()
    }

    /// Number of rules using each strategy.
    pub fn strategy_histogram(&self) -> BTreeMap<Strategy, usize> {
        let mut histogram: BTreeMap<Strategy, usize> =
            Strategy::ALL.iter().map(|s| (*s, 0)).collect();
        for compiled in self.rules.read().values() {
            *histogram.entry(compiled.rule.strategy).or_insert(0) += 1;
        }
        histogram
    }
}

/// Priority ascending, then creation time, then id for a stable order.
fn rule_order(a: &RateLimitRule, b: &RateLimitRule) -> std::cmp::Ordering {
    a.priority
        .cmp(&b.priority)
        .then(a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}
