//! Long-period usage quotas per entity and endpoint.
//!
//! Quotas are independent of the rule limiter: a rule caps request rate over
//! a short window, a quota caps total usage over a calendar-like period
//! (minute to month) for a user, tenant or API key.

use chrono::{DateTime, Datelike, Months, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::{elapsed_ms, plus_ms, Clock};
use crate::error::{Result, WardenError};
use crate::events::{EventBus, WardenEvent};
use crate::ratelimit::EndpointPattern;

/// Kind of entity a quota belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuotaEntityType {
    User,
    Tenant,
    ApiKey,
}

/// Length of a quota period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QuotaPeriod {
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl QuotaPeriod {
    /// Length in milliseconds for periods of fixed length.
    fn fixed_length_ms(&self) -> Option<i64> {
        match self {
            QuotaPeriod::Minute => Some(60_000),
            QuotaPeriod::Hour => Some(3_600_000),
            QuotaPeriod::Day => Some(86_400_000),
            QuotaPeriod::Week => Some(7 * 86_400_000),
            QuotaPeriod::Month => None,
        }
    }

    /// `from` moved forward by one period.
    pub fn advance(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        match self.fixed_length_ms() {
            Some(len) => plus_ms(from, len),
            None => from
                .checked_add_months(Months::new(1))
                .unwrap_or_else(|| plus_ms(from, 30 * 86_400_000)),
        }
    }

    /// The first boundary after `now` that lies a whole number of periods past `anchor`.
    ///
    /// Months are always counted from the anchor, so a period anchored on the
    /// 31st resets on the last day of shorter months and on the 31st again after.
    fn next_reset_after(&self, anchor: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.fixed_length_ms() {
            Some(len) => {
                let periods = elapsed_ms(anchor, now) / len + 1;
                plus_ms(anchor, periods.saturating_mul(len))
            }
            None => {
                let elapsed = (now.year() - anchor.year()) * 12 + now.month() as i32
                    - anchor.month() as i32;
                let mut months = u32::try_from(elapsed).unwrap_or(0).max(1);
                loop {
                    match anchor.checked_add_months(Months::new(months)) {
                        Some(next) if next > now => return next,
                        Some(_) => months += 1,
                        None => return DateTime::<Utc>::MAX_UTC,
                    }
                }
            }
        }
    }
}

/// One capped counter of a quota.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaLimit {
    /// Endpoint glob this limit counts
    pub endpoint: String,
    pub period: QuotaPeriod,
    pub limit: u64,
    pub used: u64,
    /// Start of the first period; every reset lands a whole number of periods after it
    pub period_start: DateTime<Utc>,
    pub reset_at: DateTime<Utc>,
}

/// A quota owned by one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub id: String,
    pub entity_type: QuotaEntityType,
    pub entity_id: String,
    pub limits: Vec<QuotaLimit>,
    /// Keep counting (and admitting) past `limit`
    pub overage_allowed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_endpoint() -> String {
    "*".to_string()
}

/// Input for one limit of a new quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewQuotaLimit {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    pub period: QuotaPeriod,
    pub limit: u64,
}

impl NewQuotaLimit {
    pub fn new(endpoint: impl Into<String>, period: QuotaPeriod, limit: u64) -> Self {
        Self {
            endpoint: endpoint.into(),
            period,
            limit,
        }
    }
}

/// Input for creating a quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewQuota {
    pub entity_type: QuotaEntityType,
    pub entity_id: String,
    pub limits: Vec<NewQuotaLimit>,
    #[serde(default)]
    pub overage_allowed: bool,
}

/// A partial update to a quota.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaUpdate {
    /// Replaces the limit list; usage carries over for unchanged endpoint/period pairs
    pub limits: Option<Vec<NewQuotaLimit>>,
    pub overage_allowed: Option<bool>,
}

/// Usage report for the most constrained limit matching an endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaUsage {
    pub quota_id: String,
    pub entity_type: QuotaEntityType,
    pub entity_id: String,
    pub endpoint: String,
    pub period: QuotaPeriod,
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    pub percent_used: f64,
    pub reset_at: DateTime<Utc>,
    pub overage_allowed: bool,
}

struct QuotaEntry {
    config: QuotaConfig,
    patterns: Vec<EndpointPattern>,
}

impl QuotaEntry {
    fn new(config: QuotaConfig) -> Result<Self> {
        let patterns = config
            .limits
            .iter()
            .map(|l| EndpointPattern::compile(&l.endpoint))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { config, patterns })
    }

    /// Reset every limit whose period has ended.
    fn roll_over(&mut self, now: DateTime<Utc>) {
        for limit in &mut self.config.limits {
            if now >= limit.reset_at {
                debug!(
                    quota_id = %self.config.id,
                    endpoint = %limit.endpoint,
                    used = limit.used,
                    "Quota period elapsed, resetting usage"
                );
                limit.used = 0;
                limit.reset_at = limit.period.next_reset_after(limit.period_start, now);
            }
        }
    }

    fn matching(&self, endpoint: &str) -> Vec<usize> {
        self.patterns
            .iter()
            .enumerate()
            .filter(|(_, p)| p.matches(endpoint))
            .map(|(i, _)| i)
            .collect()
    }

    fn usage(&self, index: usize) -> QuotaUsage {
        let limit = &self.config.limits[index];
        QuotaUsage {
            quota_id: self.config.id.clone(),
            entity_type: self.config.entity_type,
            entity_id: self.config.entity_id.clone(),
            endpoint: limit.endpoint.clone(),
            period: limit.period,
            used: limit.used,
            limit: limit.limit,
            remaining: limit.limit.saturating_sub(limit.used),
            percent_used: limit.used as f64 / limit.limit as f64 * 100.0,
            reset_at: limit.reset_at,
            overage_allowed: self.config.overage_allowed,
        }
    }
}

fn validate_limits(limits: &[NewQuotaLimit]) -> Result<()> {
    if limits.is_empty() {
        return Err(WardenError::InvalidConfiguration(
            "quota must define at least one limit".to_string(),
        ));
    }
    for limit in limits {
        if limit.limit == 0 {
            return Err(WardenError::InvalidConfiguration(format!(
                "quota limit for '{}' must be positive",
                limit.endpoint
            )));
        }
        if limit.endpoint.trim().is_empty() {
            return Err(WardenError::InvalidConfiguration(
                "quota endpoint pattern must not be blank".to_string(),
            ));
        }
    }
    Ok(())
}

type EntityKey = (QuotaEntityType, String);

/// Tracks quota usage for entities.
pub struct QuotaManager {
    quotas: DashMap<String, QuotaEntry>,
    by_entity: DashMap<EntityKey, String>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl QuotaManager {
    pub fn new(clock: Arc<dyn Clock>, events: EventBus) -> Self {
        Self {
            quotas: DashMap::new(),
            by_entity: DashMap::new(),
            clock,
            events,
        }
    }

    /// Create a quota. Each entity may own at most one.
    pub fn create_quota(&self, new_quota: NewQuota) -> Result<QuotaConfig> {
        if new_quota.entity_id.trim().is_empty() {
            return Err(WardenError::InvalidConfiguration(
                "quota entity id must not be empty".to_string(),
            ));
        }
        validate_limits(&new_quota.limits)?;

        let now = self.clock.now();
        let config = QuotaConfig {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type: new_quota.entity_type,
            entity_id: new_quota.entity_id.clone(),
            limits: new_quota
                .limits
                .into_iter()
                .map(|l| QuotaLimit {
                    period_start: now,
                    reset_at: l.period.advance(now),
                    endpoint: l.endpoint,
                    period: l.period,
                    limit: l.limit,
                    used: 0,
                })
                .collect(),
            overage_allowed: new_quota.overage_allowed,
            created_at: now,
            updated_at: now,
        };
        let entry = QuotaEntry::new(config.clone())?;

        match self
            .by_entity
            .entry((new_quota.entity_type, new_quota.entity_id))
        {
            Entry::Occupied(existing) => {
                return Err(WardenError::InvalidConfiguration(format!(
                    "{:?} '{}' already has quota {}",
                    existing.key().0,
                    existing.key().1,
                    existing.get()
                )))
            }
            Entry::Vacant(slot) => {
                self.quotas.insert(config.id.clone(), entry);
                slot.insert(config.id.clone());
            }
        }

        info!(
            quota_id = %config.id,
            entity_type = ?config.entity_type,
            entity_id = %config.entity_id,
            limits = config.limits.len(),
            "Quota created"
        );
        self.events.publish(WardenEvent::QuotaCreated {
            quota: config.clone(),
        });
        Ok(config)
    }

    pub fn get_quota(&self, id: &str) -> Option<QuotaConfig> {
        let now = self.clock.now();
        let mut entry = self.quotas.get_mut(id)?;
        entry.roll_over(now);
        Some(entry.config.clone())
    }

    pub fn get_quota_by_entity(
        &self,
        entity_type: QuotaEntityType,
        entity_id: &str,
    ) -> Option<QuotaConfig> {
        let id = self.quota_id_for(entity_type, entity_id)?;
        self.get_quota(&id)
    }

    pub fn list_quotas(&self) -> Vec<QuotaConfig> {
        let mut quotas: Vec<QuotaConfig> =
            self.quotas.iter().map(|e| e.config.clone()).collect();
        quotas.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        quotas
    }

    /// Usage of the most constrained limit matching `endpoint`, after any period reset.
    pub fn check_quota(
        &self,
        entity_type: QuotaEntityType,
        entity_id: &str,
        endpoint: &str,
    ) -> Option<QuotaUsage> {
        let id = self.quota_id_for(entity_type, entity_id)?;
        let now = self.clock.now();
        let mut entry = self.quotas.get_mut(&id)?;
        entry.roll_over(now);

        entry
            .matching(endpoint)
            .into_iter()
            .map(|i| entry.usage(i))
            .min_by_key(|usage| usage.remaining)
    }

    /// Count one use against every limit matching `endpoint`.
    ///
    /// Returns `false`, leaving usage unchanged, when any matching limit is
    /// exhausted and overage is not allowed. Entities without a quota, or
    /// endpoints no limit matches, are not restricted.
    pub fn increment_quota(
        &self,
        entity_type: QuotaEntityType,
        entity_id: &str,
        endpoint: &str,
    ) -> bool {
        let Some(id) = self.quota_id_for(entity_type, entity_id) else {
            return true;
        };
        let now = self.clock.now();

        let exceeded = {
            let Some(mut entry) = self.quotas.get_mut(&id) else {
                return true;
            };
            entry.roll_over(now);

            let matching = entry.matching(endpoint);
            let exhausted = matching
                .iter()
                .copied()
                .find(|&i| entry.config.limits[i].used >= entry.config.limits[i].limit);

            match exhausted {
                Some(i) if !entry.config.overage_allowed => {
                    let limit = &entry.config.limits[i];
                    Some((limit.endpoint.clone(), limit.used, limit.limit))
                }
                _ => {
                    for i in matching {
                        entry.config.limits[i].used += 1;
                    }
                    None
                }
            }
        };

        match exceeded {
            Some((pattern, used, limit)) => {
                debug!(
                    quota_id = %id,
                    endpoint = %endpoint,
                    used,
                    limit,
                    "Quota exhausted"
                );
                self.events.publish(WardenEvent::QuotaExceeded {
                    quota_id: id,
                    endpoint: pattern,
                    used,
                    limit,
                });
                false
            }
            None => true,
        }
    }

    pub fn update_quota(&self, id: &str, update: QuotaUpdate) -> Result<QuotaConfig> {
        let now = self.clock.now();
        let config = {
            let mut entry = self
                .quotas
                .get_mut(id)
                .ok_or_else(|| WardenError::quota_not_found(id))?;
            entry.roll_over(now);

            let mut config = entry.config.clone();
            if let Some(limits) = update.limits {
                validate_limits(&limits)?;
                config.limits = limits
                    .into_iter()
                    .map(|l| {
                        let carried = entry
                            .config
                            .limits
                            .iter()
                            .find(|old| old.endpoint == l.endpoint && old.period == l.period);
                        QuotaLimit {
                            used: carried.map_or(0, |old| old.used),
                            period_start: carried.map_or(now, |old| old.period_start),
                            reset_at: carried.map_or_else(|| l.period.advance(now), |old| old.reset_at),
                            endpoint: l.endpoint,
                            period: l.period,
                            limit: l.limit,
                        }
                    })
                    .collect();
            }
            if let Some(overage_allowed) = update.overage_allowed {
                config.overage_allowed = overage_allowed;
            }
            config.updated_at = now;

            *entry = QuotaEntry::new(config.clone())?;
            config
        };

        info!(quota_id = %id, "Quota updated");
        self.events.publish(WardenEvent::QuotaUpdated {
            quota: config.clone(),
        });
        Ok(config)
    }

    /// Zero every limit's usage and start fresh periods from now.
    pub fn reset_quota(&self, id: &str) -> Result<QuotaConfig> {
        let now = self.clock.now();
        let config = {
            let mut entry = self
                .quotas
                .get_mut(id)
                .ok_or_else(|| WardenError::quota_not_found(id))?;
            for limit in &mut entry.config.limits {
                limit.used = 0;
                limit.period_start = now;
                limit.reset_at = limit.period.advance(now);
            }
            entry.config.updated_at = now;
            entry.config.clone()
        };

        info!(quota_id = %id, "Quota reset");
        self.events.publish(WardenEvent::QuotaUpdated {
            quota: config.clone(),
        });
        Ok(config)
    }

    pub fn delete_quota(&self, id: &str) -> Result<()> {
        let (_, entry) = self
            .quotas
            .remove(id)
            .ok_or_else(|| WardenError::quota_not_found(id))?;
        self.by_entity
            .remove(&(entry.config.entity_type, entry.config.entity_id));

        info!(quota_id = %id, "Quota deleted");
        self.events.publish(WardenEvent::QuotaDeleted {
            quota_id: id.to_string(),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.quotas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotas.is_empty()
    }

    fn quota_id_for(&self, entity_type: QuotaEntityType, entity_id: &str) -> Option<String> {
        self.by_entity
            .get(&(entity_type, entity_id.to_string()))
            .map(|id| id.value().clone())
    }
}
