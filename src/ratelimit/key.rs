//! Request context and state key derivation.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::rule::{RateLimitRule, Scope};
use super::store::{CompiledRule, RuleStore};

/// Identity attached to a request by the HTTP layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub endpoint: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl RequestContext {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_ip(mut self, ip_address: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

/// A key that uniquely identifies one rule's counter for one identity.
///
/// Formatted as `scope:identity:rule_id`, or `global:rule_id` for global rules.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateKey(String);

impl StateKey {
    /// Build the key for a rule evaluated against a request.
    pub fn for_rule(rule: &RateLimitRule, ctx: &RequestContext) -> Self {
        let key = match rule.scope {
            Scope::Global => format!("global:{}", rule.id),
            Scope::User => format!(
                "user:{}:{}",
                ctx.user_id.as_deref().unwrap_or("anonymous"),
                rule.id
            ),
            Scope::Tenant => format!(
                "tenant:{}:{}",
                ctx.tenant_id.as_deref().unwrap_or("default"),
                rule.id
            ),
            Scope::Endpoint => format!("endpoint:{}:{}", ctx.endpoint, rule.id),
            Scope::Ip => format!(
                "ip:{}:{}",
                ctx.ip_address.as_deref().unwrap_or("unknown"),
                rule.id
            ),
        };
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StateKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for StateKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Finds the rules that apply to a request and the key each one counts under.
#[derive(Clone)]
pub struct KeyResolver {
    rules: Arc<RuleStore>,
}

impl KeyResolver {
    pub fn new(rules: Arc<RuleStore>) -> Self {
        Self { rules }
    }

    /// Enabled rules matching the request's endpoint, in priority order.
    pub fn applicable_rules(&self, ctx: &RequestContext) -> Vec<Arc<CompiledRule>> {
        self.rules.applicable(&ctx.endpoint)
    }

    /// Every applicable rule paired with its scoped key.
    pub fn resolve(&self, ctx: &RequestContext) -> Vec<(Arc<CompiledRule>, StateKey)> {
        self.applicable_rules(ctx)
            .into_iter()
            .map(|compiled| {
                let key = StateKey::for_rule(&compiled.rule, ctx);
                (compiled, key)
            })
            .collect()
    }
}
