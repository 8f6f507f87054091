//! Rule files.
//!
//! A rule file is YAML with two optional lists, `rules` and `quotas`, using
//! the same shape as the inline `rules`/`quotas` of the main configuration:
//!
//! ```yaml
//! rules:
//!   - id: api-per-user
//!     name: API per user
//!     scope: USER
//!     strategy: TOKEN_BUCKET
//!     limit: 100
//!     window_ms: 60000
//!     burst_limit: 150
//!     endpoints: ["/api/*"]
//! quotas:
//!   - entity_type: TENANT
//!     entity_id: acme
//!     limits:
//!       - endpoint: "/api/*"
//!         period: DAY
//!         limit: 100000
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

use super::pattern::EndpointFilter;
use super::rule::NewRule;
use crate::error::{Result, WardenError};
use crate::quota::NewQuota;

/// Rules and quotas loaded from a file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSet {
    pub rules: Vec<NewRule>,
    pub quotas: Vec<NewQuota>,
}

impl RuleSet {
    /// Load a rule set from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rule file");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse a rule set from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(format!("Failed to parse rule file: {}", e)))
    }

    /// Check every rule the way the rule store would on creation, without
    /// creating anything. Quotas are checked when they are created.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for (index, new_rule) in self.rules.iter().enumerate() {
            let id = new_rule
                .id
                .clone()
                .unwrap_or_else(|| format!("rules[{}]", index));
            if new_rule.id.is_some() && !ids.insert(id.clone()) {
                return Err(WardenError::InvalidConfiguration(format!(
                    "duplicate rule id '{}'",
                    id
                )));
            }

            let rule = new_rule.clone().into_rule(id, Utc::now());
            rule.validate()?;
            EndpointFilter::new(&rule.endpoints, &rule.excluded_endpoints)?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.quotas.is_empty()
    }
}
