//! Configuration management for Warden.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::enforcement::DEFAULT_VIOLATION_CAPACITY;
use crate::error::{Result, WardenError};
use crate::events::DEFAULT_EVENT_BUFFER;
use crate::quota::NewQuota;
use crate::ratelimit::NewRule;

/// Prefix for environment overrides, e.g. `WARDEN__ENGINE__DEFAULT_LIMIT=500`.
const ENV_PREFIX: &str = "WARDEN";
const ENV_SEPARATOR: &str = "__";

/// Main configuration for the Warden engine and binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// Admission engine behaviour
    pub engine: EngineConfig,

    /// Background cleanup of state, violations and analytics
    pub retention: RetentionConfig,

    /// Log output
    pub logging: LoggingConfig,

    /// Path to a YAML rule file loaded at startup
    pub rules_path: Option<String>,

    /// Rules declared inline
    pub rules: Vec<NewRule>,

    /// Quotas declared inline
    pub quotas: Vec<NewQuota>,
}

/// What to do with a request no enabled rule applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoMatchPolicy {
    /// Allow, reporting the default limit
    #[default]
    FailOpen,
    /// Deny
    FailClosed,
}

/// Admission engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub no_match_policy: NoMatchPolicy,

    /// Limit reported when no rule applies
    pub default_limit: u64,

    /// Window reported when no rule applies
    pub default_window_ms: u64,

    /// Violations kept in memory before trimming
    pub violation_capacity: usize,

    /// Capacity of the event channel
    pub event_buffer: usize,

    /// Entries in each day's top violator list
    pub top_violators: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            no_match_policy: NoMatchPolicy::default(),
            default_limit: default_limit(),
            default_window_ms: default_window_ms(),
            violation_capacity: DEFAULT_VIOLATION_CAPACITY,
            event_buffer: DEFAULT_EVENT_BUFFER,
            top_violators: default_top_violators(),
        }
    }
}

fn default_limit() -> u64 {
    1000
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_top_violators() -> usize {
    10
}

/// Retention configuration for the background janitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub cleanup_interval_secs: u64,

    /// Per-key state untouched for this long is dropped
    pub state_idle_ttl_secs: u64,

    pub violation_retention_secs: u64,

    pub analytics_retention_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: 60,
            state_idle_ttl_secs: 3600,
            violation_retention_secs: 7 * 24 * 3600,
            analytics_retention_days: 30,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl WardenConfig {
    /// Load configuration from an optional file, then apply `WARDEN__*`
    /// environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path, "Loading configuration");
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator(ENV_SEPARATOR)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        let config: WardenConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: WardenConfig = serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.engine.default_limit == 0 {
            return Err(WardenError::Config(
                "engine.default_limit must be greater than zero".to_string(),
            ));
        }
        if self.engine.default_window_ms == 0 {
            return Err(WardenError::Config(
                "engine.default_window_ms must be greater than zero".to_string(),
            ));
        }
        if self.engine.event_buffer == 0 {
            return Err(WardenError::Config(
                "engine.event_buffer must be greater than zero".to_string(),
            ));
        }
        if self.retention.cleanup_interval_secs == 0 {
            return Err(WardenError::Config(
                "retention.cleanup_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
