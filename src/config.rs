//! Engine configuration.
//!
//! Every field has a default, so `{}` is a valid configuration:
//!
//! ```rust
//! use tollgate::GateConfig;
//!
//! let json = r#"{ "cache_ttl_secs": 60, "enabled_flags": ["beta"] }"#;
//! let config = GateConfig::from_json_str(json).unwrap();
//! assert_eq!(config.cache_ttl_secs, 60);
//! assert_eq!(config.cache_max_entries, 10_000);
//! assert!(config.enabled_flags.contains("beta"));
//! ```

use crate::error::ConfigError;
use crate::security::MonitorConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// How long a loaded subscription is served from cache.
    pub cache_ttl_secs: u64,
    pub cache_max_entries: usize,
    /// `retry_after` handed out when the rate-limit store is down.
    pub rate_limit_failure_backoff_secs: u64,
    /// Master switch for grace-period overrides.
    pub grace_periods_enabled: bool,
    pub default_grace_days: u32,
    /// Pending usage records before new ones are dropped.
    pub usage_queue_capacity: usize,
    /// Report grants to the security monitor as well as denials.
    pub audit_grants: bool,
    /// Flags switched on for this deployment.
    pub enabled_flags: BTreeSet<String>,
    pub monitor: MonitorConfig,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            cache_max_entries: 10_000,
            rate_limit_failure_backoff_secs: 300,
            grace_periods_enabled: true,
            default_grace_days: 7,
            usage_queue_capacity: 1_024,
            audit_grants: true,
            enabled_flags: BTreeSet::new(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl GateConfig {
    /// Parse and validate.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject zero sizes and durations, and grace defaults over a year.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_ttl_secs == 0 {
            return Err(must_be_positive("cache_ttl_secs"));
        }
        if self.cache_max_entries == 0 {
            return Err(must_be_positive("cache_max_entries"));
        }
        if self.rate_limit_failure_backoff_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "rate_limit_failure_backoff_secs",
                reason: "must be > 0 so a failed limiter still slows callers".into(),
            });
        }
        if self.usage_queue_capacity == 0 {
            return Err(must_be_positive("usage_queue_capacity"));
        }
        if self.default_grace_days > 366 {
            return Err(ConfigError::Invalid {
                field: "default_grace_days",
                reason: "must be at most 366".into(),
            });
        }
        self.monitor.validate()
    }

    /// Subscription cache TTL as a `Duration`.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn rate_limit_failure_backoff(&self) -> Duration {
        Duration::from_secs(self.rate_limit_failure_backoff_secs)
    }

    /// Turn on a flag that features can require.
    pub fn enable_flag(mut self, flag: impl Into<String>) -> Self {
        self.enabled_flags.insert(flag.into());
        self
    }
}

fn must_be_positive(field: &'static str) -> ConfigError {
    ConfigError::Invalid { field, reason: "must be > 0".into() }
}
