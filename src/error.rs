//! Error types for stores and configuration.
//!
//! Neither type ever reaches a caller of
//! [`AccessDecisionEngine::evaluate`](crate::AccessDecisionEngine::evaluate):
//! the engine folds store failures into a `SYSTEM_ERROR` decision.

use std::time::Duration;

/// Failure reported by a backing store (subscriptions, rate-limit windows, usage counters).
///
/// `Clone` so a single in-flight load can hand the same failure to every waiter.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store did not answer in time.
    #[error("store timed out after {0:?}")]
    Timeout(Duration),
    /// The store answered with data that could not be interpreted.
    #[error("corrupt store data: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Shorthand for a poisoned in-process lock, which is treated as an outage.
    pub(crate) fn poisoned(what: &str) -> Self {
        StoreError::Unavailable(format!("{what} lock poisoned"))
    }
}

/// Invalid configuration or catalog input.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// A tier name did not match any known tier.
    #[error("unknown tier '{0}'")]
    UnknownTier(String),
    /// A numeric setting was out of range.
    #[error("{field} is invalid: {reason}")]
    Invalid {
        /// Offending setting.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
    /// A feature descriptor was rejected.
    #[error("feature '{id}' is invalid: {reason}")]
    InvalidFeature {
        /// Feature identifier.
        id: String,
        /// Why it was rejected.
        reason: String,
    },
    /// Input could not be parsed.
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
    /// A catalog source failed to load.
    #[error("catalog source failed: {0}")]
    Source(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display_mentions_cause() {
        let err = StoreError::Unavailable("connection refused".into());
        assert!(err.to_string().contains("connection refused"));
        let err = StoreError::Timeout(Duration::from_millis(250));
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn poisoned_lock_is_an_outage() {
        let err = StoreError::poisoned("cache");
        assert!(matches!(err, StoreError::Unavailable(m) if m.contains("cache")));
    }

    #[test]
    fn config_error_wraps_json_errors() {
        let parse = serde_json::from_str::<u32>("nope").unwrap_err();
        let err: ConfigError = parse.into();
        assert!(err.to_string().starts_with("parse error"));
    }
}
