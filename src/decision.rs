//! The engine's output type and per-request context.

use crate::tier::Tier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a request was allowed or denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    Granted,
    /// Allowed only because a grace window is open.
    GracePeriod,
    AuthRequired,
    /// The feature is not in the catalog. A configuration problem, not a caller error.
    FeatureNotFound,
    /// A flag the feature requires is switched off.
    FeatureDisabled,
    RateLimited,
    NotInRollout,
    InsufficientTier,
    SubscriptionExpired,
    UsageLimitExceeded,
    /// A dependency failed and the request was denied.
    SystemError,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::Granted => "GRANTED",
            ReasonCode::GracePeriod => "GRACE_PERIOD",
            ReasonCode::AuthRequired => "AUTH_REQUIRED",
            ReasonCode::FeatureNotFound => "FEATURE_NOT_FOUND",
            ReasonCode::FeatureDisabled => "FEATURE_DISABLED",
            ReasonCode::RateLimited => "RATE_LIMITED",
            ReasonCode::NotInRollout => "NOT_IN_ROLLOUT",
            ReasonCode::InsufficientTier => "INSUFFICIENT_TIER",
            ReasonCode::SubscriptionExpired => "SUBSCRIPTION_EXPIRED",
            ReasonCode::UsageLimitExceeded => "USAGE_LIMIT_EXCEEDED",
            ReasonCode::SystemError => "SYSTEM_ERROR",
        }
    }

    /// Caller-facing text. Contains no internal detail.
    pub fn message(self) -> &'static str {
        match self {
            ReasonCode::Granted => "Access granted.",
            ReasonCode::GracePeriod => {
                "Access granted during your grace period. Renew to keep access."
            }
            ReasonCode::AuthRequired => "Sign in to use this feature.",
            ReasonCode::FeatureNotFound => "This feature is not available.",
            ReasonCode::FeatureDisabled => "This feature is currently disabled.",
            ReasonCode::RateLimited => "Too many requests. Try again later.",
            ReasonCode::NotInRollout => "This feature is not yet available for your account.",
            ReasonCode::InsufficientTier => "Upgrade your plan to use this feature.",
            ReasonCode::SubscriptionExpired => "Your subscription has expired. Renew to continue.",
            ReasonCode::UsageLimitExceeded => "You have reached your usage limit for this period.",
            ReasonCode::SystemError => "We could not verify access right now. Try again later.",
        }
    }

    /// Whether a plan change could turn this denial into a grant.
    pub fn is_upgradeable(self) -> bool {
        matches!(
            self,
            ReasonCode::InsufficientTier
                | ReasonCode::SubscriptionExpired
                | ReasonCode::UsageLimitExceeded
        )
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allow/deny result of one evaluation, with enough metadata to render an
/// upgrade or retry prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    #[serde(rename = "reason_code")]
    pub reason: ReasonCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_tier: Option<Tier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_tier: Option<Tier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_usage: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_days: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upgrade_tiers: Vec<Tier>,
    /// When a grant was charged against the usage counters. Never serialized.
    #[serde(skip)]
    pub charged_at: Option<DateTime<Utc>>,
}

impl Decision {
    fn with_reason(allowed: bool, reason: ReasonCode) -> Self {
        Self {
            allowed,
            reason,
            required_tier: None,
            current_tier: None,
            usage_limit: None,
            current_usage: None,
            reset_at: None,
            retry_after_secs: None,
            remaining_days: None,
            upgrade_tiers: Vec::new(),
            charged_at: None,
        }
    }

    /// Plain grant.
    pub fn granted() -> Self {
        Self::with_reason(true, ReasonCode::Granted)
    }

    /// Grant made under a grace window.
    pub fn grace(remaining_days: Option<u32>) -> Self {
        Self { remaining_days, ..Self::with_reason(true, ReasonCode::GracePeriod) }
    }

    /// Denial for `reason`. Upgrade hints are filled in by the engine.
    pub fn deny(reason: ReasonCode) -> Self {
        Self::with_reason(false, reason)
    }

    pub fn system_error() -> Self {
        Self::deny(ReasonCode::SystemError)
    }

    /// Attach the required and current tiers.
    pub fn tiers(mut self, required: Tier, current: Tier) -> Self {
        self.required_tier = Some(required);
        self.current_tier = Some(current);
        self
    }

    /// Set `retry_after_secs`, rounded up and never below one second.
    pub fn retry_after(mut self, after: std::time::Duration) -> Self {
        // Round up so a Retry-After header never tells the caller to come back early.
        let secs = after.as_secs() + u64::from(after.subsec_nanos() > 0);
        self.retry_after_secs = Some(secs.max(1));
        self
    }

    /// Message for the caller, taken from the reason.
    pub fn message(&self) -> &'static str {
        self.reason.message()
    }
}

/// Request metadata carried into evaluation and security events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestContext {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
    /// Whether a grace window may override a tier or status denial for this call.
    pub allow_grace_period: bool,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self { ip: None, user_agent: None, session_id: None, allow_grace_period: true }
    }
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Skip grace windows for this request.
    pub fn without_grace(mut self) -> Self {
        self.allow_grace_period = false;
        self
    }
}
