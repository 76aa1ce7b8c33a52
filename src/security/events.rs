use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// How much attention an event deserves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// Category of a security event. Alert rules are keyed by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityEventKind {
    /// Access granted on the normal path (audit trail).
    AccessGranted,
    /// Access granted only because a grace window is open.
    GracePeriodAccess,
    /// Tier, status, rollout or flag denial.
    AccessDenied,
    /// Request carried no principal.
    AuthRequired,
    /// Principal exceeded a feature's request rate.
    RateLimitExceeded,
    /// Principal exhausted a usage allowance.
    UsageLimitExceeded,
    /// Request named a feature missing from the catalog.
    FeatureMisconfigured,
    /// Subscription store failed; access was denied.
    SubscriptionServiceFailure,
    /// Rate-limit window store failed; access was denied.
    RateLimiterFailure,
    /// Usage counter store failed; access was denied.
    UsageStoreFailure,
    /// Heuristic analysis flagged a principal.
    SuspiciousActivity,
}

impl SecurityEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityEventKind::AccessGranted => "ACCESS_GRANTED",
            SecurityEventKind::GracePeriodAccess => "GRACE_PERIOD_ACCESS",
            SecurityEventKind::AccessDenied => "ACCESS_DENIED",
            SecurityEventKind::AuthRequired => "AUTH_REQUIRED",
            SecurityEventKind::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            SecurityEventKind::UsageLimitExceeded => "USAGE_LIMIT_EXCEEDED",
            SecurityEventKind::FeatureMisconfigured => "FEATURE_MISCONFIGURED",
            SecurityEventKind::SubscriptionServiceFailure => "SUBSCRIPTION_SERVICE_FAILURE",
            SecurityEventKind::RateLimiterFailure => "RATE_LIMITER_FAILURE",
            SecurityEventKind::UsageStoreFailure => "USAGE_STORE_FAILURE",
            SecurityEventKind::SuspiciousActivity => "SUSPICIOUS_ACTIVITY",
        }
    }
}

impl fmt::Display for SecurityEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A security-relevant occurrence recorded by the [`SecurityMonitor`](super::SecurityMonitor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: SecurityEventKind,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl SecurityEvent {
    pub fn new(kind: SecurityEventKind, severity: Severity, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            kind,
            severity,
            principal: None,
            feature: None,
            ip: None,
            details: BTreeMap::new(),
        }
    }

    /// Attribute the event to `principal`.
    pub fn principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn feature(mut self, feature: impl Into<String>) -> Self {
        self.feature = Some(feature.into());
        self
    }

    pub fn ip(mut self, ip: Option<String>) -> Self {
        self.ip = ip;
        self
    }

    /// Add a free-form detail. Later values replace earlier ones.
    pub fn detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.details.insert(key.into(), value.to_string());
        self
    }
}

impl fmt::Display for SecurityEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.kind, self.severity)?;
        if let Some(p) = &self.principal {
            write!(f, " principal={}", p)?;
        }
        if let Some(feature) = &self.feature {
            write!(f, " feature={}", feature)?;
        }
        Ok(())
    }
}

/// Raised when an event kind crosses its frequency threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub raised_at: DateTime<Utc>,
    pub kind: SecurityEventKind,
    pub severity: Severity,
    /// Events of `kind` inside the window when the alert fired.
    pub count: usize,
    pub threshold: usize,
    pub window_secs: u64,
    /// Distinct principals among the counted events, sorted.
    pub affected_principals: Vec<String>,
    /// The most recent counted events, oldest first.
    pub recent_events: Vec<SecurityEvent>,
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Alert({} x{} in {}s, {} principals)",
            self.kind,
            self.count,
            self.window_secs,
            self.affected_principals.len()
        )
    }
}

/// What audit sinks receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum AuditEntry {
    Event(SecurityEvent),
    Alert(Alert),
}

impl AuditEntry {
    /// Severity of the event or alert.
    pub fn severity(&self) -> Severity {
        match self {
            AuditEntry::Event(e) => e.severity,
            AuditEntry::Alert(a) => a.severity,
        }
    }

    pub fn kind(&self) -> SecurityEventKind {
        match self {
            AuditEntry::Event(e) => e.kind,
            AuditEntry::Alert(a) => a.kind,
        }
    }
}

impl fmt::Display for AuditEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditEntry::Event(e) => write!(f, "Event::{}", e),
            AuditEntry::Alert(a) => write!(f, "Alert::{}", a),
        }
    }
}
