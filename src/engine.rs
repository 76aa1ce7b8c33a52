//! The access decision engine.
//!
//! [`AccessDecisionEngine::evaluate`] runs one request through a fixed
//! sequence of checks and returns a [`Decision`]. It never returns an error:
//! any dependency failure becomes a `SYSTEM_ERROR` denial, is logged at error
//! level and reported to the [`SecurityMonitor`] as a CRITICAL event.
//!
//! Check order, stopping at the first denial:
//!
//! 1. a principal is present
//! 2. the feature exists in the catalog
//! 3. the feature's rate limit, if it has one
//! 4. rollout membership and required flags
//! 5. the subscription loads
//! 6. tier, then status (candidate denials)
//! 7. a grace window may override a candidate denial
//! 8. the usage allowance for the current period
//!
//! A grant on a limited feature consumes one unit of the allowance in the
//! same atomic step that checks it, so a burst of calls can never overshoot
//! the limit. Grants on unlimited features are counted by a background
//! worker and the decision is returned without waiting for it. Callers that
//! run the feature themselves report failures with
//! [`AccessDecisionEngine::record_outcome`] to get the unit back.
//!
//! ```rust
//! use tollgate::{AccessDecisionEngine, FeatureDescriptor, FeatureRegistry, RequestContext, Tier};
//! use tollgate::{InMemorySubscriptionStore, ReasonCode, SubscriptionRecord, SubscriptionStatus};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let registry = FeatureRegistry::new([FeatureDescriptor::new("export", Tier::Premium)]).unwrap();
//! let store = InMemorySubscriptionStore::with_records([
//!     SubscriptionRecord::new("alice", Tier::Free, SubscriptionStatus::Active),
//! ]);
//! let engine = AccessDecisionEngine::builder()
//!     .registry(registry)
//!     .subscriptions(Arc::new(store))
//!     .build()
//!     .unwrap();
//!
//! let decision = engine.evaluate(Some("alice"), "export", &RequestContext::default()).await;
//! assert!(!decision.allowed);
//! assert_eq!(decision.reason, ReasonCode::InsufficientTier);
//! # }
//! ```

use crate::cache::SubscriptionCache;
use crate::clock::{Clock, SystemClock};
use crate::config::GateConfig;
use crate::decision::{Decision, ReasonCode, RequestContext};
use crate::error::ConfigError;
use crate::grace::{GracePeriodManager, GraceStatus};
use crate::rate_limit::{InMemoryWindowStore, RateLimiter, WindowStore};
use crate::registry::{in_rollout, FeatureDescriptor, FeatureRegistry};
use crate::security::{SecurityEvent, SecurityEventKind, SecurityMonitor, Severity};
use crate::subscription::{InMemorySubscriptionStore, SubscriptionRecord, SubscriptionStore};
use crate::tier::Tier;
use crate::usage::{
    InMemoryUsageStore, UsageCounter, UsageLimit, UsageRecord, UsageRecorder, UsageStore,
};
use std::sync::Arc;

/// Builder for [`AccessDecisionEngine`]. Unset stores default to in-memory ones.
#[derive(Default)]
pub struct AccessDecisionEngineBuilder {
    config: GateConfig,
    clock: Option<Arc<dyn Clock>>,
    registry: Option<FeatureRegistry>,
    subscriptions: Option<Arc<dyn SubscriptionStore>>,
    windows: Option<Arc<dyn WindowStore>>,
    usage: Option<Arc<dyn UsageStore>>,
    monitor: Option<Arc<SecurityMonitor>>,
    grace: Option<GracePeriodManager>,
}

impl std::fmt::Debug for AccessDecisionEngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessDecisionEngineBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AccessDecisionEngineBuilder {
    /// Engine settings; validated by [`build`](Self::build).
    pub fn config(mut self, config: GateConfig) -> Self {
        self.config = config;
        self
    }

    /// Time source shared by every component the builder creates.
    /// Defaults to [`SystemClock`].
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Feature catalog. Without one every feature is unknown.
    pub fn registry(mut self, registry: FeatureRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Backing store for subscription records, read through the cache.
    pub fn subscriptions(mut self, store: Arc<dyn SubscriptionStore>) -> Self {
        self.subscriptions = Some(store);
        self
    }

    /// Storage for rate-limit windows.
    pub fn window_store(mut self, store: Arc<dyn WindowStore>) -> Self {
        self.windows = Some(store);
        self
    }

    /// Storage for usage counters and outcome records.
    pub fn usage_store(mut self, store: Arc<dyn UsageStore>) -> Self {
        self.usage = Some(store);
        self
    }

    /// Use an existing monitor. Its clock and config are left as they are.
    pub fn monitor(mut self, monitor: Arc<SecurityMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Use an existing grace manager. Its clock is left as it is.
    pub fn grace(mut self, grace: GracePeriodManager) -> Self {
        self.grace = Some(grace);
        self
    }

    /// Validate the configuration and assemble the engine.
    ///
    /// Spawns the usage worker, so this must run inside a tokio runtime.
    pub fn build(self) -> Result<AccessDecisionEngine, ConfigError> {
        self.config.validate()?;
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let monitor = self.monitor.unwrap_or_else(|| {
            let monitor = SecurityMonitor::new(config.monitor.clone());
            Arc::new(monitor.with_shared_clock(clock.clone()))
        });
        let subscriptions = self
            .subscriptions
            .unwrap_or_else(|| Arc::new(InMemorySubscriptionStore::new()));
        let cache =
            SubscriptionCache::new(subscriptions, config.cache_ttl(), config.cache_max_entries)
                .with_shared_clock(clock.clone());
        let windows = self.windows.unwrap_or_else(|| Arc::new(InMemoryWindowStore::new()));
        let rate_limiter = RateLimiter::new(windows)
            .with_shared_clock(clock.clone())
            .with_failure_backoff(config.rate_limit_failure_backoff())
            .with_monitor(monitor.clone());
        let usage_store = self.usage.unwrap_or_else(|| {
            Arc::new(InMemoryUsageStore::new().with_shared_clock(clock.clone()))
        });
        let usage = UsageCounter::new(usage_store, clock.clone());
        let recorder = UsageRecorder::spawn(usage.clone(), config.usage_queue_capacity);
        let grace = self
            .grace
            .unwrap_or_else(|| GracePeriodManager::new().with_shared_clock(clock.clone()));

        tracing::info!(
            target: "tollgate::engine",
            cache_ttl_secs = config.cache_ttl_secs,
            grace_periods = config.grace_periods_enabled,
            "access decision engine ready"
        );

        Ok(AccessDecisionEngine {
            config,
            clock,
            registry: self.registry.unwrap_or_default(),
            cache,
            rate_limiter,
            usage,
            recorder,
            grace,
            monitor,
        })
    }
}

/// Orchestrates registry, limiter, cache, grace and usage checks into one decision.
pub struct AccessDecisionEngine {
    config: GateConfig,
    clock: Arc<dyn Clock>,
    registry: FeatureRegistry,
    cache: SubscriptionCache,
    rate_limiter: RateLimiter,
    usage: UsageCounter,
    recorder: UsageRecorder,
    grace: GracePeriodManager,
    monitor: Arc<SecurityMonitor>,
}

impl std::fmt::Debug for AccessDecisionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessDecisionEngine")
            .field("features", &self.registry.len())
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// What a decision reports to the monitor.
struct Audit {
    kind: SecurityEventKind,
    severity: Severity,
    detail: Option<(&'static str, String)>,
}

impl Audit {
    fn new(kind: SecurityEventKind, severity: Severity) -> Self {
        Self { kind, severity, detail: None }
    }

    fn with_detail(mut self, key: &'static str, value: impl ToString) -> Self {
        self.detail = Some((key, value.to_string()));
        self
    }
}

/// Step 6-7 outcome before a grace override is considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Candidate {
    Tier,
    Expired,
}

impl AccessDecisionEngine {
    /// Start configuring an engine.
    pub fn builder() -> AccessDecisionEngineBuilder {
        AccessDecisionEngineBuilder::default()
    }

    /// Decide whether `principal` may use `feature_id` now.
    ///
    /// Never fails: a dependency error becomes a `SYSTEM_ERROR` denial. A
    /// grant has already been charged against the usage allowance.
    pub async fn evaluate(
        &self,
        principal: Option<&str>,
        feature_id: &str,
        ctx: &RequestContext,
    ) -> Decision {
        let Some(principal) = principal.filter(|p| !p.trim().is_empty()) else {
            let decision = Decision::deny(ReasonCode::AuthRequired);
            let audit = Audit::new(SecurityEventKind::AuthRequired, Severity::Medium);
            return self.report(None, feature_id, ctx, decision, Some(audit)).await;
        };

        let Some(feature) = self.registry.get_feature(feature_id) else {
            tracing::error!(
                target: "tollgate::engine",
                feature = feature_id,
                "request for unknown feature"
            );
            let decision = Decision::deny(ReasonCode::FeatureNotFound);
            let audit = Audit::new(SecurityEventKind::FeatureMisconfigured, Severity::High);
            return self.report(Some(principal), feature_id, ctx, decision, Some(audit)).await;
        };

        if let Some(rule) = feature.rate_limit {
            let outcome = self
                .rate_limiter
                .check(principal, feature_id, rule.limit, rule.window_secs)
                .await;
            if outcome.degraded {
                // The limiter already reported its store failure.
                let decision =
                    Decision::system_error().retry_after(self.rate_limiter.failure_backoff());
                return self.report(Some(principal), feature_id, ctx, decision, None).await;
            }
            if !outcome.allowed {
                let mut decision = Decision::deny(ReasonCode::RateLimited);
                if let Some(wait) = outcome.retry_after {
                    decision = decision.retry_after(wait);
                }
                let audit = Audit::new(SecurityEventKind::RateLimitExceeded, Severity::Medium)
                    .with_detail("count", outcome.current_count);
                return self.report(Some(principal), feature_id, ctx, decision, Some(audit)).await;
            }
        }

        if !in_rollout(principal, feature_id, feature.rollout_percentage) {
            let decision = Decision::deny(ReasonCode::NotInRollout);
            let audit = Audit::new(SecurityEventKind::AccessDenied, Severity::Low);
            return self.report(Some(principal), feature_id, ctx, decision, Some(audit)).await;
        }
        let missing_flag =
            feature.required_flags.iter().find(|f| !self.config.enabled_flags.contains(*f));
        if let Some(flag) = missing_flag {
            let decision = Decision::deny(ReasonCode::FeatureDisabled);
            let audit = Audit::new(SecurityEventKind::AccessDenied, Severity::Low)
                .with_detail("flag", flag);
            return self.report(Some(principal), feature_id, ctx, decision, Some(audit)).await;
        }

        let subscription = match self.cache.get(principal).await {
            Ok((subscription, _cached)) => subscription,
            Err(e) => {
                tracing::error!(
                    target: "tollgate::engine",
                    principal,
                    feature = feature_id,
                    error = %e,
                    "subscription lookup failed; denying"
                );
                let audit =
                    Audit::new(SecurityEventKind::SubscriptionServiceFailure, Severity::Critical)
                        .with_detail("error", &e);
                let decision = Decision::system_error();
                return self.report(Some(principal), feature_id, ctx, decision, Some(audit)).await;
            }
        };

        let now = self.clock.now();
        let entitled = subscription.tier.satisfies(feature.required_tier)
            || subscription.enabled_features.contains(feature_id);
        let candidate = if !entitled {
            Some(Candidate::Tier)
        } else if subscription.is_lapsed(now) {
            Some(Candidate::Expired)
        } else {
            None
        };

        let mut grace = None;
        if let Some(candidate) = candidate {
            if ctx.allow_grace_period && self.config.grace_periods_enabled {
                let status = self.grace.check(principal, feature_id, Some(&*subscription));
                if status.in_grace {
                    grace = Some((candidate, status));
                }
            }
            if grace.is_none() {
                let (decision, audit) = candidate_denial(candidate, &feature, &subscription);
                return self.report(Some(principal), feature_id, ctx, decision, Some(audit)).await;
            }
        }

        // A tier override is granted at the tier the feature asks for.
        let effective_tier = match grace {
            Some((Candidate::Tier, _)) => subscription.tier.max(feature.required_tier),
            _ => subscription.tier,
        };
        let limit = subscription
            .limits
            .get(feature_id)
            .map_or_else(|| feature.limit_for(effective_tier), |raw| UsageLimit::from_raw(*raw));

        // Usage before this call, for limited features.
        let mut usage_seen = None;
        if let UsageLimit::Max(max) = limit {
            let period = feature.usage_period;
            let state = match self.usage.try_consume(principal, feature_id, period, max).await {
                Ok(state) => state,
                Err(e) => {
                    tracing::error!(
                        target: "tollgate::engine",
                        principal,
                        feature = feature_id,
                        error = %e,
                        "usage check failed; denying"
                    );
                    let audit =
                        Audit::new(SecurityEventKind::UsageStoreFailure, Severity::Critical)
                            .with_detail("error", &e);
                    let decision = Decision::system_error();
                    return self
                        .report(Some(principal), feature_id, ctx, decision, Some(audit))
                        .await;
                }
            };
            if !state.allowed {
                let current = state.count;
                let mut decision = Decision::deny(ReasonCode::UsageLimitExceeded);
                decision.usage_limit = Some(max);
                decision.current_usage = Some(current);
                decision.current_tier = Some(subscription.tier);
                decision.reset_at = Some(period.next_reset(now));
                decision.upgrade_tiers = usage_upgrades(&feature, effective_tier, limit);
                let audit = Audit::new(SecurityEventKind::UsageLimitExceeded, Severity::Medium)
                    .with_detail("usage", format!("{current}/{max}"));
                return self.report(Some(principal), feature_id, ctx, decision, Some(audit)).await;
            }
            usage_seen = Some((max, state.count.saturating_sub(1)));
        } else {
            self.recorder.charge(principal, feature_id, now);
        }

        let (mut decision, audit) = match grace {
            Some((candidate, status)) => grace_grant(candidate, status),
            None => {
                let audit = self
                    .config
                    .audit_grants
                    .then(|| Audit::new(SecurityEventKind::AccessGranted, Severity::Low));
                (Decision::granted(), audit)
            }
        };
        decision.current_tier = Some(subscription.tier);
        decision.charged_at = Some(now);
        if let Some((max, current)) = usage_seen {
            decision.usage_limit = Some(max);
            decision.current_usage = Some(current);
        }
        self.report(Some(principal), feature_id, ctx, decision, audit).await
    }

    /// Report how a granted invocation turned out.
    ///
    /// The outcome is logged to the usage store. A failure hands back the
    /// unit `decision` charged, in the period it was charged in, so only
    /// successful invocations stay counted. Report each grant at most once.
    /// Returns `false` if `decision` was a denial or the record was dropped.
    pub fn record_outcome(
        &self,
        principal: &str,
        feature_id: &str,
        decision: &Decision,
        success: bool,
    ) -> bool {
        if !decision.allowed {
            return false;
        }
        self.recorder.submit(UsageRecord {
            principal: principal.to_string(),
            feature: feature_id.to_string(),
            timestamp: decision.charged_at.unwrap_or_else(|| self.clock.now()),
            success,
        })
    }

    /// Wait until every queued usage charge and outcome has been applied.
    pub async fn flush_usage(&self) {
        self.recorder.flush().await;
    }

    /// Open a grace window of the configured default length. Returns its end.
    pub fn grant_default_grace(&self, principal: &str) -> chrono::DateTime<chrono::Utc> {
        self.grace.grant_days(principal, None, self.config.default_grace_days)
    }

    /// Drop a principal's cached subscription after it changed upstream.
    pub fn invalidate(&self, principal: &str) -> bool {
        self.cache.invalidate(principal)
    }

    /// Configuration the engine was built with.
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn registry(&self) -> &FeatureRegistry {
        &self.registry
    }

    /// Subscription cache, for invalidation after billing changes.
    pub fn cache(&self) -> &SubscriptionCache {
        &self.cache
    }

    /// The monitor every decision reports to.
    pub fn monitor(&self) -> &Arc<SecurityMonitor> {
        &self.monitor
    }

    /// Grace windows consulted on lapsed subscriptions.
    pub fn grace(&self) -> &GracePeriodManager {
        &self.grace
    }

    /// Read access to the usage counters.
    pub fn usage(&self) -> &UsageCounter {
        &self.usage
    }

    /// The background worker applying usage charges and outcomes.
    pub fn usage_recorder(&self) -> &UsageRecorder {
        &self.recorder
    }

    async fn report(
        &self,
        principal: Option<&str>,
        feature_id: &str,
        ctx: &RequestContext,
        decision: Decision,
        audit: Option<Audit>,
    ) -> Decision {
        tracing::debug!(
            target: "tollgate::engine",
            principal,
            feature = feature_id,
            allowed = decision.allowed,
            reason = %decision.reason,
            "access evaluated"
        );
        if let Some(audit) = audit {
            let mut event = SecurityEvent::new(audit.kind, audit.severity, self.clock.now())
                .feature(feature_id)
                .ip(ctx.ip.clone())
                .detail("reason_code", decision.reason);
            if let Some(principal) = principal {
                event = event.principal(principal);
            }
            if let Some(session) = &ctx.session_id {
                event = event.detail("session_id", session);
            }
            if let Some((key, value)) = audit.detail {
                event = event.detail(key, value);
            }
            self.monitor.log_event(event).await;
        }
        decision
    }
}

fn candidate_denial(
    candidate: Candidate,
    feature: &FeatureDescriptor,
    subscription: &SubscriptionRecord,
) -> (Decision, Audit) {
    let audit = Audit::new(SecurityEventKind::AccessDenied, Severity::Low);
    let reason = match candidate {
        Candidate::Tier => ReasonCode::InsufficientTier,
        Candidate::Expired => ReasonCode::SubscriptionExpired,
    };
    let mut decision = Decision::deny(reason).tiers(feature.required_tier, subscription.tier);
    if candidate == Candidate::Tier {
        decision.upgrade_tiers = subscription
            .tier
            .higher()
            .filter(|t| t.satisfies(feature.required_tier))
            .collect();
    }
    (decision, audit.with_detail("reason", reason))
}

fn grace_grant(candidate: Candidate, status: GraceStatus) -> (Decision, Option<Audit>) {
    let overridden = match candidate {
        Candidate::Tier => ReasonCode::InsufficientTier,
        Candidate::Expired => ReasonCode::SubscriptionExpired,
    };
    let audit = Audit::new(SecurityEventKind::GracePeriodAccess, Severity::Low)
        .with_detail("overrides", overridden);
    (Decision::grace(status.remaining_days), Some(audit))
}

/// Tiers above `tier` whose allowance for `feature` beats `current`.
fn usage_upgrades(feature: &FeatureDescriptor, tier: Tier, current: UsageLimit) -> Vec<Tier> {
    tier.higher().filter(|t| feature.limit_for(*t).is_more_generous_than(current)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::tier::SubscriptionStatus;
    use chrono::{TimeZone, Utc};

    fn clock() -> ManualClock {
        ManualClock::at(Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn blank_principal_requires_auth() {
        let engine = AccessDecisionEngine::builder().clock(clock()).build().unwrap();
        let decision = engine.evaluate(Some("  "), "export", &RequestContext::default()).await;
        assert_eq!(decision.reason, ReasonCode::AuthRequired);
        assert_eq!(engine.monitor().recent_events()[0].kind, SecurityEventKind::AuthRequired);
    }

    #[tokio::test]
    async fn add_on_entitlement_bypasses_tier() {
        let registry =
            FeatureRegistry::new([FeatureDescriptor::new("export", Tier::Enterprise)]).unwrap();
        let store = InMemorySubscriptionStore::with_records([SubscriptionRecord::new(
            "alice",
            Tier::Basic,
            SubscriptionStatus::Active,
        )
        .with_feature("export")]);
        let engine = AccessDecisionEngine::builder()
            .clock(clock())
            .registry(registry)
            .subscriptions(Arc::new(store))
            .build()
            .unwrap();
        let decision = engine.evaluate(Some("alice"), "export", &RequestContext::default()).await;
        assert!(decision.allowed);
        assert_eq!(decision.reason, ReasonCode::Granted);
    }

    #[tokio::test]
    async fn subscription_limit_overrides_catalog_limit() {
        let registry = FeatureRegistry::new([
            FeatureDescriptor::new("export", Tier::Basic).with_usage_limit(Tier::Basic, 100),
        ])
        .unwrap();
        let store = InMemorySubscriptionStore::with_records([
            SubscriptionRecord::new("alice", Tier::Basic, SubscriptionStatus::Active)
                .with_limit("export", 1),
        ]);
        let engine = AccessDecisionEngine::builder()
            .clock(clock())
            .registry(registry)
            .subscriptions(Arc::new(store))
            .build()
            .unwrap();
        let ctx = RequestContext::default();
        assert!(engine.evaluate(Some("alice"), "export", &ctx).await.allowed);
        let second = engine.evaluate(Some("alice"), "export", &ctx).await;
        assert_eq!(second.reason, ReasonCode::UsageLimitExceeded);
        assert_eq!(second.usage_limit, Some(1));
    }

    #[test]
    fn upgrade_suggestions_only_list_better_allowances() {
        let feature = FeatureDescriptor::new("export", Tier::Basic)
            .with_usage_limit(Tier::Basic, 10)
            .with_usage_limit(Tier::Premium, 10)
            .with_usage_limit(Tier::Enterprise, -1);
        assert_eq!(
            usage_upgrades(&feature, Tier::Basic, UsageLimit::Max(10)),
            vec![Tier::Enterprise]
        );
        assert!(usage_upgrades(&feature, Tier::Enterprise, UsageLimit::Unlimited).is_empty());
    }
}
