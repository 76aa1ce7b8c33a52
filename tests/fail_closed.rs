mod common;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::test_helpers::{catalog, start, DownSubscriptionStore, Fixture, LogCapture};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tollgate::security::SecuritySink;
use tollgate::{
    AccessDecisionEngine, AuditEntry, FeatureRegistry, GateConfig, InMemorySubscriptionStore,
    InMemoryUsageStore, ManualClock, ReasonCode, RequestContext, SecurityEventKind,
    SecurityMonitor, Severity, StoreError, SubscriptionRecord, SubscriptionStatus, Tier,
    UsagePeriod, UsageRecord, UsageState, UsageStore, WindowState, WindowStore,
};

struct DownWindowStore;

#[async_trait]
impl WindowStore for DownWindowStore {
    async fn try_acquire(
        &self,
        _: &str,
        _: u64,
        _: u64,
        _: u32,
    ) -> Result<WindowState, StoreError> {
        Err(StoreError::Timeout(std::time::Duration::from_millis(50)))
    }

    async fn reset(&self, _: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

fn usage_down() -> StoreError {
    StoreError::Unavailable("usage cluster unreachable".into())
}

struct DownUsageStore;

#[async_trait]
impl UsageStore for DownUsageStore {
    async fn try_increment(
        &self,
        _: &str,
        _: u64,
        _: DateTime<Utc>,
    ) -> Result<UsageState, StoreError> {
        Err(usage_down())
    }

    async fn increment(&self, _key: &str, _: DateTime<Utc>) -> Result<u64, StoreError> {
        Err(usage_down())
    }

    async fn decrement(&self, _key: &str) -> Result<u64, StoreError> {
        Err(usage_down())
    }

    async fn get(&self, _key: &str) -> Result<u64, StoreError> {
        Err(usage_down())
    }

    async fn append(&self, _record: &UsageRecord) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Conditional increments work; plain increments do not.
struct HalfDownUsageStore(InMemoryUsageStore);

#[async_trait]
impl UsageStore for HalfDownUsageStore {
    async fn try_increment(
        &self,
        key: &str,
        limit: u64,
        expires_at: DateTime<Utc>,
    ) -> Result<UsageState, StoreError> {
        self.0.try_increment(key, limit, expires_at).await
    }

    async fn increment(&self, _key: &str, _: DateTime<Utc>) -> Result<u64, StoreError> {
        Err(usage_down())
    }

    async fn decrement(&self, key: &str) -> Result<u64, StoreError> {
        self.0.decrement(key).await
    }

    async fn get(&self, key: &str) -> Result<u64, StoreError> {
        self.0.get(key).await
    }
}

/// Sink that takes its time with every entry.
#[derive(Clone)]
struct SlowSink;

impl tower::Service<AuditEntry> for SlowSink {
    type Response = ();
    type Error = std::convert::Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _entry: AuditEntry) -> Self::Future {
        Box::pin(async {
            tokio::time::sleep(Duration::from_millis(400)).await;
            Ok(())
        })
    }
}

impl SecuritySink for SlowSink {
    type SinkError = std::convert::Infallible;
}

/// Sink whose every delivery fails.
#[derive(Clone)]
struct BrokenSink;

#[derive(Debug, thiserror::Error)]
#[error("audit pipeline offline")]
struct BrokenSinkError;

impl tower::Service<AuditEntry> for BrokenSink {
    type Response = ();
    type Error = BrokenSinkError;
    type Future = Pin<Box<dyn Future<Output = Result<(), BrokenSinkError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _entry: AuditEntry) -> Self::Future {
        Box::pin(async { Err(BrokenSinkError) })
    }
}

impl SecuritySink for BrokenSink {
    type SinkError = BrokenSinkError;
}

fn premium(principal: &str) -> SubscriptionRecord {
    SubscriptionRecord::new(principal, Tier::Premium, SubscriptionStatus::Active)
}

#[tokio::test]
async fn subscription_store_failure_denies_with_system_error() {
    let logs = LogCapture::start();
    let fx = Fixture::with_store(
        Arc::new(DownSubscriptionStore),
        InMemorySubscriptionStore::new(),
        GateConfig::default(),
    );

    let decision = fx.evaluate("alice", "ai_insights").await;

    assert!(!decision.allowed);
    assert_eq!(decision.reason, ReasonCode::SystemError);

    let events = fx.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, SecurityEventKind::SubscriptionServiceFailure);
    assert_eq!(events[0].severity, Severity::Critical);

    // Internal detail goes to logs and the audit trail, never to the caller.
    let json = serde_json::to_string(&decision).unwrap();
    assert!(!json.contains("db-primary"));
    assert!(events[0].details["error"].contains("db-primary"));
    assert!(logs.contents().contains("subscription lookup failed"));
}

#[tokio::test]
async fn failed_loads_are_retried_on_the_next_request() {
    let fx = Fixture::with_store(
        Arc::new(DownSubscriptionStore),
        InMemorySubscriptionStore::new(),
        GateConfig::default(),
    );
    let ctx = RequestContext::default();
    for _ in 0..3 {
        assert_eq!(fx.reason("alice", "ai_insights", &ctx).await, ReasonCode::SystemError);
    }
    // Nothing cached, so every request went back to the store.
    assert_eq!(fx.engine.cache().stats().loads, 3);
    assert!(fx.engine.cache().is_empty());

    // Three failures inside a minute cross the default alert threshold.
    let alerts = fx.engine.monitor().alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, SecurityEventKind::SubscriptionServiceFailure);
    assert_eq!(alerts[0].affected_principals, vec!["alice"]);
}

#[tokio::test]
async fn rate_limiter_failure_denies_with_backoff() {
    let clock = ManualClock::at(start());
    let monitor = Arc::new(SecurityMonitor::default().with_clock(clock.clone()));
    let engine = AccessDecisionEngine::builder()
        .clock(clock)
        .registry(FeatureRegistry::new(catalog()).unwrap())
        .subscriptions(Arc::new(InMemorySubscriptionStore::with_records([premium("alice")])))
        .window_store(Arc::new(DownWindowStore))
        .monitor(monitor.clone())
        .build()
        .unwrap();

    let decision = engine.evaluate(Some("alice"), "export", &RequestContext::default()).await;

    assert!(!decision.allowed);
    assert_eq!(decision.reason, ReasonCode::SystemError);
    assert_eq!(decision.retry_after_secs, Some(300));

    let events = monitor.recent_events();
    assert_eq!(events.len(), 1, "the limiter reports the failure; the engine adds nothing");
    assert_eq!(events[0].kind, SecurityEventKind::RateLimiterFailure);
    assert_eq!(events[0].severity, Severity::Critical);

    // Features without a rate limit never touch the window store.
    let ctx = RequestContext::default();
    assert!(engine.evaluate(Some("alice"), "ai_insights", &ctx).await.allowed);
}

#[tokio::test]
async fn usage_store_failure_denies_limited_features_only() {
    let clock = ManualClock::at(start());
    let monitor = Arc::new(SecurityMonitor::default().with_clock(clock.clone()));
    let engine = AccessDecisionEngine::builder()
        .clock(clock)
        .registry(FeatureRegistry::new(catalog()).unwrap())
        .subscriptions(Arc::new(InMemorySubscriptionStore::with_records([
            premium("alice"),
            SubscriptionRecord::new("corp", Tier::Enterprise, SubscriptionStatus::Active),
        ])))
        .usage_store(Arc::new(DownUsageStore))
        .monitor(monitor.clone())
        .build()
        .unwrap();
    let ctx = RequestContext::default();

    let limited = engine.evaluate(Some("alice"), "ai_insights", &ctx).await;
    assert_eq!(limited.reason, ReasonCode::SystemError);
    assert_eq!(monitor.count_recent(SecurityEventKind::UsageStoreFailure, 60), 1);

    // Unlimited tiers never read the counter. The background increment
    // fails quietly and is counted.
    let unlimited = engine.evaluate(Some("corp"), "ai_insights", &ctx).await;
    assert!(unlimited.allowed);
    engine.flush_usage().await;
    assert_eq!(engine.usage_recorder().failed(), 1);
}

#[tokio::test]
async fn broken_audit_sink_does_not_change_decisions() {
    let clock = ManualClock::at(start());
    let monitor =
        Arc::new(SecurityMonitor::default().with_clock(clock.clone()).with_sink(BrokenSink));
    let engine = AccessDecisionEngine::builder()
        .clock(clock)
        .registry(FeatureRegistry::new(catalog()).unwrap())
        .subscriptions(Arc::new(InMemorySubscriptionStore::with_records([premium("alice")])))
        .monitor(monitor.clone())
        .build()
        .unwrap();
    let ctx = RequestContext::default();

    assert!(engine.evaluate(Some("alice"), "ai_insights", &ctx).await.allowed);
    let excluded = engine.evaluate(Some("alice"), "beta_dashboard", &ctx).await;
    assert_eq!(excluded.reason, ReasonCode::NotInRollout);
    // The monitor still keeps its own history.
    assert_eq!(monitor.recent_events().len(), 2);
}

#[tokio::test]
async fn engine_evaluations_never_panic_on_concurrent_failures() {
    let fx = Arc::new(Fixture::with_store(
        Arc::new(DownSubscriptionStore),
        InMemorySubscriptionStore::new(),
        GateConfig::default(),
    ));
    let results = futures::future::join_all((0..16).map(|i| {
        let fx = fx.clone();
        async move {
            let principal = format!("user-{}", i % 4);
            fx.engine.evaluate(Some(&principal), "ai_insights", &RequestContext::default()).await
        }
    }))
    .await;
    assert!(results.iter().all(|d| !d.allowed && d.reason == ReasonCode::SystemError));
    assert_eq!(fx.events_of(SecurityEventKind::SubscriptionServiceFailure).len(), 16);
}

#[tokio::test]
async fn partial_usage_write_hands_the_charge_back() {
    let clock = ManualClock::at(start());
    let counters = InMemoryUsageStore::new().with_clock(clock.clone());
    let engine = AccessDecisionEngine::builder()
        .clock(clock)
        .registry(FeatureRegistry::new(catalog()).unwrap())
        .subscriptions(Arc::new(InMemorySubscriptionStore::with_records([premium("alice")])))
        .usage_store(Arc::new(HalfDownUsageStore(counters.clone())))
        .build()
        .unwrap();

    let decision = engine.evaluate(Some("alice"), "ai_insights", &RequestContext::default()).await;

    assert_eq!(decision.reason, ReasonCode::SystemError);
    let used = engine.usage().current("alice", "ai_insights", UsagePeriod::Monthly).await;
    assert_eq!(used.unwrap(), 0);
    assert_eq!(engine.monitor().count_recent(SecurityEventKind::UsageStoreFailure, 60), 1);
}

#[tokio::test]
async fn slow_audit_sink_does_not_delay_decisions() {
    let clock = ManualClock::at(start());
    let monitor =
        Arc::new(SecurityMonitor::default().with_clock(clock.clone()).with_sink(SlowSink));
    let engine = AccessDecisionEngine::builder()
        .clock(clock)
        .registry(FeatureRegistry::new(catalog()).unwrap())
        .subscriptions(Arc::new(InMemorySubscriptionStore::with_records([premium("alice")])))
        .monitor(monitor.clone())
        .build()
        .unwrap();
    let ctx = RequestContext::default();

    let started = Instant::now();
    for _ in 0..3 {
        engine.evaluate(Some("mallory"), "ai_insights", &ctx).await;
    }
    assert!(engine.evaluate(Some("alice"), "ai_insights", &ctx).await.allowed);
    assert!(started.elapsed() < Duration::from_millis(400), "took {:?}", started.elapsed());
    assert_eq!(monitor.dropped_entries(), 0);
}
