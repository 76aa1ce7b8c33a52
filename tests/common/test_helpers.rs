use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::{Arc, Mutex};
use tollgate::security::MemorySink;
use tollgate::{
    AccessDecisionEngine, Decision, FeatureDescriptor, FeatureRegistry, GateConfig,
    InMemorySubscriptionStore, InMemoryUsageStore, ManualClock, MonitorConfig, ReasonCode,
    RequestContext, SecurityEvent, SecurityEventKind, SecurityMonitor, StoreError,
    SubscriptionRecord, SubscriptionStore, Tier, UsagePeriod,
};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;

/// Saturday noon, mid-month.
pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap()
}

pub fn catalog() -> Vec<FeatureDescriptor> {
    vec![
        FeatureDescriptor::new("ai_insights", Tier::Premium)
            .with_usage_limit(Tier::Premium, 5)
            .with_usage_limit(Tier::Enterprise, -1),
        FeatureDescriptor::new("export", Tier::Basic).with_rate_limit(5, 60),
        FeatureDescriptor::new("beta_dashboard", Tier::Free).with_rollout(0),
        FeatureDescriptor::new("labs", Tier::Free).with_required_flag("labs"),
        FeatureDescriptor::new("daily_reports", Tier::Basic)
            .with_usage_limit(Tier::Basic, 2)
            .with_usage_limit(Tier::Premium, 10)
            .with_usage_period(UsagePeriod::Daily),
    ]
}

/// An engine wired to in-memory stores that tests can inspect and drive.
pub struct Fixture {
    pub engine: AccessDecisionEngine,
    pub clock: ManualClock,
    pub subscriptions: InMemorySubscriptionStore,
    pub usage: InMemoryUsageStore,
    pub sink: MemorySink,
}

impl Fixture {
    pub fn empty() -> Self {
        Self::new(Vec::<SubscriptionRecord>::new())
    }

    pub fn new(records: impl IntoIterator<Item = SubscriptionRecord>) -> Self {
        Self::with_config(records, GateConfig::default())
    }

    pub fn with_config(
        records: impl IntoIterator<Item = SubscriptionRecord>,
        config: GateConfig,
    ) -> Self {
        let subscriptions = InMemorySubscriptionStore::with_records(records);
        Self::with_store(Arc::new(subscriptions.clone()), subscriptions, config)
    }

    /// Use `store` for subscription reads; `subscriptions` is kept for seeding.
    pub fn with_store(
        store: Arc<dyn SubscriptionStore>,
        subscriptions: InMemorySubscriptionStore,
        config: GateConfig,
    ) -> Self {
        let clock = ManualClock::at(start());
        let sink = MemorySink::new();
        let usage = InMemoryUsageStore::new().with_clock(clock.clone());
        let monitor = SecurityMonitor::new(MonitorConfig::default())
            .with_clock(clock.clone())
            .with_sink(sink.clone());
        let engine = AccessDecisionEngine::builder()
            .config(config)
            .clock(clock.clone())
            .registry(FeatureRegistry::new(catalog()).unwrap())
            .subscriptions(store)
            .usage_store(Arc::new(usage.clone()))
            .monitor(Arc::new(monitor))
            .build()
            .unwrap();
        Self { engine, clock, subscriptions, usage, sink }
    }

    /// Pretend `principal` already used `feature` `count` times this period.
    pub fn seed_usage(&self, principal: &str, feature: &str, period: UsagePeriod, count: u64) {
        self.usage.set_usage(principal, feature, period, start(), count).unwrap();
    }

    /// Evaluate with a default request context.
    pub async fn evaluate(&self, principal: &str, feature: &str) -> Decision {
        self.engine.evaluate(Some(principal), feature, &RequestContext::default()).await
    }

    pub async fn reason(&self, principal: &str, feature: &str, ctx: &RequestContext) -> ReasonCode {
        self.engine.evaluate(Some(principal), feature, ctx).await.reason
    }

    /// Usage applied so far; call `UsageRecorder::flush` first for queued charges.
    pub async fn used(&self, principal: &str, feature: &str, period: UsagePeriod) -> u64 {
        self.engine.usage().current(principal, feature, period).await.unwrap()
    }

    pub fn events(&self) -> Vec<SecurityEvent> {
        self.engine.monitor().recent_events()
    }

    pub fn events_of(&self, kind: SecurityEventKind) -> Vec<SecurityEvent> {
        self.events().into_iter().filter(|e| e.kind == kind).collect()
    }
}

/// Subscription store that is always down.
#[derive(Debug, Default)]
pub struct DownSubscriptionStore;

#[async_trait]
impl SubscriptionStore for DownSubscriptionStore {
    async fn get(&self, _principal_id: &str) -> Result<Option<SubscriptionRecord>, StoreError> {
        Err(StoreError::Unavailable("connection refused by db-primary:5432".into()))
    }
}

#[derive(Clone)]
struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Captures `tracing` output on the current thread while the guard lives.
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    _guard: tracing::subscriber::DefaultGuard,
}

impl LogCapture {
    pub fn start() -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
            .with_max_level(tracing::Level::DEBUG)
            .with_target(true)
            .with_ansi(false)
            .without_time()
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        Self { buffer, _guard: guard }
    }

    pub fn contents(&self) -> String {
        String::from_utf8(self.buffer.lock().unwrap().clone()).unwrap()
    }
}
