use super::events::{Alert, AuditEntry, SecurityEvent, SecurityEventKind, Severity};
use super::sinks::{boxed, emit_best_effort, BoxedSink, LogSink, SecuritySink};
use crate::clock::{Clock, SystemClock};
use crate::error::ConfigError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Number of events copied into an alert's `recent_events`.
const ALERT_SAMPLE: usize = 10;

const BURST_WINDOW_SECS: i64 = 60;
const BURST_THRESHOLD: usize = 30;
const ANALYSIS_WINDOW_SECS: i64 = 3_600;
const DISTINCT_IP_THRESHOLD: usize = 3;
const AUTH_FAILURE_THRESHOLD: usize = 5;
const RATE_LIMIT_THRESHOLD: usize = 5;

/// Raise an alert when `threshold` events of `kind` land within `window_secs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRule {
    pub kind: SecurityEventKind,
    pub threshold: usize,
    pub window_secs: u64,
    pub severity: Severity,
}

impl AlertRule {
    pub fn new(
        kind: SecurityEventKind,
        threshold: usize,
        window_secs: u64,
        severity: Severity,
    ) -> Self {
        Self { kind, threshold, window_secs, severity }
    }
}

/// Retention and alerting settings for [`SecurityMonitor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Rolling history length; events older than this are pruned.
    pub retention_secs: u64,
    /// Hard cap on retained events, oldest dropped first.
    pub max_events: usize,
    /// Hard cap on retained alerts.
    pub max_alerts: usize,
    /// Entries waiting for the sink; past this they are dropped.
    pub sink_queue_capacity: usize,
    pub alert_rules: Vec<AlertRule>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        use SecurityEventKind as K;
        Self {
            retention_secs: 24 * 60 * 60,
            max_events: 50_000,
            max_alerts: 1_000,
            sink_queue_capacity: 1_024,
            alert_rules: vec![
                AlertRule::new(K::RateLimitExceeded, 10, 300, Severity::High),
                AlertRule::new(K::AuthRequired, 20, 300, Severity::Medium),
                AlertRule::new(K::AccessDenied, 50, 300, Severity::Medium),
                AlertRule::new(K::UsageLimitExceeded, 25, 300, Severity::Medium),
                AlertRule::new(K::FeatureMisconfigured, 1, 300, Severity::High),
                AlertRule::new(K::SubscriptionServiceFailure, 3, 60, Severity::Critical),
                AlertRule::new(K::RateLimiterFailure, 3, 60, Severity::Critical),
                AlertRule::new(K::UsageStoreFailure, 3, 60, Severity::Critical),
                AlertRule::new(K::SuspiciousActivity, 1, 300, Severity::High),
            ],
        }
    }
}

impl MonitorConfig {
    /// Reject zero sizes and alert rules that retention cannot cover.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retention_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "monitor.retention_secs",
                reason: "must be > 0".into(),
            });
        }
        if self.max_events == 0 {
            return Err(ConfigError::Invalid {
                field: "monitor.max_events",
                reason: "must be > 0".into(),
            });
        }
        if self.sink_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "monitor.sink_queue_capacity",
                reason: "must be > 0".into(),
            });
        }
        for rule in &self.alert_rules {
            if rule.threshold == 0 || rule.window_secs == 0 {
                return Err(ConfigError::Invalid {
                    field: "monitor.alert_rules",
                    reason: format!("rule for {} needs threshold and window > 0", rule.kind),
                });
            }
            if rule.window_secs > self.retention_secs {
                return Err(ConfigError::Invalid {
                    field: "monitor.alert_rules",
                    reason: format!("rule for {} has a window longer than retention", rule.kind),
                });
            }
        }
        Ok(())
    }
}

/// Qualitative risk derived from a principal's recent events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// One heuristic that fired during analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum RiskSignal {
    RequestBurst { count: usize, window_secs: u64 },
    MultipleIps { distinct: usize },
    RepeatedAuthFailures { count: usize },
    RepeatedRateLimiting { count: usize },
}

impl RiskSignal {
    /// Short name used in the `signals` detail.
    pub fn name(&self) -> &'static str {
        match self {
            RiskSignal::RequestBurst { .. } => "request_burst",
            RiskSignal::MultipleIps { .. } => "multiple_ips",
            RiskSignal::RepeatedAuthFailures { .. } => "repeated_auth_failures",
            RiskSignal::RepeatedRateLimiting { .. } => "repeated_rate_limiting",
        }
    }
}

/// Result of [`SecurityMonitor::analyze_suspicious_activity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub principal: String,
    pub level: RiskLevel,
    pub signals: Vec<RiskSignal>,
}

#[derive(Default)]
struct MonitorState {
    history: VecDeque<SecurityEvent>,
    alerts: VecDeque<Alert>,
    last_alert: HashMap<SecurityEventKind, DateTime<Utc>>,
}

enum Delivery {
    Entry(AuditEntry),
    Flush(oneshot::Sender<()>),
}

/// Records security events, keeps a rolling history and raises threshold alerts.
///
/// Entries reach the sink through a bounded queue drained by a background
/// task, so [`log_event`](Self::log_event) never waits on the sink. The task
/// starts with the first entry and must run inside a tokio runtime. A full
/// queue drops the entry and counts it; a failing sink never surfaces to the
/// caller.
pub struct SecurityMonitor {
    config: MonitorConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<MonitorState>,
    sink: Mutex<BoxedSink>,
    queue: OnceLock<mpsc::Sender<Delivery>>,
    dropped: AtomicU64,
}

impl std::fmt::Debug for SecurityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityMonitor").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Default for SecurityMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl SecurityMonitor {
    /// Monitor with the system clock and a [`LogSink`].
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            state: Mutex::new(MonitorState::default()),
            sink: Mutex::new(boxed(LogSink)),
            queue: OnceLock::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Timestamp windows and alerts with `clock`.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the audit sink. Delivery is already queued, so even a slow
    /// sink such as a file writer can be passed directly.
    pub fn with_sink<S>(mut self, sink: S) -> Self
    where
        S: SecuritySink,
        S::Future: Send + 'static,
    {
        self.sink = Mutex::new(boxed(sink));
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Record an event, returning the alert it triggered, if any.
    pub async fn log_event(&self, event: SecurityEvent) -> Option<Alert> {
        let alert = self.record(event.clone());
        self.deliver(AuditEntry::Event(event));
        if let Some(alert) = &alert {
            tracing::warn!(
                target: "tollgate::security",
                kind = %alert.kind,
                count = alert.count,
                window_secs = alert.window_secs,
                principals = alert.affected_principals.len(),
                "security alert raised"
            );
            self.deliver(AuditEntry::Alert(alert.clone()));
        }
        alert
    }

    /// Wait until every entry queued before this call has reached the sink.
    pub async fn flush(&self) {
        let Some(tx) = self.queue.get() else {
            return;
        };
        let (ack, done) = oneshot::channel();
        if tx.send(Delivery::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Entries discarded because the sink queue was full or unavailable.
    pub fn dropped_entries(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Events still inside the retention window, oldest first.
    pub fn recent_events(&self) -> Vec<SecurityEvent> {
        let now = self.clock.now();
        let mut state = self.lock_state();
        self.prune(&mut state, now);
        state.history.iter().cloned().collect()
    }

    /// Alerts raised so far, oldest first.
    pub fn alerts(&self) -> Vec<Alert> {
        self.lock_state().alerts.iter().cloned().collect()
    }

    /// Events of `kind` within the trailing `window_secs`.
    pub fn count_recent(&self, kind: SecurityEventKind, window_secs: u64) -> usize {
        let now = self.clock.now();
        let since = window_start(now, window_secs);
        let state = self.lock_state();
        state.history.iter().filter(|e| e.kind == kind && e.timestamp >= since).count()
    }

    /// Heuristic risk level for `principal` from its recent history.
    pub fn analyze_suspicious_activity(&self, principal: &str) -> RiskAssessment {
        let now = self.clock.now();
        let burst_since = now - ChronoDuration::seconds(BURST_WINDOW_SECS);
        let analysis_since = now - ChronoDuration::seconds(ANALYSIS_WINDOW_SECS);

        let mut burst = 0;
        let mut ips = BTreeSet::new();
        let mut auth_failures = 0;
        let mut rate_limited = 0;
        {
            let state = self.lock_state();
            let recent = state
                .history
                .iter()
                .filter(|e| e.timestamp >= analysis_since)
                .filter(|e| e.principal.as_deref() == Some(principal));
            for event in recent {
                if event.timestamp >= burst_since {
                    burst += 1;
                }
                if let Some(ip) = &event.ip {
                    ips.insert(ip.clone());
                }
                match event.kind {
                    SecurityEventKind::AuthRequired => auth_failures += 1,
                    SecurityEventKind::RateLimitExceeded => rate_limited += 1,
                    _ => {}
                }
            }
        }

        let mut signals = Vec::new();
        if burst >= BURST_THRESHOLD {
            signals.push(RiskSignal::RequestBurst {
                count: burst,
                window_secs: BURST_WINDOW_SECS as u64,
            });
        }
        if ips.len() >= DISTINCT_IP_THRESHOLD {
            signals.push(RiskSignal::MultipleIps { distinct: ips.len() });
        }
        if auth_failures >= AUTH_FAILURE_THRESHOLD {
            signals.push(RiskSignal::RepeatedAuthFailures { count: auth_failures });
        }
        if rate_limited >= RATE_LIMIT_THRESHOLD {
            signals.push(RiskSignal::RepeatedRateLimiting { count: rate_limited });
        }

        let level = match signals.len() {
            0 => RiskLevel::Low,
            1 => RiskLevel::Medium,
            _ => RiskLevel::High,
        };
        RiskAssessment { principal: principal.to_string(), level, signals }
    }

    /// Analyze `principal` and, at [`RiskLevel::High`], record a
    /// `SUSPICIOUS_ACTIVITY` event carrying the fired signals.
    pub async fn flag_if_suspicious(&self, principal: &str) -> RiskAssessment {
        let assessment = self.analyze_suspicious_activity(principal);
        if assessment.level == RiskLevel::High {
            let signals: Vec<&str> = assessment.signals.iter().map(RiskSignal::name).collect();
            let kind = SecurityEventKind::SuspiciousActivity;
            let event = SecurityEvent::new(kind, Severity::High, self.clock.now())
                .principal(principal)
                .detail("signals", signals.join(","));
            self.log_event(event).await;
        }
        assessment
    }

    fn record(&self, event: SecurityEvent) -> Option<Alert> {
        let now = self.clock.now();
        let kind = event.kind;
        let mut state = self.lock_state();
        self.prune(&mut state, now);
        state.history.push_back(event);
        while state.history.len() > self.config.max_events {
            state.history.pop_front();
        }

        let rule = self.config.alert_rules.iter().find(|r| r.kind == kind)?;
        let since = window_start(now, rule.window_secs);
        if let Some(last) = state.last_alert.get(&kind) {
            if *last > since {
                return None;
            }
        }

        let matching: Vec<&SecurityEvent> =
            state.history.iter().filter(|e| e.kind == kind && e.timestamp >= since).collect();
        if matching.len() < rule.threshold {
            return None;
        }

        let affected_principals: Vec<String> = matching
            .iter()
            .filter_map(|e| e.principal.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let skip = matching.len().saturating_sub(ALERT_SAMPLE);
        let recent_events: Vec<SecurityEvent> =
            matching.iter().skip(skip).map(|e| (*e).clone()).collect();

        let alert = Alert {
            id: Uuid::new_v4(),
            raised_at: now,
            kind,
            severity: rule.severity,
            count: matching.len(),
            threshold: rule.threshold,
            window_secs: rule.window_secs,
            affected_principals,
            recent_events,
        };
        state.last_alert.insert(kind, now);
        state.alerts.push_back(alert.clone());
        while state.alerts.len() > self.config.max_alerts {
            state.alerts.pop_front();
        }
        Some(alert)
    }

    fn prune(&self, state: &mut MonitorState, now: DateTime<Utc>) {
        let cutoff = window_start(now, self.config.retention_secs);
        while state.history.front().is_some_and(|e| e.timestamp < cutoff) {
            state.history.pop_front();
        }
    }

    fn deliver(&self, entry: AuditEntry) {
        let queued = match self.sink_queue() {
            Some(tx) => tx.try_send(Delivery::Entry(entry)).is_ok(),
            None => false,
        };
        if !queued {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(target: "tollgate::security", "audit entry dropped");
        }
    }

    fn sink_queue(&self) -> Option<&mpsc::Sender<Delivery>> {
        if let Some(tx) = self.queue.get() {
            return Some(tx);
        }
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        Some(self.queue.get_or_init(|| {
            let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner).clone();
            let (tx, mut rx) = mpsc::channel(self.config.sink_queue_capacity.max(1));
            runtime.spawn(async move {
                while let Some(delivery) = rx.recv().await {
                    match delivery {
                        Delivery::Entry(entry) => emit_best_effort(sink.clone(), entry).await,
                        Delivery::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            });
            tx
        }))
    }

    // Monitor state only feeds alerting; a panic elsewhere must not stop access decisions.
    fn lock_state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn window_start(now: DateTime<Utc>, window_secs: u64) -> DateTime<Utc> {
    i64::try_from(window_secs)
        .ok()
        .and_then(ChronoDuration::try_seconds)
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
