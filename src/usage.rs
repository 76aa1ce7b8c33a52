//! Per-principal, per-feature usage counters over calendar periods.
//!
//! Counters are keyed by period label (`2026-10-18`, `2026-10`), so a new day
//! or month starts from zero without any reset job.
//!
//! A grant on a limited feature is charged at decision time through
//! [`UsageStore::try_increment`], which checks and consumes the allowance in
//! one atomic step. Grants on unlimited features are charged by the
//! background [`UsageRecorder`]. An invocation later reported as failed is
//! refunded, so only successful, authorized invocations stay counted.

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::keys::scoped_key;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

/// Records kept by [`InMemoryUsageStore`] unless configured otherwise.
pub const DEFAULT_LOG_CAPACITY: usize = 10_000;

// Writes between sweeps of expired counters in the in-memory store.
const SWEEP_INTERVAL: u64 = 1_024;

/// Calendar window a usage allowance applies to (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsagePeriod {
    Daily,
    #[default]
    Monthly,
}

impl UsagePeriod {
    pub const ALL: [UsagePeriod; 2] = [UsagePeriod::Daily, UsagePeriod::Monthly];

    /// Label of the period containing `at`.
    pub fn label(self, at: DateTime<Utc>) -> String {
        match self {
            UsagePeriod::Daily => at.format("%Y-%m-%d").to_string(),
            UsagePeriod::Monthly => at.format("%Y-%m").to_string(),
        }
    }

    /// Start of the period after the one containing `at`.
    pub fn next_reset(self, at: DateTime<Utc>) -> DateTime<Utc> {
        let date = at.date_naive();
        let next = match self {
            UsagePeriod::Daily => date.succ_opt(),
            UsagePeriod::Monthly => {
                let (year, month) = if date.month() == 12 {
                    (date.year() + 1, 1)
                } else {
                    (date.year(), date.month() + 1)
                };
                NaiveDate::from_ymd_opt(year, month, 1)
            }
        };
        next.and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| Utc.from_utc_datetime(&naive))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Resolved allowance for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageLimit {
    Unlimited,
    Max(u64),
}

impl UsageLimit {
    /// Interpret a catalog value: any negative number means unlimited.
    pub fn from_raw(raw: i64) -> Self {
        u64::try_from(raw).map_or(UsageLimit::Unlimited, UsageLimit::Max)
    }

    /// Whether `current` uses leave nothing for another call.
    pub fn is_exhausted_by(self, current: u64) -> bool {
        match self {
            UsageLimit::Unlimited => false,
            UsageLimit::Max(max) => current >= max,
        }
    }

    /// Whether this allowance admits more calls than `other`.
    pub fn is_more_generous_than(self, other: UsageLimit) -> bool {
        match (self, other) {
            (UsageLimit::Unlimited, UsageLimit::Max(_)) => true,
            (UsageLimit::Max(a), UsageLimit::Max(b)) => a > b,
            (_, UsageLimit::Unlimited) => false,
        }
    }
}

/// One invocation outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub principal: String,
    pub feature: String,
    /// When the invocation was granted; refunds land in this instant's period.
    pub timestamp: DateTime<Utc>,
    pub success: bool,
}

/// Counter state after a conditional increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageState {
    /// Whether the call fit under the limit and was counted.
    pub allowed: bool,
    /// Counter value after the call.
    pub count: u64,
}

/// Counter storage.
///
/// `try_increment`, `increment` and `decrement` must be atomic per key.
/// `expires_at` is the end of the counter's period; a store may drop the key
/// after it (a distributed backend would set it as the key's expiry).
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Add one to `key` unless it already holds `limit` or more.
    async fn try_increment(
        &self,
        key: &str,
        limit: u64,
        expires_at: DateTime<Utc>,
    ) -> Result<UsageState, StoreError>;

    /// Add one to `key`, returning the new value.
    async fn increment(&self, key: &str, expires_at: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Take one from `key`, never going below zero. Returns the new value.
    async fn decrement(&self, key: &str) -> Result<u64, StoreError>;

    /// Current value of `key`; missing keys read as zero.
    async fn get(&self, key: &str) -> Result<u64, StoreError>;

    /// Append a raw record to the usage log, if the store keeps one.
    async fn append(&self, _record: &UsageRecord) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    value: u64,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Counters {
    entries: HashMap<String, Counter>,
    writes: u64,
}

impl Counters {
    fn purge(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, c| c.expires_at > now);
        before - self.entries.len()
    }

    /// Entry for a write, sweeping expired counters every `SWEEP_INTERVAL` writes.
    fn entry_for_write(
        &mut self,
        key: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> &mut Counter {
        self.writes += 1;
        if self.writes % SWEEP_INTERVAL == 0 {
            self.purge(now);
        }
        let counter = self
            .entries
            .entry(key.to_string())
            .or_insert(Counter { value: 0, expires_at });
        counter.expires_at = counter.expires_at.max(expires_at);
        counter
    }
}

/// In-process store; the mutex makes every counter update atomic.
///
/// Counters past their period end are swept as writes come in, or on demand
/// with [`purge_expired`](Self::purge_expired). The record log keeps the
/// newest [`DEFAULT_LOG_CAPACITY`] records; a capacity of zero disables it.
#[derive(Debug, Clone)]
pub struct InMemoryUsageStore {
    counters: Arc<Mutex<Counters>>,
    log: Arc<Mutex<VecDeque<UsageRecord>>>,
    log_capacity: usize,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryUsageStore {
    fn default() -> Self {
        Self {
            counters: Arc::default(),
            log: Arc::default(),
            log_capacity: DEFAULT_LOG_CAPACITY,
            clock: Arc::new(SystemClock),
        }
    }
}

impl InMemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock used to decide which counters have expired.
    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        self.with_shared_clock(Arc::new(clock))
    }

    pub fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Keep at most `capacity` records, dropping the oldest first.
    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    /// Overwrite the counter for `principal` on `feature` in the period
    /// containing `at`, e.g. to seed a scenario.
    pub fn set_usage(
        &self,
        principal: &str,
        feature: &str,
        period: UsagePeriod,
        at: DateTime<Utc>,
        value: u64,
    ) -> Result<(), StoreError> {
        let key = counter_key(principal, feature, period, at);
        let counter = Counter { value, expires_at: period.next_reset(at) };
        self.lock_counters()?.entries.insert(key, counter);
        Ok(())
    }

    /// Drop counters whose period has ended. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        Ok(self.lock_counters()?.purge(now))
    }

    /// Number of counters currently held, expired or not.
    pub fn tracked_keys(&self) -> Result<usize, StoreError> {
        Ok(self.lock_counters()?.entries.len())
    }

    /// Retained records, oldest first.
    pub fn records(&self) -> Result<Vec<UsageRecord>, StoreError> {
        let log = self.log.lock().map_err(|_| StoreError::poisoned("usage log"))?;
        Ok(log.iter().cloned().collect())
    }

    fn lock_counters(&self) -> Result<std::sync::MutexGuard<'_, Counters>, StoreError> {
        self.counters.lock().map_err(|_| StoreError::poisoned("usage"))
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn try_increment(
        &self,
        key: &str,
        limit: u64,
        expires_at: DateTime<Utc>,
    ) -> Result<UsageState, StoreError> {
        let now = self.clock.now();
        let mut guard = self.lock_counters()?;
        let counter = guard.entry_for_write(key, expires_at, now);
        let allowed = counter.value < limit;
        if allowed {
            counter.value += 1;
        }
        Ok(UsageState { allowed, count: counter.value })
    }

    async fn increment(&self, key: &str, expires_at: DateTime<Utc>) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let mut guard = self.lock_counters()?;
        let counter = guard.entry_for_write(key, expires_at, now);
        counter.value += 1;
        Ok(counter.value)
    }

    async fn decrement(&self, key: &str) -> Result<u64, StoreError> {
        let mut guard = self.lock_counters()?;
        Ok(guard.entries.get_mut(key).map_or(0, |c| {
            c.value = c.value.saturating_sub(1);
            c.value
        }))
    }

    async fn get(&self, key: &str) -> Result<u64, StoreError> {
        let guard = self.lock_counters()?;
        Ok(guard.entries.get(key).map_or(0, |c| c.value))
    }

    async fn append(&self, record: &UsageRecord) -> Result<(), StoreError> {
        if self.log_capacity == 0 {
            return Ok(());
        }
        let mut log = self.log.lock().map_err(|_| StoreError::poisoned("usage log"))?;
        while log.len() >= self.log_capacity {
            log.pop_front();
        }
        log.push_back(record.clone());
        Ok(())
    }
}

/// Counter key for a principal/feature in the period containing `at`.
pub fn counter_key(
    principal: &str,
    feature: &str,
    period: UsagePeriod,
    at: DateTime<Utc>,
) -> String {
    let prefix = match period {
        UsagePeriod::Daily => "d",
        UsagePeriod::Monthly => "m",
    };
    scoped_key("usage", &[principal, feature, prefix, &period.label(at)])
}

/// Daily and monthly counters over a [`UsageStore`].
#[derive(Clone)]
pub struct UsageCounter {
    store: Arc<dyn UsageStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for UsageCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageCounter").field("clock", &self.clock).finish_non_exhaustive()
    }
}

impl UsageCounter {
    /// Counter over `store`, bucketing periods by `clock`.
    pub fn new(store: Arc<dyn UsageStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Count one invocation now, in both the daily and monthly windows.
    pub async fn increment(&self, principal: &str, feature: &str) -> Result<(), StoreError> {
        self.increment_at(principal, feature, self.clock.now()).await
    }

    /// Usage so far in the current `period`.
    pub async fn current(
        &self,
        principal: &str,
        feature: &str,
        period: UsagePeriod,
    ) -> Result<u64, StoreError> {
        self.store.get(&counter_key(principal, feature, period, self.clock.now())).await
    }

    /// Count one invocation now if `period` usage is still below `max`.
    ///
    /// The limiting counter is checked and bumped atomically, so concurrent
    /// callers can never push it past `max`. The other period's counter is
    /// bumped afterwards; if that fails the charge is handed back.
    pub async fn try_consume(
        &self,
        principal: &str,
        feature: &str,
        period: UsagePeriod,
        max: u64,
    ) -> Result<UsageState, StoreError> {
        let now = self.clock.now();
        let key = counter_key(principal, feature, period, now);
        let state = self.store.try_increment(&key, max, period.next_reset(now)).await?;
        if !state.allowed {
            return Ok(state);
        }
        for other in UsagePeriod::ALL.into_iter().filter(|p| *p != period) {
            let other_key = counter_key(principal, feature, other, now);
            if let Err(e) = self.store.increment(&other_key, other.next_reset(now)).await {
                if let Err(undo) = self.store.decrement(&key).await {
                    tracing::error!(
                        target: "tollgate::usage",
                        principal,
                        feature,
                        error = %undo,
                        "could not hand back usage charge"
                    );
                }
                return Err(e);
            }
        }
        Ok(state)
    }

    /// Log a record. A failed invocation is refunded in the period of the
    /// record's own timestamp, not the time it is applied.
    pub async fn record(&self, record: &UsageRecord) -> Result<(), StoreError> {
        self.store.append(record).await?;
        if !record.success {
            self.release_at(&record.principal, &record.feature, record.timestamp).await?;
        }
        Ok(())
    }

    async fn increment_at(
        &self,
        principal: &str,
        feature: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        for period in UsagePeriod::ALL {
            let key = counter_key(principal, feature, period, at);
            self.store.increment(&key, period.next_reset(at)).await?;
        }
        Ok(())
    }

    async fn release_at(
        &self,
        principal: &str,
        feature: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        for period in UsagePeriod::ALL {
            self.store.decrement(&counter_key(principal, feature, period, at)).await?;
        }
        Ok(())
    }
}

enum RecorderMessage {
    Charge { principal: String, feature: String, at: DateTime<Utc> },
    Record(UsageRecord),
    Flush(oneshot::Sender<()>),
}

impl std::fmt::Debug for RecorderMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecorderMessage::Charge { principal, feature, at } => f
                .debug_struct("Charge")
                .field("principal", principal)
                .field("feature", feature)
                .field("at", at)
                .finish(),
            RecorderMessage::Record(r) => f.debug_tuple("Record").field(r).finish(),
            RecorderMessage::Flush(_) => f.write_str("Flush"),
        }
    }
}

/// Applies usage charges and outcome records off the request path.
///
/// Messages go through a bounded queue drained by one background task, in
/// order, so a refund is never applied before the charge it undoes. When the
/// queue is full the message is dropped and counted. Must be created inside a
/// tokio runtime.
#[derive(Debug, Clone)]
pub struct UsageRecorder {
    tx: mpsc::Sender<RecorderMessage>,
    dropped: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl UsageRecorder {
    /// Start the worker with room for `capacity` pending messages.
    pub fn spawn(counter: UsageCounter, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        let failed = Arc::new(AtomicU64::new(0));
        let failed_worker = failed.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let (principal, feature, result) = match message {
                    RecorderMessage::Charge { principal, feature, at } => {
                        let result = counter.increment_at(&principal, &feature, at).await;
                        (principal, feature, result)
                    }
                    RecorderMessage::Record(record) => {
                        let result = counter.record(&record).await;
                        (record.principal, record.feature, result)
                    }
                    RecorderMessage::Flush(ack) => {
                        let _ = ack.send(());
                        continue;
                    }
                };
                if let Err(e) = result {
                    failed_worker.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        target: "tollgate::usage",
                        principal = %principal,
                        feature = %feature,
                        error = %e,
                        "failed to apply usage update"
                    );
                }
            }
        });
        Self { tx, dropped: Arc::new(AtomicU64::new(0)), failed }
    }

    /// Queue one counted invocation at `at` without waiting.
    /// Returns `false` if it was dropped.
    pub fn charge(&self, principal: &str, feature: &str, at: DateTime<Utc>) -> bool {
        self.enqueue(RecorderMessage::Charge {
            principal: principal.to_string(),
            feature: feature.to_string(),
            at,
        })
    }

    /// Queue an outcome record without waiting. Returns `false` if it was dropped.
    pub fn submit(&self, record: UsageRecord) -> bool {
        self.enqueue(RecorderMessage::Record(record))
    }

    /// Wait until every message queued before this call has been applied.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(RecorderMessage::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Messages discarded because the queue was full or the worker stopped.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Messages the worker could not apply because the store failed.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    fn enqueue(&self, message: RecorderMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(target: "tollgate::usage", error = %e, "usage update dropped");
                false
            }
        }
    }
}
