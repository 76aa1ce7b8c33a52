//! Time-bounded cache in front of a [`SubscriptionStore`].
//!
//! - Entries live for a fixed TTL and are never served at or past `expires_at`.
//! - Concurrent misses for one principal share a single store load.
//! - Load errors are returned to the caller. The cache never substitutes a
//!   default record for a failed load.
//! - When full, the entry cached longest ago is evicted.

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::subscription::{SubscriptionRecord, SubscriptionStore};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// One cached subscription. Replaced wholesale, never mutated.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub subscription: Arc<SubscriptionRecord>,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Store calls actually issued; lower than `misses` when loads are shared.
    pub loads: u64,
    pub load_errors: u64,
    pub avg_load_latency: Duration,
    pub entries: usize,
}

impl CacheStats {
    /// Hits over total lookups, or 0 before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    loads: AtomicU64,
    load_errors: AtomicU64,
    load_micros: AtomicU64,
}

type LoadResult = Result<Option<SubscriptionRecord>, StoreError>;
type SharedLoad = Shared<BoxFuture<'static, LoadResult>>;

/// Subscription cache with TTL expiry, bounded size and single-flight loads.
pub struct SubscriptionCache {
    store: Arc<dyn SubscriptionStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<String, CacheEntry>>,
    inflight: Mutex<HashMap<String, SharedLoad>>,
    /// Bumped by every invalidation so loads started earlier are not cached.
    epoch: AtomicU64,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for SubscriptionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionCache")
            .field("ttl", &self.ttl)
            .field("max_entries", &self.max_entries)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SubscriptionCache {
    /// Cache reads from `store`, keeping up to `max_entries` records for `ttl`.
    pub fn new(store: Arc<dyn SubscriptionStore>, ttl: Duration, max_entries: usize) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            ttl,
            max_entries: max_entries.max(1),
            entries: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            epoch: AtomicU64::new(0),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Use `clock` for expiry instead of the system clock.
    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        self.with_shared_clock(Arc::new(clock))
    }

    pub fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// How long a loaded record stays fresh.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fetch a subscription, returning whether it came from the cache.
    ///
    /// A principal the store does not know gets the free default record,
    /// which is cached like any other.
    pub async fn get(
        &self,
        principal_id: &str,
    ) -> Result<(Arc<SubscriptionRecord>, bool), StoreError> {
        let now = self.clock.now();
        {
            let mut entries = lock(&self.entries);
            match entries.get(principal_id).map(|e| (e.is_fresh(now), e.subscription.clone())) {
                Some((true, subscription)) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        target: "tollgate::cache",
                        principal = principal_id,
                        "cache hit"
                    );
                    return Ok((subscription, true));
                }
                Some((false, _)) => {
                    entries.remove(principal_id);
                }
                None => {}
            }
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(target: "tollgate::cache", principal = principal_id, "cache miss");

        let epoch = self.epoch.load(Ordering::SeqCst);
        let load = self.join_or_start_load(principal_id);
        let result = load.clone().await;
        {
            let mut inflight = lock(&self.inflight);
            if inflight.get(principal_id).is_some_and(|current| current.ptr_eq(&load)) {
                inflight.remove(principal_id);
            }
        }

        match result {
            Ok(found) => {
                let record = Arc::new(
                    found.unwrap_or_else(|| SubscriptionRecord::free_default(principal_id)),
                );
                if self.epoch.load(Ordering::SeqCst) == epoch {
                    self.insert(principal_id, record.clone());
                }
                Ok((record, false))
            }
            Err(e) => {
                tracing::warn!(
                    target: "tollgate::cache",
                    principal = principal_id,
                    error = %e,
                    "subscription load failed"
                );
                Err(e)
            }
        }
    }

    /// Fetch many subscriptions; misses are loaded with one bulk store call.
    pub async fn get_batch(
        &self,
        principal_ids: &[String],
    ) -> Result<HashMap<String, Arc<SubscriptionRecord>>, StoreError> {
        let now = self.clock.now();
        let mut out = HashMap::with_capacity(principal_ids.len());
        let mut missing = Vec::new();
        {
            let entries = lock(&self.entries);
            for id in principal_ids {
                match entries.get(id) {
                    Some(entry) if entry.is_fresh(now) => {
                        self.counters.hits.fetch_add(1, Ordering::Relaxed);
                        out.insert(id.clone(), entry.subscription.clone());
                    }
                    _ if !missing.contains(id) => missing.push(id.clone()),
                    _ => {}
                }
            }
        }
        if missing.is_empty() {
            return Ok(out);
        }

        self.counters.misses.fetch_add(missing.len() as u64, Ordering::Relaxed);
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let loaded = self.store.get_many(&missing).await;
        self.counters.load_micros.fetch_add(elapsed_micros(started), Ordering::Relaxed);
        let mut loaded = loaded.map_err(|e| {
            self.counters.load_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                target: "tollgate::cache",
                count = missing.len(),
                error = %e,
                "batch load failed"
            );
            e
        })?;

        let cache_results = self.epoch.load(Ordering::SeqCst) == epoch;
        for id in missing {
            let record = loaded
                .remove(&id)
                .flatten()
                .unwrap_or_else(|| SubscriptionRecord::free_default(id.as_str()));
            let record = Arc::new(record);
            if cache_results {
                self.insert(&id, record.clone());
            }
            out.insert(id, record);
        }
        Ok(out)
    }

    /// Drop one principal's entry. Returns whether one was cached.
    pub fn invalidate(&self, principal_id: &str) -> bool {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        lock(&self.inflight).remove(principal_id);
        let removed = lock(&self.entries).remove(principal_id).is_some();
        tracing::debug!(
            target: "tollgate::cache",
            principal = principal_id,
            removed,
            "invalidated"
        );
        removed
    }

    /// Drop every cached record.
    pub fn invalidate_all(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        lock(&self.inflight).clear();
        let mut entries = lock(&self.entries);
        let count = entries.len();
        entries.clear();
        tracing::info!(target: "tollgate::cache", count, "cache cleared");
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh(now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The current entry for a principal, expired or not.
    pub fn peek(&self, principal_id: &str) -> Option<CacheEntry> {
        lock(&self.entries).get(principal_id).cloned()
    }

    /// Snapshot of hit, miss and load counters.
    pub fn stats(&self) -> CacheStats {
        let loads = self.counters.loads.load(Ordering::Relaxed);
        let micros = self.counters.load_micros.load(Ordering::Relaxed);
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            loads,
            load_errors: self.counters.load_errors.load(Ordering::Relaxed),
            avg_load_latency: if loads == 0 {
                Duration::ZERO
            } else {
                Duration::from_micros(micros / loads)
            },
            entries: self.len(),
        }
    }

    fn join_or_start_load(&self, principal_id: &str) -> SharedLoad {
        let mut inflight = lock(&self.inflight);
        if let Some(existing) = inflight.get(principal_id) {
            return existing.clone();
        }
        let store = self.store.clone();
        let counters = self.counters.clone();
        let id = principal_id.to_string();
        let load = async move {
            counters.loads.fetch_add(1, Ordering::Relaxed);
            let started = Instant::now();
            let result = store.get(&id).await;
            counters.load_micros.fetch_add(elapsed_micros(started), Ordering::Relaxed);
            if result.is_err() {
                counters.load_errors.fetch_add(1, Ordering::Relaxed);
            }
            result
        }
        .boxed()
        .shared();
        inflight.insert(principal_id.to_string(), load.clone());
        load
    }

    fn insert(&self, principal_id: &str, subscription: Arc<SubscriptionRecord>) {
        let cached_at = self.clock.now();
        let expires_at = chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| cached_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut entries = lock(&self.entries);
        if !entries.contains_key(principal_id) && entries.len() >= self.max_entries {
            let oldest = entries.iter().min_by_key(|(_, e)| e.cached_at).map(|(k, _)| k.clone());
            if let Some(key) = oldest {
                entries.remove(&key);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(target: "tollgate::cache", evicted = %key, "cache full");
            }
        }
        let entry = CacheEntry { subscription, cached_at, expires_at };
        entries.insert(principal_id.to_string(), entry);
    }
}

fn elapsed_micros(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX)
}
