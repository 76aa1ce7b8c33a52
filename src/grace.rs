//! Time-bounded access after a subscription lapses.
//!
//! A window can come from an explicit grant (per principal, or per principal
//! and feature) or from the subscription record's own `grace_period_end`.
//! Expired grants are deleted the next time they are read.

use crate::clock::{Clock, SystemClock};
use crate::subscription::SubscriptionRecord;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Result of a grace lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GraceStatus {
    pub in_grace: bool,
    pub ends_at: Option<DateTime<Utc>>,
    /// Whole days left, rounded up.
    pub remaining_days: Option<u32>,
}

impl GraceStatus {
    fn open(ends_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            in_grace: true,
            ends_at: Some(ends_at),
            remaining_days: Some(remaining_days(ends_at, now)),
        }
    }
}

fn remaining_days(ends_at: DateTime<Utc>, now: DateTime<Utc>) -> u32 {
    const DAY_SECS: i64 = 86_400;
    let secs = (ends_at - now).num_seconds().max(1);
    u32::try_from((secs + DAY_SECS - 1) / DAY_SECS).unwrap_or(u32::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GraceKey {
    principal: String,
    feature: Option<String>,
}

impl GraceKey {
    fn new(principal: &str, feature: Option<&str>) -> Self {
        Self { principal: principal.to_string(), feature: feature.map(str::to_string) }
    }
}

/// Tracks grace windows. Clones share the same grants.
#[derive(Debug, Clone)]
pub struct GracePeriodManager {
    grants: Arc<Mutex<HashMap<GraceKey, DateTime<Utc>>>>,
    clock: Arc<dyn Clock>,
}

impl Default for GracePeriodManager {
    fn default() -> Self {
        Self::new()
    }
}

impl GracePeriodManager {
    pub fn new() -> Self {
        Self { grants: Arc::new(Mutex::new(HashMap::new())), clock: Arc::new(SystemClock) }
    }

    /// Measure windows against `clock`.
    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        self.with_shared_clock(Arc::new(clock))
    }

    pub fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn grants(&self) -> MutexGuard<'_, HashMap<GraceKey, DateTime<Utc>>> {
        self.grants.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open (or move) a window for `principal` ending at `ends_at`.
    /// With `feature` set, the window only covers that feature.
    pub fn grant(&self, principal: &str, feature: Option<&str>, ends_at: DateTime<Utc>) {
        tracing::info!(
            target: "tollgate::grace",
            principal,
            feature,
            %ends_at,
            "grace period granted"
        );
        self.grants().insert(GraceKey::new(principal, feature), ends_at);
    }

    /// Open a window of `days` starting now. Returns its end.
    pub fn grant_days(&self, principal: &str, feature: Option<&str>, days: u32) -> DateTime<Utc> {
        let now = self.clock.now();
        let ends_at = now
            .checked_add_signed(ChronoDuration::days(i64::from(days)))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.grant(principal, feature, ends_at);
        ends_at
    }

    /// Close a window early. Returns whether one existed.
    pub fn revoke(&self, principal: &str, feature: Option<&str>) -> bool {
        self.grants().remove(&GraceKey::new(principal, feature)).is_some()
    }

    /// Whether `principal` may use `feature` under a grace window right now.
    ///
    /// Feature-scoped grants, principal-wide grants and the record's
    /// `grace_period_end` are all considered; the latest open window wins.
    pub fn check(
        &self,
        principal: &str,
        feature: &str,
        subscription: Option<&SubscriptionRecord>,
    ) -> GraceStatus {
        let now = self.clock.now();
        let mut best: Option<DateTime<Utc>> =
            subscription.and_then(|s| s.grace_period_end).filter(|end| now < *end);

        let keys = [GraceKey::new(principal, Some(feature)), GraceKey::new(principal, None)];
        let mut grants = self.grants();
        for key in keys {
            match grants.get(&key).copied() {
                Some(end) if now < end => best = best.max(Some(end)),
                Some(_) => {
                    grants.remove(&key);
                    tracing::debug!(
                        target: "tollgate::grace",
                        principal,
                        "expired grace grant removed"
                    );
                }
                None => {}
            }
        }
        drop(grants);

        best.map_or_else(GraceStatus::default, |end| GraceStatus::open(end, now))
    }

    /// Grants not yet read past their end. Expired grants that were never
    /// consulted are still counted.
    pub fn active_count(&self) -> usize {
        self.grants().len()
    }
}
