//! Subscription records and the store they are read from.
//!
//! Records are written by billing processes outside this crate; everything
//! here only reads them.

use crate::error::StoreError;
use crate::tier::{SubscriptionStatus, Tier};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

/// A principal's subscription as the store reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub principal_id: String,
    pub tier: Tier,
    pub status: SubscriptionStatus,
    /// Features granted regardless of tier (add-ons).
    #[serde(default)]
    pub enabled_features: BTreeSet<String>,
    /// Per-feature usage limits that replace the catalog value. `-1` is unlimited.
    #[serde(default)]
    pub limits: BTreeMap<String, i64>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub grace_period_end: Option<DateTime<Utc>>,
}

impl SubscriptionRecord {
    pub fn new(principal_id: impl Into<String>, tier: Tier, status: SubscriptionStatus) -> Self {
        Self {
            principal_id: principal_id.into(),
            tier,
            status,
            enabled_features: BTreeSet::new(),
            limits: BTreeMap::new(),
            expires_at: None,
            grace_period_end: None,
        }
    }

    /// What a principal without any stored subscription gets.
    pub fn free_default(principal_id: impl Into<String>) -> Self {
        Self::new(principal_id, Tier::Free, SubscriptionStatus::Active)
    }

    /// Grant `feature` as an add-on regardless of tier.
    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.enabled_features.insert(feature.into());
        self
    }

    /// Override the catalog allowance for `feature`.
    pub fn with_limit(mut self, feature: impl Into<String>, limit: i64) -> Self {
        self.limits.insert(feature.into(), limit);
        self
    }

    pub fn with_expiry(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Billing-side grace window ending at `at`.
    pub fn with_grace_end(mut self, at: DateTime<Utc>) -> Self {
        self.grace_period_end = Some(at);
        self
    }

    /// Whether the subscription no longer entitles its tier at `now`.
    ///
    /// `active` with a past `expires_at` counts as lapsed; `cancelled` only
    /// lapses once its paid period runs out.
    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        let past_expiry = self.expires_at.is_some_and(|at| at <= now);
        match self.status {
            SubscriptionStatus::Expired | SubscriptionStatus::GracePeriod => true,
            SubscriptionStatus::Cancelled => self.expires_at.is_none() || past_expiry,
            SubscriptionStatus::Active => past_expiry,
        }
    }
}

/// Durable source of subscription records.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// `Ok(None)` means the principal has no subscription; `Err` means the
    /// store could not answer.
    async fn get(&self, principal_id: &str) -> Result<Option<SubscriptionRecord>, StoreError>;

    /// Bulk read. The default issues one `get` per id and stops at the first error.
    async fn get_many(
        &self,
        principal_ids: &[String],
    ) -> Result<HashMap<String, Option<SubscriptionRecord>>, StoreError> {
        let mut out = HashMap::with_capacity(principal_ids.len());
        for id in principal_ids {
            out.insert(id.clone(), self.get(id).await?);
        }
        Ok(out)
    }
}

#[async_trait]
impl<S: SubscriptionStore + ?Sized> SubscriptionStore for Arc<S> {
    async fn get(&self, principal_id: &str) -> Result<Option<SubscriptionRecord>, StoreError> {
        (**self).get(principal_id).await
    }

    async fn get_many(
        &self,
        principal_ids: &[String],
    ) -> Result<HashMap<String, Option<SubscriptionRecord>>, StoreError> {
        (**self).get_many(principal_ids).await
    }
}

/// In-process store. Clones share the same records.
#[derive(Debug, Default, Clone)]
pub struct InMemorySubscriptionStore {
    records: Arc<Mutex<HashMap<String, SubscriptionRecord>>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with `records`, keyed by principal id.
    pub fn with_records(records: impl IntoIterator<Item = SubscriptionRecord>) -> Self {
        let map = records.into_iter().map(|r| (r.principal_id.clone(), r)).collect();
        Self { records: Arc::new(Mutex::new(map)) }
    }

    /// Insert or replace a record. Returns the previous one.
    pub fn upsert(
        &self,
        record: SubscriptionRecord,
    ) -> Result<Option<SubscriptionRecord>, StoreError> {
        let mut guard = self.records.lock().map_err(|_| StoreError::poisoned("subscriptions"))?;
        Ok(guard.insert(record.principal_id.clone(), record))
    }

    /// Drop a principal's record. Returns it if present.
    pub fn remove(&self, principal_id: &str) -> Result<Option<SubscriptionRecord>, StoreError> {
        let mut guard = self.records.lock().map_err(|_| StoreError::poisoned("subscriptions"))?;
        Ok(guard.remove(principal_id))
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn get(&self, principal_id: &str) -> Result<Option<SubscriptionRecord>, StoreError> {
        let guard = self.records.lock().map_err(|_| StoreError::poisoned("subscriptions"))?;
        Ok(guard.get(principal_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap()
    }

    #[test]
    fn lapse_rules() {
        let active = SubscriptionRecord::new("a", Tier::Premium, SubscriptionStatus::Active);
        assert!(!active.is_lapsed(now()));
        assert!(active.clone().with_expiry(now() - Duration::days(1)).is_lapsed(now()));
        assert!(!active.with_expiry(now() + Duration::days(1)).is_lapsed(now()));

        let cancelled = SubscriptionRecord::new("a", Tier::Premium, SubscriptionStatus::Cancelled);
        assert!(cancelled.is_lapsed(now()));
        assert!(!cancelled.clone().with_expiry(now() + Duration::days(3)).is_lapsed(now()));
        assert!(cancelled.with_expiry(now() - Duration::seconds(1)).is_lapsed(now()));

        let basic = |status| SubscriptionRecord::new("a", Tier::Basic, status);
        assert!(basic(SubscriptionStatus::Expired).is_lapsed(now()));
        assert!(basic(SubscriptionStatus::GracePeriod).is_lapsed(now()));
    }

    #[test]
    fn deserializes_with_optional_fields_missing() {
        let json = r#"{"principal_id":"u1","tier":"premium","status":"grace_period"}"#;
        let record: SubscriptionRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.tier, Tier::Premium);
        assert_eq!(record.status, SubscriptionStatus::GracePeriod);
        assert!(record.enabled_features.is_empty());
        assert!(record.expires_at.is_none());
    }

    #[tokio::test]
    async fn in_memory_store_reads_and_bulk_reads() {
        let store = InMemorySubscriptionStore::with_records([
            SubscriptionRecord::new("u1", Tier::Basic, SubscriptionStatus::Active),
        ]);
        assert_eq!(store.get("u1").await.unwrap().unwrap().tier, Tier::Basic);
        assert!(store.get("nobody").await.unwrap().is_none());

        store
            .upsert(SubscriptionRecord::new("u2", Tier::Enterprise, SubscriptionStatus::Active))
            .unwrap();
        let many = store.get_many(&["u1".into(), "u2".into(), "u3".into()]).await.unwrap();
        assert_eq!(many.len(), 3);
        assert!(many["u3"].is_none());
        assert_eq!(many["u2"].as_ref().unwrap().tier, Tier::Enterprise);
    }
}
