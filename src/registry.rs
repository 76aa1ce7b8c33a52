//! Feature catalog and rollout hashing.
//!
//! The catalog is an immutable snapshot swapped atomically on refresh: readers
//! never see a half-loaded catalog and never block a refresh. The default
//! backend is `ArcSwap`; feature `catalog-rwlock` switches to an `RwLock`.

use crate::error::{ConfigError, StoreError};
use crate::tier::Tier;
use crate::usage::{UsageLimit, UsagePeriod};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

#[cfg(feature = "catalog-rwlock")]
use std::sync::RwLock;

#[cfg(not(feature = "catalog-rwlock"))]
use arc_swap::ArcSwap;

/// Per-feature request rate: at most `limit` calls in any trailing `window_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub limit: u32,
    pub window_secs: u64,
}

/// Everything the engine needs to know about one gated feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureDescriptor {
    pub id: String,
    pub required_tier: Tier,
    /// Allowance per usage period; `-1` means unlimited, a missing tier is unlimited.
    #[serde(default)]
    pub usage_limits_by_tier: BTreeMap<Tier, i64>,
    #[serde(default = "full_rollout")]
    pub rollout_percentage: u8,
    #[serde(default)]
    pub required_flags: BTreeSet<String>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitRule>,
    #[serde(default)]
    pub usage_period: UsagePeriod,
}

fn full_rollout() -> u8 {
    100
}

impl FeatureDescriptor {
    /// Fully rolled-out feature with no limits.
    pub fn new(id: impl Into<String>, required_tier: Tier) -> Self {
        Self {
            id: id.into(),
            required_tier,
            usage_limits_by_tier: BTreeMap::new(),
            rollout_percentage: 100,
            required_flags: BTreeSet::new(),
            rate_limit: None,
            usage_period: UsagePeriod::Monthly,
        }
    }

    /// Allowance for `tier`; `-1` means unlimited.
    pub fn with_usage_limit(mut self, tier: Tier, limit: i64) -> Self {
        self.usage_limits_by_tier.insert(tier, limit);
        self
    }

    /// Expose the feature to `percentage` of principals.
    pub fn with_rollout(mut self, percentage: u8) -> Self {
        self.rollout_percentage = percentage;
        self
    }

    /// Require `flag` to be enabled in [`GateConfig`].
    pub fn with_required_flag(mut self, flag: impl Into<String>) -> Self {
        self.required_flags.insert(flag.into());
        self
    }

    /// Admit at most `limit` requests per principal in `window_secs`.
    pub fn with_rate_limit(mut self, limit: u32, window_secs: u64) -> Self {
        self.rate_limit = Some(RateLimitRule { limit, window_secs });
        self
    }

    /// Period the usage limits count over. Monthly unless set.
    pub fn with_usage_period(mut self, period: UsagePeriod) -> Self {
        self.usage_period = period;
        self
    }

    /// Allowance for `tier` in this feature's usage period.
    pub fn limit_for(&self, tier: Tier) -> UsageLimit {
        self.usage_limits_by_tier
            .get(&tier)
            .map_or(UsageLimit::Unlimited, |raw| UsageLimit::from_raw(*raw))
    }

    /// Check the descriptor's id, rollout, limits and rate rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidFeature { id: self.id.clone(), reason };
        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty".into()));
        }
        if self.rollout_percentage > 100 {
            let rollout = self.rollout_percentage;
            return Err(invalid(format!("rollout_percentage {rollout} exceeds 100")));
        }
        if let Some((tier, limit)) = self.usage_limits_by_tier.iter().find(|(_, l)| **l < -1) {
            return Err(invalid(format!("usage limit {limit} for {tier} is below -1")));
        }
        if let Some(rule) = self.rate_limit {
            if rule.limit == 0 || rule.window_secs == 0 {
                return Err(invalid("rate_limit needs limit and window_secs > 0".into()));
            }
        }
        Ok(())
    }
}

/// Deterministic rollout membership for a principal/feature pair.
///
/// Uses 32-bit FNV-1a over `principal:feature`, so the answer is stable across
/// processes and restarts. `0` always excludes and `100` always includes.
pub fn in_rollout(principal: &str, feature: &str, percentage: u8) -> bool {
    if percentage >= 100 {
        return true;
    }
    if percentage == 0 {
        return false;
    }
    rollout_bucket(principal, feature) < u32::from(percentage)
}

/// Bucket in `0..100` assigned to a principal/feature pair.
pub fn rollout_bucket(principal: &str, feature: &str) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let bytes = principal.bytes().chain(std::iter::once(b':')).chain(feature.bytes());
    let hash = bytes.fold(OFFSET, |acc, b| (acc ^ u32::from(b)).wrapping_mul(PRIME));
    hash % 100
}

/// Supplies feature descriptors at startup and on refresh.
#[async_trait]
pub trait FeatureCatalogSource: Send + Sync {
    async fn load(&self) -> Result<Vec<FeatureDescriptor>, StoreError>;
}

/// Catalog source backed by a fixed list.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog(pub Vec<FeatureDescriptor>);

#[async_trait]
impl FeatureCatalogSource for StaticCatalog {
    async fn load(&self) -> Result<Vec<FeatureDescriptor>, StoreError> {
        Ok(self.0.clone())
    }
}

type Catalog = HashMap<String, Arc<FeatureDescriptor>>;

/// Shared snapshot of the catalog; clones observe the same refreshes.
#[derive(Debug, Clone)]
struct CatalogHandle {
    #[cfg(not(feature = "catalog-rwlock"))]
    inner: Arc<ArcSwap<Catalog>>,
    #[cfg(feature = "catalog-rwlock")]
    inner: Arc<RwLock<Arc<Catalog>>>,
}

impl CatalogHandle {
    fn new(catalog: Catalog) -> Self {
        #[cfg(not(feature = "catalog-rwlock"))]
        {
            Self { inner: Arc::new(ArcSwap::from_pointee(catalog)) }
        }
        #[cfg(feature = "catalog-rwlock")]
        {
            Self { inner: Arc::new(RwLock::new(Arc::new(catalog))) }
        }
    }

    #[cfg(not(feature = "catalog-rwlock"))]
    fn load(&self) -> Arc<Catalog> {
        self.inner.load_full()
    }

    #[cfg(feature = "catalog-rwlock")]
    fn load(&self) -> Arc<Catalog> {
        self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    fn store(&self, catalog: Catalog) {
        #[cfg(not(feature = "catalog-rwlock"))]
        {
            self.inner.store(Arc::new(catalog));
        }
        #[cfg(feature = "catalog-rwlock")]
        {
            let mut inner = self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner);
            *inner = Arc::new(catalog);
        }
    }
}

/// Lookup of feature descriptors by id. Pure reads after load.
#[derive(Debug, Clone)]
pub struct FeatureRegistry {
    catalog: CatalogHandle,
}

impl Default for FeatureRegistry {
    fn default() -> Self {
        Self { catalog: CatalogHandle::new(Catalog::new()) }
    }
}

impl FeatureRegistry {
    /// Build a registry, rejecting invalid or duplicate descriptors.
    pub fn new(
        descriptors: impl IntoIterator<Item = FeatureDescriptor>,
    ) -> Result<Self, ConfigError> {
        Ok(Self { catalog: CatalogHandle::new(build_catalog(descriptors)?) })
    }

    /// Parse a JSON array of descriptors.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let descriptors: Vec<FeatureDescriptor> = serde_json::from_str(json)?;
        Self::new(descriptors)
    }

    /// Descriptor for `id`, if registered.
    pub fn get_feature(&self, id: &str) -> Option<Arc<FeatureDescriptor>> {
        self.catalog.load().get(id).cloned()
    }

    /// Swap in a new catalog. Nothing changes if any descriptor is invalid.
    pub fn replace(
        &self,
        descriptors: impl IntoIterator<Item = FeatureDescriptor>,
    ) -> Result<usize, ConfigError> {
        let catalog = build_catalog(descriptors)?;
        let count = catalog.len();
        self.catalog.store(catalog);
        Ok(count)
    }

    /// Reload from `source`; the previous catalog stays live on failure.
    pub async fn refresh(&self, source: &dyn FeatureCatalogSource) -> Result<usize, ConfigError> {
        let descriptors = source.load().await.map_err(|e| {
            tracing::error!(
                target: "tollgate::registry",
                error = %e,
                "feature catalog refresh failed"
            );
            ConfigError::Source(e)
        })?;
        let count = self.replace(descriptors)?;
        tracing::info!(target: "tollgate::registry", features = count, "feature catalog refreshed");
        Ok(count)
    }

    /// Number of registered features.
    pub fn len(&self) -> usize {
        self.catalog.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalog.load().is_empty()
    }

    /// Feature ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.catalog.load().keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn build_catalog(
    descriptors: impl IntoIterator<Item = FeatureDescriptor>,
) -> Result<Catalog, ConfigError> {
    let mut catalog = Catalog::new();
    for descriptor in descriptors {
        descriptor.validate()?;
        if catalog.contains_key(&descriptor.id) {
            return Err(ConfigError::InvalidFeature {
                id: descriptor.id,
                reason: "duplicate feature id".into(),
            });
        }
        catalog.insert(descriptor.id.clone(), Arc::new(descriptor));
    }
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollout_edges_are_absolute() {
        for i in 0..200 {
            let p = format!("user-{i}");
            assert!(!in_rollout(&p, "beta", 0));
            assert!(in_rollout(&p, "beta", 100));
        }
    }

    #[test]
    fn rollout_is_deterministic_and_feature_scoped() {
        let first = in_rollout("user-42", "beta", 50);
        for _ in 0..10 {
            assert_eq!(in_rollout("user-42", "beta", 50), first);
        }
        assert_eq!(rollout_bucket("user-42", "beta"), rollout_bucket("user-42", "beta"));
        let differs = (0..50).any(|i| {
            let p = format!("user-{i}");
            rollout_bucket(&p, "beta") != rollout_bucket(&p, "gamma")
        });
        assert!(differs, "buckets should depend on the feature id");
    }

    #[test]
    fn fnv1a_matches_reference_vector() {
        // FNV-1a 32 of "a:b" is 0x08bd8540.
        assert_eq!(rollout_bucket("a", "b"), 0x08bd_8540 % 100);
    }

    #[test]
    fn rollout_is_roughly_uniform() {
        let included =
            (0..10_000).filter(|i| in_rollout(&format!("principal-{i}"), "beta", 25)).count();
        assert!((2_000..3_000).contains(&included), "got {included}");
    }

    #[test]
    fn registry_rejects_duplicates_and_bad_descriptors() {
        let dup = FeatureRegistry::new(vec![
            FeatureDescriptor::new("export", Tier::Basic),
            FeatureDescriptor::new("export", Tier::Premium),
        ]);
        assert!(matches!(
            dup,
            Err(ConfigError::InvalidFeature { reason, .. }) if reason.contains("duplicate")
        ));

        let x = || FeatureDescriptor::new("x", Tier::Free);
        assert!(FeatureRegistry::new(vec![x().with_rollout(101)]).is_err());
        assert!(FeatureRegistry::new(vec![x().with_usage_limit(Tier::Free, -5)]).is_err());
    }

    #[test]
    fn limit_for_treats_missing_and_negative_one_as_unlimited() {
        let d = FeatureDescriptor::new("reports", Tier::Basic)
            .with_usage_limit(Tier::Basic, 5)
            .with_usage_limit(Tier::Enterprise, -1);
        assert_eq!(d.limit_for(Tier::Basic), UsageLimit::Max(5));
        assert_eq!(d.limit_for(Tier::Premium), UsageLimit::Unlimited);
        assert_eq!(d.limit_for(Tier::Enterprise), UsageLimit::Unlimited);
    }

    #[test]
    fn loads_catalog_from_json() {
        let json = r#"[
            {"id": "ai_insights", "required_tier": "premium",
             "usage_limits_by_tier": {"premium": 100, "enterprise": -1},
             "rollout_percentage": 50, "required_flags": ["ai"],
             "rate_limit": {"limit": 5, "window_secs": 60},
             "usage_period": "daily"},
            {"id": "export", "required_tier": "basic"}
        ]"#;
        let registry = FeatureRegistry::from_json_str(json).unwrap();
        assert_eq!(registry.ids(), vec!["ai_insights", "export"]);
        let ai = registry.get_feature("ai_insights").unwrap();
        assert_eq!(ai.limit_for(Tier::Premium), UsageLimit::Max(100));
        assert_eq!(ai.usage_period, UsagePeriod::Daily);
        assert_eq!(ai.rate_limit, Some(RateLimitRule { limit: 5, window_secs: 60 }));
        let export = registry.get_feature("export").unwrap();
        assert_eq!(export.rollout_percentage, 100);
        assert_eq!(export.usage_period, UsagePeriod::Monthly);
    }

    #[tokio::test]
    async fn refresh_swaps_catalog_and_keeps_old_one_on_error() {
        let registry =
            FeatureRegistry::new(vec![FeatureDescriptor::new("old", Tier::Free)]).unwrap();
        let reader = registry.clone();

        let count = registry
            .refresh(&StaticCatalog(vec![FeatureDescriptor::new("new", Tier::Basic)]))
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert!(reader.get_feature("old").is_none());
        assert!(reader.get_feature("new").is_some());

        struct Broken;
        #[async_trait]
        impl FeatureCatalogSource for Broken {
            async fn load(&self) -> Result<Vec<FeatureDescriptor>, StoreError> {
                Err(StoreError::Unavailable("config service down".into()))
            }
        }
        assert!(matches!(registry.refresh(&Broken).await, Err(ConfigError::Source(_))));
        assert!(reader.get_feature("new").is_some());
    }
}
