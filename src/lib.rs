#![forbid(unsafe_code)]
#![warn(missing_debug_implementations, rust_2018_idioms)]

//! # Tollgate
//!
//! Fail-closed feature access decisions for async Rust.
//!
//! A single [`AccessDecisionEngine::evaluate`] call answers "may this principal
//! use this feature right now?" from subscription tier and status, usage
//! allowances, request rate, rollout membership and grace windows. If any
//! dependency fails the answer is a denial, never a silent allow.
//!
//! ## Features
//!
//! - **Subscription cache** with TTL, bounded size and single-flight loads
//! - **Sliding-window rate limiter** that denies when its store is down
//! - **Usage counters** per calendar day and month that a burst cannot overshoot
//! - **Grace periods** after a subscription lapses
//! - **Security monitor** with threshold alerts and risk heuristics
//! - **Tower middleware** to gate any service
//!
//! ## Quick Start
//!
//! ```rust
//! use tollgate::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = FeatureRegistry::new([
//!         FeatureDescriptor::new("ai_insights", Tier::Premium)
//!             .with_usage_limit(Tier::Premium, 100)
//!             .with_usage_limit(Tier::Enterprise, -1)
//!             .with_rate_limit(10, 60),
//!     ])
//!     .unwrap();
//!     let store = InMemorySubscriptionStore::with_records([
//!         SubscriptionRecord::new("alice", Tier::Premium, SubscriptionStatus::Active),
//!     ]);
//!
//!     let engine = AccessDecisionEngine::builder()
//!         .registry(registry)
//!         .subscriptions(Arc::new(store))
//!         .build()
//!         .unwrap();
//!
//!     let ctx = RequestContext::new().with_ip("203.0.113.9");
//!     let decision = engine.evaluate(Some("alice"), "ai_insights", &ctx).await;
//!     assert!(decision.allowed);
//!     assert_eq!(decision.usage_limit, Some(100));
//! }
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod decision;
pub mod engine;
pub mod error;
pub mod grace;
pub mod guard;
mod keys;
pub mod prelude;
pub mod rate_limit;
pub mod registry;
pub mod security;
pub mod subscription;
pub mod tier;
pub mod usage;

// Re-exports
pub use cache::{CacheEntry, CacheStats, SubscriptionCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::GateConfig;
pub use decision::{Decision, ReasonCode, RequestContext};
pub use engine::{AccessDecisionEngine, AccessDecisionEngineBuilder};
pub use error::{ConfigError, StoreError};
pub use grace::{GracePeriodManager, GraceStatus};
pub use guard::{FeatureGateLayer, FeatureGateService, GateRequest, GuardError};
pub use rate_limit::{
    InMemoryWindowStore, RateLimitOutcome, RateLimiter, WindowState, WindowStore,
};
pub use registry::{
    in_rollout, FeatureCatalogSource, FeatureDescriptor, FeatureRegistry, RateLimitRule,
    StaticCatalog,
};
pub use security::{
    Alert, AlertRule, AuditEntry, MonitorConfig, RiskAssessment, RiskLevel, SecurityEvent,
    SecurityEventKind, SecurityMonitor, SecuritySink, Severity,
};
pub use subscription::{InMemorySubscriptionStore, SubscriptionRecord, SubscriptionStore};
pub use tier::{SubscriptionStatus, Tier};
pub use usage::{
    InMemoryUsageStore, UsageCounter, UsageLimit, UsagePeriod, UsageRecord, UsageRecorder,
    UsageState, UsageStore,
};
