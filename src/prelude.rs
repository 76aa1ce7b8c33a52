//! Convenient re-exports for common Tollgate types.
pub use crate::{
    clock::{Clock, ManualClock, SystemClock},
    config::GateConfig,
    decision::{Decision, ReasonCode, RequestContext},
    engine::AccessDecisionEngine,
    error::{ConfigError, StoreError},
    guard::{FeatureGateLayer, GateRequest, GuardError},
    registry::{FeatureDescriptor, FeatureRegistry},
    security::{LogSink, MemorySink, NonBlockingSink, SecurityEventKind, SecurityMonitor, Severity},
    subscription::{InMemorySubscriptionStore, SubscriptionRecord, SubscriptionStore},
    tier::{SubscriptionStatus, Tier},
    usage::UsagePeriod,
};
