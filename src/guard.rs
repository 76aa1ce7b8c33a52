//! Tower middleware that puts a feature gate in front of a service.
//!
//! A granted call is charged at decision time. If the inner service then
//! fails, the gate reports the failure so the charge is handed back; only
//! calls the inner service completes stay counted.
//!
//! ```rust
//! use tollgate::{AccessDecisionEngine, FeatureDescriptor, FeatureGateLayer, FeatureRegistry};
//! use tollgate::{GateRequest, GuardError, ReasonCode, Tier};
//! use std::sync::Arc;
//! use tower::{service_fn, Layer, ServiceExt};
//!
//! struct Export { user: Option<String> }
//!
//! impl GateRequest for Export {
//!     fn principal(&self) -> Option<&str> {
//!         self.user.as_deref()
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let registry = FeatureRegistry::new([FeatureDescriptor::new("export", Tier::Free)]).unwrap();
//! let engine = Arc::new(AccessDecisionEngine::builder().registry(registry).build().unwrap());
//! let svc = FeatureGateLayer::new(engine, "export")
//!     .layer(service_fn(|_req: Export| async { Ok::<_, std::convert::Infallible>("csv") }));
//!
//! let denied = svc.clone().oneshot(Export { user: None }).await;
//! assert!(matches!(denied, Err(GuardError::Denied(d)) if d.reason == ReasonCode::AuthRequired));
//! assert_eq!(svc.oneshot(Export { user: Some("alice".into()) }).await.unwrap(), "csv");
//! # }
//! ```

use crate::decision::{Decision, RequestContext};
use crate::engine::AccessDecisionEngine;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// A request the gate can identify.
pub trait GateRequest {
    /// The authenticated principal, if any.
    fn principal(&self) -> Option<&str>;

    /// Metadata for auditing.
    fn context(&self) -> RequestContext {
        RequestContext::default()
    }
}

/// Error from a gated service.
#[derive(Debug, thiserror::Error)]
pub enum GuardError<E> {
    /// The gate denied the request; the inner service was not called.
    #[error("access denied: {}", .0.reason)]
    Denied(Decision),
    /// The inner service failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> GuardError<E> {
    /// The denial, if the gate turned the request away.
    pub fn decision(&self) -> Option<&Decision> {
        match self {
            GuardError::Denied(d) => Some(d),
            GuardError::Inner(_) => None,
        }
    }
}

/// Layer that evaluates one feature before every request.
#[derive(Clone, Debug)]
pub struct FeatureGateLayer {
    engine: Arc<AccessDecisionEngine>,
    feature: Arc<str>,
}

impl FeatureGateLayer {
    /// Gate every request on `feature`.
    pub fn new(engine: Arc<AccessDecisionEngine>, feature: impl Into<Arc<str>>) -> Self {
        Self { engine, feature: feature.into() }
    }
}

impl<S> Layer<S> for FeatureGateLayer {
    type Service = FeatureGateService<S>;

    fn layer(&self, service: S) -> Self::Service {
        FeatureGateService {
            inner: service,
            engine: self.engine.clone(),
            feature: self.feature.clone(),
        }
    }
}

/// Service produced by [`FeatureGateLayer`].
#[derive(Clone, Debug)]
pub struct FeatureGateService<S> {
    inner: S,
    engine: Arc<AccessDecisionEngine>,
    feature: Arc<str>,
}

impl<S, Req> Service<Req> for FeatureGateService<S>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    Req: GateRequest + Send + 'static,
{
    type Response = S::Response;
    type Error = GuardError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GuardError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let engine = self.engine.clone();
        let feature = self.feature.clone();
        // Keep the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let ctx = req.context();
            let principal = req.principal().map(str::to_owned);
            let decision = engine.evaluate(principal.as_deref(), &feature, &ctx).await;
            let Some(principal) = principal.filter(|_| decision.allowed) else {
                return Err(GuardError::Denied(decision));
            };
            let result = inner.call(req).await;
            engine.record_outcome(&principal, &feature, &decision, result.is_ok());
            result.map_err(GuardError::Inner)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::ReasonCode;
    use crate::registry::{FeatureDescriptor, FeatureRegistry};
    use crate::subscription::{InMemorySubscriptionStore, SubscriptionRecord};
    use crate::tier::{SubscriptionStatus, Tier};
    use crate::usage::UsagePeriod;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::{service_fn, ServiceExt};

    struct Req {
        user: Option<&'static str>,
    }

    impl GateRequest for Req {
        fn principal(&self) -> Option<&str> {
            self.user
        }

        fn context(&self) -> RequestContext {
            RequestContext::new().with_ip("192.0.2.7")
        }
    }

    fn engine() -> Arc<AccessDecisionEngine> {
        let registry = FeatureRegistry::new([
            FeatureDescriptor::new("reports", Tier::Premium).with_usage_limit(Tier::Premium, 2),
        ])
        .unwrap();
        let store = InMemorySubscriptionStore::with_records([
            SubscriptionRecord::new("paid", Tier::Premium, SubscriptionStatus::Active),
            SubscriptionRecord::new("free", Tier::Free, SubscriptionStatus::Active),
        ]);
        Arc::new(
            AccessDecisionEngine::builder()
                .registry(registry)
                .subscriptions(Arc::new(store))
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn denied_requests_never_reach_inner_service() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let inner = service_fn(move |_req: Req| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::io::Error>("report")
            }
        });
        let engine = engine();
        let svc = FeatureGateLayer::new(engine.clone(), "reports").layer(inner);

        let err = svc.clone().oneshot(Req { user: Some("free") }).await.unwrap_err();
        let decision = err.decision().unwrap();
        assert_eq!(decision.reason, ReasonCode::InsufficientTier);
        assert_eq!(decision.upgrade_tiers, vec![Tier::Premium, Tier::Enterprise]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(svc.oneshot(Req { user: Some("paid") }).await.unwrap(), "report");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let events = engine.monitor().recent_events();
        assert_eq!(events[0].ip.as_deref(), Some("192.0.2.7"));
    }

    fn disk_full(_req: Req) -> std::future::Ready<Result<(), std::io::Error>> {
        std::future::ready(Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full")))
    }

    async fn monthly_usage(engine: &AccessDecisionEngine) -> u64 {
        engine.flush_usage().await;
        engine.usage().current("paid", "reports", UsagePeriod::Monthly).await.unwrap()
    }

    #[tokio::test]
    async fn inner_errors_are_wrapped() {
        let svc = FeatureGateLayer::new(engine(), "reports").layer(service_fn(disk_full));
        let err = svc.oneshot(Req { user: Some("paid") }).await.unwrap_err();
        assert!(matches!(err, GuardError::Inner(_)));
        assert_eq!(err.to_string(), "disk full");
    }

    #[tokio::test]
    async fn failed_calls_do_not_use_up_the_allowance() {
        let engine = engine();
        let failing = FeatureGateLayer::new(engine.clone(), "reports").layer(service_fn(disk_full));
        for _ in 0..4 {
            let err = failing.clone().oneshot(Req { user: Some("paid") }).await.unwrap_err();
            assert!(matches!(err, GuardError::Inner(_)));
            assert_eq!(monthly_usage(&engine).await, 0);
        }

        let working = FeatureGateLayer::new(engine.clone(), "reports")
            .layer(service_fn(|_req: Req| async { Ok::<_, std::io::Error>(()) }));
        for _ in 0..2 {
            working.clone().oneshot(Req { user: Some("paid") }).await.unwrap();
        }
        assert_eq!(monthly_usage(&engine).await, 2);

        let err = working.oneshot(Req { user: Some("paid") }).await.unwrap_err();
        assert_eq!(err.decision().unwrap().reason, ReasonCode::UsageLimitExceeded);
        assert_eq!(monthly_usage(&engine).await, 2);
    }
}
