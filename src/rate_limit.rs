//! Sliding-window request limiting per (principal, feature).
//!
//! The limiter is independent of subscription state: it only counts admitted
//! calls in the trailing window. State lives behind a [`WindowStore`] so the
//! in-memory log can be swapped for a shared backend.
//!
//! Unlike most limiters this one fails closed. If the window store cannot be
//! read the call is denied with a fixed backoff and a CRITICAL
//! `RATE_LIMITER_FAILURE` event is sent to the [`SecurityMonitor`].

use crate::clock::{Clock, SystemClock};
use crate::keys::scoped_key;
use crate::security::{SecurityEvent, SecurityEventKind, SecurityMonitor, Severity};
use std::sync::Arc;
use std::time::Duration;

pub mod store;
pub use store::{InMemoryWindowStore, WindowState, WindowStore};

/// Backoff returned when the window store fails.
pub const DEFAULT_FAILURE_BACKOFF: Duration = Duration::from_secs(300);

/// Result of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    /// Admitted calls in the current window.
    pub current_count: u32,
    /// How long to wait before the next call can be admitted. Set on every denial.
    pub retry_after: Option<Duration>,
    /// The store failed and the denial is the fail-closed fallback.
    pub degraded: bool,
}

impl RateLimitOutcome {
    fn failed(backoff: Duration) -> Self {
        Self { allowed: false, current_count: 0, retry_after: Some(backoff), degraded: true }
    }
}

/// Sliding-window limiter over a [`WindowStore`].
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
    clock: Arc<dyn Clock>,
    failure_backoff: Duration,
    monitor: Option<Arc<SecurityMonitor>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("failure_backoff", &self.failure_backoff)
            .field("monitored", &self.monitor.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryWindowStore::new()))
    }
}

impl RateLimiter {
    /// Limiter over `store` with the system clock and [`DEFAULT_FAILURE_BACKOFF`].
    pub fn new(store: Arc<dyn WindowStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            failure_backoff: DEFAULT_FAILURE_BACKOFF,
            monitor: None,
        }
    }

    /// Take window timestamps from `clock`.
    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        self.with_shared_clock(Arc::new(clock))
    }

    pub fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Retry hint returned when the window store fails.
    pub fn with_failure_backoff(mut self, backoff: Duration) -> Self {
        self.failure_backoff = backoff;
        self
    }

    /// Where store failures are reported.
    pub fn with_monitor(mut self, monitor: Arc<SecurityMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn failure_backoff(&self) -> Duration {
        self.failure_backoff
    }

    /// Try to admit one call for `principal` on `feature`.
    pub async fn check(
        &self,
        principal: &str,
        feature: &str,
        limit: u32,
        window_secs: u64,
    ) -> RateLimitOutcome {
        let now_ms = self.clock.now_millis();
        let window_ms = window_secs.saturating_mul(1_000);
        let key = window_key(principal, feature);

        match self.store.try_acquire(&key, now_ms, window_ms, limit).await {
            Ok(state) if state.allowed => RateLimitOutcome {
                allowed: true,
                current_count: state.count,
                retry_after: None,
                degraded: false,
            },
            Ok(state) => {
                // The window reopens when its oldest admitted call ages out.
                let oldest = state.oldest_ms.unwrap_or(now_ms);
                let reopens_at = oldest.saturating_add(window_ms);
                let wait = Duration::from_millis(reopens_at.saturating_sub(now_ms).max(1));
                tracing::debug!(
                    target: "tollgate::rate_limit",
                    principal,
                    feature,
                    count = state.count,
                    limit,
                    retry_after_ms = wait.as_millis() as u64,
                    "rate limit exceeded"
                );
                RateLimitOutcome {
                    allowed: false,
                    current_count: state.count,
                    retry_after: Some(wait),
                    degraded: false,
                }
            }
            Err(e) => {
                tracing::error!(
                    target: "tollgate::rate_limit",
                    principal,
                    feature,
                    error = %e,
                    "window store failed; denying"
                );
                if let Some(monitor) = &self.monitor {
                    let kind = SecurityEventKind::RateLimiterFailure;
                    let event = SecurityEvent::new(kind, Severity::Critical, self.clock.now())
                        .principal(principal)
                        .feature(feature)
                        .detail("error", &e);
                    monitor.log_event(event).await;
                }
                RateLimitOutcome::failed(self.failure_backoff)
            }
        }
    }

    /// Clear a principal's window for a feature.
    pub async fn reset(
        &self,
        principal: &str,
        feature: &str,
    ) -> Result<(), crate::error::StoreError> {
        self.store.reset(&window_key(principal, feature)).await
    }
}

fn window_key(principal: &str, feature: &str) -> String {
    scoped_key("ratelimit", &[principal, feature])
}
